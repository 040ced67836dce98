//! Google Gemini generateContent 适配器 — 角色重映射、generationConfig 折叠与模式相关端点。
//!
//! Google Gemini adapter. Vendor specifics:
//! - The endpoint depends on mode: `…:generateContent` for unary,
//!   `…:streamGenerateContent?alt=sse` for streaming.
//! - Auth differs by mode as well: `Authorization: Bearer` unary,
//!   `x-goog-api-key` streaming. The asymmetry is inherited from the upstream
//!   client this adapter is modeled on.
//! - Roles remap: assistant→model, tool→function; system messages inside the
//!   message list are dropped (the system prompt rides `systemInstruction`).
//! - Sampling options fold into `generationConfig` at merge time.
//! - Structured output uses `generationConfig.responseMimeType` +
//!   `responseSchema`; JSON-Schema meta keys must never reach the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::capabilities::{
    registry, Capability, CapabilityConfig, DataFormat, FunctionCallingConfig, ImageFormat,
    SchemaType, StreamingConfig, StructuredResponseConfig, SystemPromptConfig, VisionConfig,
};
use crate::config::Config;
use crate::error::Error;
use crate::schema;
use crate::types::{Request, Response, Role, Usage};
use crate::Result;

use super::{
    ensure_messages, format_function_call, is_global_option, resolve_model, resolve_system_prompt,
    tools_from_options, OptionMap, Provider, StreamFrame, GEMINI,
};

/// Option keys the Gemini adapter folds into `generationConfig` instead of
/// passing through.
const GENERATION_KEYS: [&str; 6] =
    ["temperature", "max_tokens", "top_p", "top_k", "stop_sequences", "seed"];

/// Adapter for the Google Generative Language API.
pub struct GeminiProvider {
    api_key: String,
    model: String,
    /// Model used for endpoint construction; per-call overrides land here.
    active_model: RwLock<String>,
    stream_mode: AtomicBool,
    extra_headers: RwLock<HashMap<String, String>>,
    options: RwLock<HashMap<String, Value>>,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, extra_headers: HashMap<String, String>) -> Self {
        let model = model.into();
        let provider = Self {
            api_key: api_key.into(),
            active_model: RwLock::new(model.clone()),
            model,
            stream_mode: AtomicBool::new(false),
            extra_headers: RwLock::new(extra_headers),
            options: RwLock::new(HashMap::new()),
        };
        provider.register_capabilities();
        provider
    }

    fn register_capabilities(&self) {
        let reg = registry();

        let all_models = [
            "gemini-2.5-pro",
            "gemini-2.5-flash",
            "gemini-2.5-flash-lite",
            "gemini-2.0-pro",
            "gemini-2.0-flash",
            "gemini-2.0-flash-lite",
            "gemini-1.5-pro",
            "gemini-1.5-pro-latest",
            "gemini-1.5-flash",
            "gemini-1.5-flash-latest",
            "gemini-1.5-flash-8b",
            "gemini-1.5-flash-8b-latest",
            "gemini-1.0-pro",
            "gemini-1.0-pro-latest",
            "gemini-1.0-pro-vision",
            "gemini-1.0-pro-vision-latest",
            "gemini-pro",
            "gemini-pro-vision",
            "gemini-flash",
        ];

        let structured_models = [
            "gemini-2.5-pro",
            "gemini-2.5-flash",
            "gemini-2.5-flash-lite",
            "gemini-2.0-pro",
            "gemini-2.0-flash",
            "gemini-2.0-flash-lite",
            "gemini-1.5-pro",
            "gemini-1.5-pro-latest",
            "gemini-1.5-flash",
            "gemini-1.5-flash-latest",
        ];

        let function_calling_models = [
            "gemini-2.5-pro",
            "gemini-2.5-flash",
            "gemini-2.5-flash-lite",
            "gemini-2.0-pro",
            "gemini-2.0-flash",
            "gemini-2.0-flash-lite",
            "gemini-1.5-pro",
            "gemini-1.5-pro-latest",
            "gemini-1.5-flash",
            "gemini-1.5-flash-latest",
            "gemini-1.0-pro",
            "gemini-1.0-pro-latest",
        ];

        let vision_models = [
            "gemini-2.5-pro",
            "gemini-2.5-flash",
            "gemini-2.5-flash-lite",
            "gemini-2.0-pro",
            "gemini-2.0-flash",
            "gemini-2.0-flash-lite",
            "gemini-1.5-pro",
            "gemini-1.5-pro-latest",
            "gemini-1.5-flash",
            "gemini-1.5-flash-latest",
            "gemini-1.0-pro-vision",
            "gemini-1.0-pro-vision-latest",
            "gemini-pro-vision",
        ];

        let param_types = vec![
            SchemaType::Object,
            SchemaType::Array,
            SchemaType::String,
            SchemaType::Number,
            SchemaType::Boolean,
        ];

        for model in all_models {
            if structured_models.contains(&model) {
                reg.register(
                    GEMINI,
                    model,
                    Capability::StructuredResponse,
                    CapabilityConfig::StructuredResponse(StructuredResponseConfig {
                        requires_tool_use: false,
                        requires_json_mode: false,
                        max_schema_depth: 10,
                        max_properties: 100,
                        supported_formats: vec![DataFormat::Json],
                        supported_types: param_types.clone(),
                        system_prompt_hint: String::new(),
                    }),
                );
            }

            if function_calling_models.contains(&model) {
                reg.register(
                    GEMINI,
                    model,
                    Capability::FunctionCalling,
                    CapabilityConfig::FunctionCalling(FunctionCallingConfig {
                        max_functions: 64,
                        max_parallel_calls: 5,
                        supports_parallel: true,
                        requires_tool_role: false,
                        supports_streaming: true,
                        supported_parameter_types: param_types.clone(),
                        max_nesting_depth: 10,
                    }),
                );
            }

            if vision_models.contains(&model) {
                reg.register(
                    GEMINI,
                    model,
                    Capability::Vision,
                    CapabilityConfig::Vision(VisionConfig {
                        max_image_size: 20 * 1024 * 1024,
                        max_images_per_request: 16,
                        supported_formats: vec![
                            ImageFormat::Jpeg,
                            ImageFormat::Png,
                            ImageFormat::Gif,
                            ImageFormat::Webp,
                        ],
                        supports_video_frames: false,
                        supports_ocr: true,
                        supports_image_generation: false,
                        supports_object_detection: false,
                    }),
                );
            }

            reg.register(
                GEMINI,
                model,
                Capability::Streaming,
                CapabilityConfig::Streaming(StreamingConfig {
                    chunk_delimiter: "data: ".into(),
                    buffer_size: 4096,
                    supports_sse: true,
                    supports_usage: true,
                }),
            );

            reg.register(
                GEMINI,
                model,
                Capability::SystemPrompt,
                CapabilityConfig::SystemPrompt(SystemPromptConfig {
                    max_length: 32768,
                    supports_multiple: false,
                }),
            );
        }
    }

    fn message_to_content(msg: &crate::types::Message) -> Option<Value> {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "model",
            Role::Tool => "function",
            // The system prompt travels as systemInstruction.
            Role::System => return None,
        };

        let mut parts: Vec<Value> = Vec::new();
        if !msg.content.is_empty() {
            parts.push(json!({"text": msg.content}));
        }
        for call in &msg.tool_calls {
            let args: Value =
                serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
            parts.push(json!({
                "functionCall": {"name": call.function.name, "args": args},
            }));
        }

        Some(json!({"role": role, "parts": parts}))
    }

    fn is_generation_key(key: &str) -> bool {
        GENERATION_KEYS.contains(&key) || key == "function_call_mode"
    }

    fn generation_config(&self) -> Map<String, Value> {
        let options = self.options.read().expect("options lock poisoned");
        let mut config = Map::new();
        if let Some(v) = options.get("temperature") {
            config.insert("temperature".into(), v.clone());
        }
        if let Some(v) = options.get("max_tokens") {
            config.insert("maxOutputTokens".into(), v.clone());
        }
        if let Some(v) = options.get("top_p") {
            config.insert("topP".into(), v.clone());
        }
        if let Some(v) = options.get("top_k") {
            config.insert("topK".into(), v.clone());
        }
        if let Some(v) = options.get("stop_sequences") {
            config.insert("stopSequences".into(), v.clone());
        }
        if let Some(v) = options.get("seed") {
            config.insert("seed".into(), v.clone());
        }
        config
    }

    fn build_body(&self, req: &Request, options: &OptionMap) -> Result<Vec<u8>> {
        ensure_messages(req)?;
        let model = resolve_model(&self.model, req, options);
        *self.active_model.write().expect("model lock poisoned") = model.clone();

        let mut body = Map::new();

        if let Some(system_prompt) = resolve_system_prompt(req, options) {
            body.insert(
                "systemInstruction".into(),
                json!({"parts": [{"text": system_prompt}]}),
            );
        }

        let tools = tools_from_options(options);
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.function.name,
                        "description": tool.function.description.clone().unwrap_or_default(),
                        "parameters": tool.function.parameters,
                    })
                })
                .collect();
            body.insert(
                "tools".into(),
                json!([{"functionDeclarations": declarations}]),
            );
            if let Some(mode) = options.get("function_call_mode").and_then(Value::as_str) {
                body.insert(
                    "toolConfig".into(),
                    json!({"functionCallingConfig": {"mode": mode}}),
                );
            }
        }

        let mut generation_config = self.generation_config();

        if let Some(response_schema) = &req.response_schema {
            if self.has_capability(Capability::StructuredResponse, Some(&model)) {
                if let Ok(cfg) = registry().get_typed::<StructuredResponseConfig>(GEMINI, &model) {
                    schema::check_schema_limits(response_schema, &cfg)?;
                }
                generation_config.insert("responseMimeType".into(), json!("application/json"));
                generation_config.insert(
                    "responseSchema".into(),
                    schema::stripped_schema(response_schema),
                );
            }
        }

        let contents: Vec<Value> = req
            .messages
            .iter()
            .filter_map(Self::message_to_content)
            .collect();
        body.insert("contents".into(), Value::Array(contents));

        if !generation_config.is_empty() {
            body.insert("generationConfig".into(), Value::Object(generation_config));
        }

        let defaults = self.options.read().expect("options lock poisoned").clone();
        for (k, v) in defaults.iter().chain(options.iter()) {
            if !is_global_option(k) && !Self::is_generation_key(k) {
                body.insert(k.clone(), v.clone());
            }
        }

        serde_json::to_vec(&Value::Object(body)).map_err(Error::from)
    }
}

impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        GEMINI
    }

    fn endpoint(&self) -> String {
        let active = self.active_model.read().expect("model lock poisoned");
        let model_path = if active.starts_with("models/") {
            active.clone()
        } else {
            format!("models/{active}")
        };
        if self.stream_mode.load(Ordering::Acquire) {
            format!(
                "https://generativelanguage.googleapis.com/v1beta/{model_path}:streamGenerateContent?alt=sse"
            )
        } else {
            format!("https://generativelanguage.googleapis.com/v1beta/{model_path}:generateContent")
        }
    }

    fn headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::from([(
            "Content-Type".to_string(),
            "application/json".to_string(),
        )]);
        if self.stream_mode.load(Ordering::Acquire) {
            headers.insert("x-goog-api-key".to_string(), self.api_key.clone());
            headers.insert("Accept".to_string(), "text/event-stream".to_string());
        } else {
            headers.insert(
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key),
            );
        }
        for (k, v) in self.extra_headers.read().expect("headers lock poisoned").iter() {
            headers.insert(k.clone(), v.clone());
        }
        headers
    }

    fn set_extra_headers(&self, extra: HashMap<String, String>) {
        *self.extra_headers.write().expect("headers lock poisoned") = extra;
    }

    fn set_default_options(&self, cfg: &Config) {
        if let Some(t) = cfg.temperature {
            self.set_option("temperature", json!(t));
        }
        if let Some(m) = cfg.max_tokens {
            self.set_option("max_tokens", json!(m));
        }
        if let Some(seed) = cfg.seed {
            self.set_option("seed", json!(seed));
        }
        if let Some(top_p) = cfg.top_p {
            self.set_option("top_p", json!(top_p));
        }
        if let Some(top_k) = cfg.top_k {
            self.set_option("top_k", json!(top_k));
        }
        if let Some(stop) = &cfg.stop_sequences {
            self.set_option("stop_sequences", json!(stop));
        }
    }

    fn set_option(&self, key: &str, value: Value) {
        self.options
            .write()
            .expect("options lock poisoned")
            .insert(key.to_string(), value);
    }

    fn prepare_request(&self, req: &Request, options: &OptionMap) -> Result<Vec<u8>> {
        self.stream_mode.store(false, Ordering::Release);
        self.build_body(req, options)
    }

    fn prepare_stream_request(&self, req: &Request, options: &OptionMap) -> Result<Vec<u8>> {
        let model = resolve_model(&self.model, req, options);
        if !self.has_capability(Capability::Streaming, Some(&model)) {
            return Err(Error::CapabilityNotSupported {
                provider: GEMINI.to_string(),
                model,
                capability: Capability::Streaming,
            });
        }
        self.stream_mode.store(true, Ordering::Release);
        self.build_body(req, options)
    }

    fn parse_response(&self, body: &[u8]) -> Result<Response> {
        let response: GenerateResponse = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;

        let candidate = response.candidates.first().ok_or(Error::EmptyResponse)?;
        if candidate.content.parts.is_empty() {
            return Err(Error::EmptyResponse);
        }

        let mut text = String::new();
        for part in &candidate.content.parts {
            if let Some(t) = &part.text {
                text.push_str(t);
            }
            if let Some(call) = &part.function_call {
                text.push_str(&render_function_call(call));
            }
        }

        let mut resp = Response::text(text);
        resp.usage = response.usage_metadata.as_ref().map(WireUsage::to_usage);
        Ok(resp)
    }

    fn parse_stream_response(&self, chunk: &[u8]) -> Result<StreamFrame> {
        let text = std::str::from_utf8(chunk)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;
        // Defensive: the framer already removes SSE field names, but raw
        // chunks may still carry the prefix when fed directly.
        let data = text.strip_prefix("data: ").unwrap_or(text).trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(StreamFrame::Skip);
        }

        let response: GenerateResponse = match serde_json::from_str(data) {
            Ok(resp) => resp,
            // Malformed chunks are dropped; the next frame usually completes.
            Err(_) => return Ok(StreamFrame::Skip),
        };

        let usage = response.usage_metadata.as_ref().map(WireUsage::to_usage);

        let Some(candidate) = response.candidates.first() else {
            // Usage-only frames arrive with no candidates at all.
            return match usage {
                Some(usage) => Ok(StreamFrame::Token(Response::usage_only(usage))),
                None => Ok(StreamFrame::Skip),
            };
        };

        let mut text = String::new();
        for part in &candidate.content.parts {
            if let Some(t) = &part.text {
                text.push_str(t);
            }
            if let Some(call) = &part.function_call {
                text.push_str(&render_function_call(call));
            }
        }

        if text.is_empty() {
            return match usage {
                Some(usage) => Ok(StreamFrame::Token(Response::usage_only(usage))),
                None => Ok(StreamFrame::Skip),
            };
        }

        let mut resp = Response::text(text);
        resp.usage = usage;
        Ok(StreamFrame::Token(resp))
    }

    fn has_capability(&self, capability: Capability, model: Option<&str>) -> bool {
        let target = model.filter(|m| !m.is_empty()).unwrap_or(&self.model);
        registry().has_capability(GEMINI, target, capability)
    }
}

fn render_function_call(call: &WireFunctionCall) -> String {
    let args = call
        .args
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_else(|| "{}".to_string());
    format_function_call(&call.name, &args)
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "functionCall")]
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    #[serde(default)]
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    cached_content_token_count: u64,
}

impl WireUsage {
    fn to_usage(&self) -> Usage {
        Usage::new(
            self.prompt_token_count,
            0,
            self.candidates_token_count,
            self.cached_content_token_count,
            0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn provider() -> GeminiProvider {
        GeminiProvider::new("key", "gemini-2.0-flash", HashMap::new())
    }

    fn request(text: &str) -> Request {
        Request {
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }

    #[test]
    fn endpoint_depends_on_mode() {
        let p = provider();
        assert!(p.endpoint().ends_with(":generateContent"));
        p.prepare_stream_request(&request("hi"), &OptionMap::new())
            .unwrap();
        assert!(p.endpoint().ends_with(":streamGenerateContent?alt=sse"));
        assert!(p.headers().contains_key("x-goog-api-key"));
    }

    #[test]
    fn roles_are_remapped() {
        let req = Request {
            messages: vec![
                Message::user("q"),
                Message::assistant("a"),
                Message::system("dropped"),
                Message::tool("id", "result"),
            ],
            ..Default::default()
        };
        let body = provider().prepare_request(&req, &OptionMap::new()).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "function");
    }

    #[test]
    fn structured_schema_is_stripped_of_meta_keys() {
        let req = Request {
            messages: vec![Message::user("hi")],
            response_schema: Some(json!({
                "$schema": "https://json-schema.org/draft/2020-12/schema",
                "$id": "https://example.com/answer",
                "type": "object",
                "properties": {
                    "x": {"$ref": "#/$defs/X", "type": "string"}
                },
                "$defs": {"X": {"type": "string"}}
            })),
            ..Default::default()
        };
        let body = provider().prepare_request(&req, &OptionMap::new()).unwrap();
        let rendered = String::from_utf8(body.clone()).unwrap();
        for key in ["$schema", "$id", "$defs", "$ref"] {
            assert!(!rendered.contains(key), "{key} leaked into wire body");
        }
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert!(body["generationConfig"]["responseSchema"].is_object());
    }

    #[test]
    fn sampling_options_fold_into_generation_config() {
        let p = provider();
        p.set_default_options(
            &Config::new()
                .with_temperature(0.5)
                .with_max_tokens(2048)
                .with_top_p(0.9),
        );
        let body = p.prepare_request(&request("hi"), &OptionMap::new()).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["generationConfig"]["temperature"], 0.5);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(body["generationConfig"]["topP"], 0.9);
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn tools_use_function_declarations() {
        let mut options = OptionMap::new();
        options.insert(
            "tools".into(),
            serde_json::to_value(vec![crate::types::Tool::new(
                "lookup",
                "find things",
                json!({"type": "object"}),
            )])
            .unwrap(),
        );
        let body = provider().prepare_request(&request("hi"), &options).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "lookup"
        );
    }

    #[test]
    fn parse_response_joins_parts() {
        let body = br#"{
            "candidates": [{"content": {"role": "model", "parts": [
                {"text": "Hi"},
                {"functionCall": {"name": "f", "args": {"k": 1}}}
            ]}}],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 3,
                              "cachedContentTokenCount": 2}
        }"#;
        let resp = provider().parse_response(body).unwrap();
        assert!(resp.as_text().starts_with("Hi"));
        assert!(resp.as_text().contains(r#""function_call""#));
        let usage = resp.usage.unwrap();
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 3);
        assert_eq!(usage.cache_read_tokens, 2);
    }

    #[test]
    fn parse_response_without_candidates_is_empty() {
        assert!(matches!(
            provider().parse_response(b"{}"),
            Err(Error::EmptyResponse)
        ));
    }

    #[test]
    fn usage_only_stream_frame_yields_usage_token() {
        let chunk = br#"{"usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 4}}"#;
        match provider().parse_stream_response(chunk).unwrap() {
            StreamFrame::Token(resp) => {
                assert_eq!(resp.as_text(), "");
                assert_eq!(resp.usage.unwrap().input_tokens, 7);
            }
            other => panic!("expected usage token, got {other:?}"),
        }
    }

    #[test]
    fn stream_text_parts_concatenate() {
        let chunk =
            br#"data: {"candidates":[{"content":{"parts":[{"text":"Wor"},{"text":"ld"}]}}]}"#;
        match provider().parse_stream_response(chunk).unwrap() {
            StreamFrame::Token(resp) => assert_eq!(resp.as_text(), "World"),
            other => panic!("expected token, got {other:?}"),
        }
    }
}
