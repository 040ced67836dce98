//! OpenAI chat-completions adapter.
//!
//! Reasoning-tier models (`o*`, and names containing `4o` or `-o`) take
//! `max_completion_tokens` instead of `max_tokens`; the adapter rewrites the
//! key transparently both when the option is set and at final merge, so
//! callers always write `max_tokens`.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::{json, Map, Value};

use crate::capabilities::{
    registry, Capability, CapabilityConfig, DataFormat, FunctionCallingConfig, ImageFormat,
    SchemaType, StreamingConfig, StructuredResponseConfig, VisionConfig,
};
use crate::config::Config;
use crate::error::Error;
use crate::schema;
use crate::types::{Request, Response};
use crate::Result;

use super::openai_compat::{convert_messages, convert_tools, parse_chat_response, parse_chat_stream};
use super::{
    ensure_messages, is_global_option, merge_remaining_options, resolve_model,
    resolve_system_prompt, tools_from_options, OptionMap, Provider, StreamFrame, OPENAI,
};

const KEY_MAX_TOKENS: &str = "max_tokens";
const KEY_MAX_COMPLETION_TOKENS: &str = "max_completion_tokens";

/// Adapter for `https://api.openai.com/v1/chat/completions`.
pub struct OpenAiProvider {
    api_key: String,
    model: String,
    extra_headers: RwLock<HashMap<String, String>>,
    options: RwLock<HashMap<String, Value>>,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, extra_headers: HashMap<String, String>) -> Self {
        let provider = Self {
            api_key: api_key.into(),
            model: model.into(),
            extra_headers: RwLock::new(extra_headers),
            options: RwLock::new(HashMap::new()),
        };
        provider.register_capabilities();
        provider
    }

    /// Whether the bound model wants `max_completion_tokens`.
    fn needs_max_completion_tokens(&self) -> bool {
        self.model.starts_with('o') || self.model.contains("4o") || self.model.contains("-o")
    }

    fn register_capabilities(&self) {
        let reg = registry();

        let all_models = [
            // GPT-4o
            "gpt-4o",
            "gpt-4o-mini",
            "gpt-4o-2024-11-20",
            "gpt-4o-2024-08-06",
            "gpt-4o-2024-05-13",
            "gpt-4o-mini-2024-07-18",
            // GPT-4 Turbo
            "gpt-4-turbo",
            "gpt-4-turbo-2024-04-09",
            "gpt-4-turbo-preview",
            "gpt-4-0125-preview",
            "gpt-4-1106-preview",
            "gpt-4-turbo-vision-preview",
            // GPT-4
            "gpt-4",
            "gpt-4-0613",
            "gpt-4-0314",
            "gpt-4-vision-preview",
            // GPT-3.5 Turbo
            "gpt-3.5-turbo",
            "gpt-3.5-turbo-0125",
            "gpt-3.5-turbo-1106",
            "gpt-3.5-turbo-0613",
            "gpt-3.5-turbo-16k",
            "gpt-3.5-turbo-16k-0613",
            // o1 family
            "o1-preview",
            "o1-mini",
            "o1-preview-2024-09-12",
            "o1-mini-2024-09-12",
        ];

        let param_types = vec![
            SchemaType::Object,
            SchemaType::Array,
            SchemaType::String,
            SchemaType::Number,
            SchemaType::Boolean,
        ];

        for model in all_models {
            // o1 models expose none of the optional capabilities.
            if model.starts_with("o1") {
                continue;
            }

            if model.starts_with("gpt-4") {
                reg.register(
                    OPENAI,
                    model,
                    Capability::StructuredResponse,
                    CapabilityConfig::StructuredResponse(StructuredResponseConfig {
                        requires_tool_use: false,
                        requires_json_mode: true,
                        max_schema_depth: 15,
                        max_properties: 100,
                        supported_formats: vec![DataFormat::Json],
                        supported_types: param_types.clone(),
                        system_prompt_hint: String::new(),
                    }),
                );
            } else if model == "gpt-3.5-turbo-0125" || model == "gpt-3.5-turbo-1106" {
                reg.register(
                    OPENAI,
                    model,
                    Capability::StructuredResponse,
                    CapabilityConfig::StructuredResponse(StructuredResponseConfig {
                        requires_tool_use: false,
                        requires_json_mode: true,
                        max_schema_depth: 10,
                        max_properties: 100,
                        supported_formats: vec![DataFormat::Json],
                        supported_types: param_types.clone(),
                        system_prompt_hint: String::new(),
                    }),
                );
            }

            if model.starts_with("gpt-4") {
                reg.register(
                    OPENAI,
                    model,
                    Capability::FunctionCalling,
                    CapabilityConfig::FunctionCalling(FunctionCallingConfig {
                        max_functions: 128,
                        max_parallel_calls: 10,
                        supports_parallel: true,
                        requires_tool_role: false,
                        supports_streaming: true,
                        supported_parameter_types: param_types.clone(),
                        max_nesting_depth: 10,
                    }),
                );
            } else if model.starts_with("gpt-3.5-turbo") {
                reg.register(
                    OPENAI,
                    model,
                    Capability::FunctionCalling,
                    CapabilityConfig::FunctionCalling(FunctionCallingConfig {
                        max_functions: 64,
                        max_parallel_calls: 5,
                        supports_parallel: true,
                        requires_tool_role: false,
                        supports_streaming: false,
                        supported_parameter_types: param_types.clone(),
                        max_nesting_depth: 10,
                    }),
                );
            }

            reg.register(
                OPENAI,
                model,
                Capability::Streaming,
                CapabilityConfig::Streaming(StreamingConfig {
                    chunk_delimiter: "data: ".into(),
                    buffer_size: 4096,
                    supports_sse: true,
                    supports_usage: model.starts_with("gpt-4"),
                }),
            );

            if ["gpt-4o", "gpt-4-turbo", "gpt-4-vision"]
                .iter()
                .any(|prefix| model.starts_with(prefix))
            {
                reg.register(
                    OPENAI,
                    model,
                    Capability::Vision,
                    CapabilityConfig::Vision(VisionConfig {
                        max_image_size: 20 * 1024 * 1024,
                        max_images_per_request: 10,
                        supported_formats: vec![
                            ImageFormat::Jpeg,
                            ImageFormat::Png,
                            ImageFormat::Gif,
                            ImageFormat::Webp,
                        ],
                        supports_video_frames: model.contains("4o"),
                        supports_ocr: true,
                        supports_image_generation: false,
                        supports_object_detection: false,
                    }),
                );
            }
        }
    }

    fn build_body(&self, req: &Request, options: &OptionMap, stream: bool) -> Result<Vec<u8>> {
        ensure_messages(req)?;
        let model = resolve_model(&self.model, req, options);

        let mut body = Map::new();
        body.insert("model".into(), json!(model));

        let mut messages: Vec<Value> = Vec::new();
        if let Some(system_prompt) = resolve_system_prompt(req, options) {
            messages.push(json!({"role": "system", "content": system_prompt}));
        }
        messages.extend(convert_messages(&req.messages));
        body.insert("messages".into(), Value::Array(messages));

        if stream {
            body.insert("stream".into(), json!(true));
            body.insert("stream_options".into(), json!({"include_usage": true}));
        }

        let tools = tools_from_options(options);
        if !tools.is_empty() {
            body.insert("tools".into(), Value::Array(convert_tools(&tools, true)));
            let choice = options
                .get("tool_choice")
                .and_then(Value::as_str)
                .unwrap_or("auto");
            body.insert("tool_choice".into(), json!(choice));
        }

        if let Some(response_schema) = &req.response_schema {
            if self.has_capability(Capability::StructuredResponse, Some(&model)) {
                if let Ok(cfg) =
                    registry().get_typed::<StructuredResponseConfig>(OPENAI, &model)
                {
                    schema::check_schema_limits(response_schema, &cfg)?;
                }
                body.insert(
                    "response_format".into(),
                    json!({
                        "type": "json_schema",
                        "json_schema": {
                            "name": "response",
                            "schema": schema::stripped_schema(response_schema),
                            "strict": true,
                        },
                    }),
                );
            }
        }

        let defaults = self.options.read().expect("options lock poisoned").clone();
        merge_remaining_options(&mut body, &defaults, options, is_global_option);
        self.reconcile_token_parameters(&mut body);

        serde_json::to_vec(&Value::Object(body)).map_err(Error::from)
    }

    /// Keep exactly one of the two token-limit keys, matching what the bound
    /// model accepts.
    fn reconcile_token_parameters(&self, body: &mut Map<String, Value>) {
        if self.needs_max_completion_tokens() {
            if let Some(v) = body.remove(KEY_MAX_TOKENS) {
                body.insert(KEY_MAX_COMPLETION_TOKENS.into(), v);
            }
        } else if let Some(v) = body.remove(KEY_MAX_COMPLETION_TOKENS) {
            body.insert(KEY_MAX_TOKENS.into(), v);
        }
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        OPENAI
    }

    fn endpoint(&self) -> String {
        "https://api.openai.com/v1/chat/completions".to_string()
    }

    fn headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key),
            ),
        ]);
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
            self.set_option(KEY_MAX_TOKENS, json!(m));
        }
        if let Some(seed) = cfg.seed {
            self.set_option("seed", json!(seed));
        }
        if let Some(top_p) = cfg.top_p {
            self.set_option("top_p", json!(top_p));
        }
    }

    fn set_option(&self, key: &str, value: Value) {
        let mut options = self.options.write().expect("options lock poisoned");
        let key = match key {
            KEY_MAX_TOKENS if self.needs_max_completion_tokens() => {
                options.remove(KEY_MAX_TOKENS);
                KEY_MAX_COMPLETION_TOKENS
            }
            KEY_MAX_TOKENS => {
                options.remove(KEY_MAX_COMPLETION_TOKENS);
                KEY_MAX_TOKENS
            }
            KEY_MAX_COMPLETION_TOKENS => {
                options.remove(KEY_MAX_TOKENS);
                KEY_MAX_COMPLETION_TOKENS
            }
            other => other,
        };
        tracing::debug!(key, %value, "openai option set");
        options.insert(key.to_string(), value);
    }

    fn prepare_request(&self, req: &Request, options: &OptionMap) -> Result<Vec<u8>> {
        self.build_body(req, options, false)
    }

    fn prepare_stream_request(&self, req: &Request, options: &OptionMap) -> Result<Vec<u8>> {
        let model = resolve_model(&self.model, req, options);
        if !self.has_capability(Capability::Streaming, Some(&model)) {
            return Err(Error::CapabilityNotSupported {
                provider: OPENAI.to_string(),
                model,
                capability: Capability::Streaming,
            });
        }
        self.build_body(req, options, true)
    }

    fn parse_response(&self, body: &[u8]) -> Result<Response> {
        parse_chat_response(body)
    }

    fn parse_stream_response(&self, chunk: &[u8]) -> Result<StreamFrame> {
        parse_chat_stream(chunk)
    }

    fn has_capability(&self, capability: Capability, model: Option<&str>) -> bool {
        let target = model.filter(|m| !m.is_empty()).unwrap_or(&self.model);
        registry().has_capability(OPENAI, target, capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn request(text: &str) -> Request {
        Request {
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }

    #[test]
    fn reasoning_model_rewrites_max_tokens() {
        let provider = OpenAiProvider::new("key", "o1-preview", HashMap::new());
        provider.set_option(KEY_MAX_TOKENS, json!(512));

        let body = provider.prepare_request(&request("hi"), &OptionMap::new()).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body[KEY_MAX_COMPLETION_TOKENS], 512);
        assert!(body.get(KEY_MAX_TOKENS).is_none());
    }

    #[test]
    fn standard_model_keeps_max_tokens() {
        let provider = OpenAiProvider::new("key", "gpt-4", HashMap::new());
        provider.set_option(KEY_MAX_COMPLETION_TOKENS, json!(256));

        let body = provider.prepare_request(&request("hi"), &OptionMap::new()).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body[KEY_MAX_TOKENS], 256);
        assert!(body.get(KEY_MAX_COMPLETION_TOKENS).is_none());
    }

    #[test]
    fn repeated_set_option_keeps_last_value() {
        let provider = OpenAiProvider::new("key", "gpt-4", HashMap::new());
        provider.set_option("temperature", json!(0.2));
        provider.set_option("temperature", json!(0.9));

        let body = provider.prepare_request(&request("hi"), &OptionMap::new()).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["temperature"], 0.9);
    }

    #[test]
    fn structured_output_uses_json_schema_format() {
        let provider = OpenAiProvider::new("key", "gpt-4o", HashMap::new());
        let req = Request {
            messages: vec![Message::user("hi")],
            response_schema: Some(serde_json::json!({
                "type": "object",
                "properties": {"x": {"type": "string"}}
            })),
            ..Default::default()
        };
        let body = provider.prepare_request(&req, &OptionMap::new()).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(
            body["response_format"]["json_schema"]["schema"]["properties"]["x"]["type"],
            "string"
        );
    }

    #[test]
    fn stream_request_carries_usage_option() {
        let provider = OpenAiProvider::new("key", "gpt-4o", HashMap::new());
        let body = provider
            .prepare_stream_request(&request("hi"), &OptionMap::new())
            .unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn o1_has_no_streaming_registration() {
        let provider = OpenAiProvider::new("key", "o1-preview", HashMap::new());
        let err = provider
            .prepare_stream_request(&request("hi"), &OptionMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityNotSupported { .. }));
    }

    #[test]
    fn system_prompt_becomes_leading_message() {
        let provider = OpenAiProvider::new("key", "gpt-4", HashMap::new());
        let req = Request {
            messages: vec![Message::user("hi")],
            system_prompt: Some("be brief".into()),
            ..Default::default()
        };
        let body = provider.prepare_request(&req, &OptionMap::new()).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["role"], "user");
    }
}
