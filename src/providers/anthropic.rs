//! Anthropic Messages API 适配器 — 系统提示分段、缓存控制与 SSE 事件解码。
//!
//! Anthropic Messages API adapter. The vendor-specific parts:
//! - System prompt is an ordered array of `{type:"text", text}` parts; long
//!   prompts split at paragraph boundaries into at most
//!   [`SYSTEM_PROMPT_MAX_PARTS`] segments, and every segment after the first
//!   gets `cache_control: {type:"ephemeral"}`.
//! - No native JSON mode: structured output is requested through an extra
//!   system-text block carrying the schema and a JSON-only directive.
//! - Response content is an array of blocks; text blocks concatenate with
//!   newlines and tool-use blocks are folded in through the common
//!   function-call formatter.
//! - Stream events: `message_start` / `message_delta` carry cumulative
//!   usage, `content_block_delta` with `text_delta` carries text,
//!   `message_stop` ends the stream.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::capabilities::{
    registry, CachingConfig, Capability, CapabilityConfig, DataFormat, FunctionCallingConfig,
    ImageFormat, StreamingConfig, StructuredResponseConfig, SystemPromptConfig, VisionConfig,
};
use crate::config::Config;
use crate::error::Error;
use crate::schema;
use crate::types::{Request, Response, Usage};
use crate::Result;

use super::{
    ensure_messages, format_function_call, is_global_option, merge_remaining_options,
    resolve_model, resolve_system_prompt, tools_from_options, OptionMap, Provider, StreamFrame,
    ANTHROPIC,
};

/// Upper bound on system-prompt segments.
pub const SYSTEM_PROMPT_MAX_PARTS: usize = 4;

const KEY_MAX_TOKENS: &str = "max_tokens";
const CACHING_BETA: &str = "prompt-caching-2024-07-31";

/// Adapter for `https://api.anthropic.com/v1/messages`.
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    extra_headers: RwLock<HashMap<String, String>>,
    options: RwLock<HashMap<String, Value>>,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, mut extra_headers: HashMap<String, String>) -> Self {
        extra_headers
            .entry("anthropic-beta".to_string())
            .or_insert_with(|| CACHING_BETA.to_string());

        let provider = Self {
            api_key: api_key.into(),
            model: model.into(),
            extra_headers: RwLock::new(extra_headers),
            options: RwLock::new(HashMap::new()),
        };
        provider.register_capabilities();
        provider
    }

    fn register_capabilities(&self) {
        let reg = registry();

        let all_models = [
            // Claude 3.5
            "claude-3-5-sonnet-20241022",
            "claude-3-5-sonnet-20240620",
            "claude-3-5-haiku-20241022",
            // Claude 3
            "claude-3-opus-20240229",
            "claude-3-sonnet-20240229",
            "claude-3-haiku-20240307",
            // Legacy
            "claude-2.1",
            "claude-2.0",
            "claude-instant-1.2",
            // Generic aliases
            "claude-3-5-sonnet",
            "claude-3-5-haiku",
            "claude-3-opus",
            "claude-3-sonnet",
            "claude-3-haiku",
        ];

        for model in all_models {
            reg.register(
                ANTHROPIC,
                model,
                Capability::StructuredResponse,
                CapabilityConfig::StructuredResponse(StructuredResponseConfig {
                    requires_tool_use: false,
                    requires_json_mode: false,
                    max_schema_depth: 15,
                    max_properties: 0,
                    supported_formats: vec![DataFormat::Json],
                    supported_types: Vec::new(),
                    system_prompt_hint:
                        "You must respond with a JSON object that strictly adheres to this schema"
                            .to_string(),
                }),
            );

            reg.register(
                ANTHROPIC,
                model,
                Capability::FunctionCalling,
                CapabilityConfig::FunctionCalling(FunctionCallingConfig {
                    max_functions: 64,
                    max_parallel_calls: 10,
                    supports_parallel: true,
                    requires_tool_role: false,
                    supports_streaming: true,
                    supported_parameter_types: Vec::new(),
                    max_nesting_depth: 0,
                }),
            );

            reg.register(
                ANTHROPIC,
                model,
                Capability::Streaming,
                CapabilityConfig::Streaming(StreamingConfig {
                    chunk_delimiter: "data: ".into(),
                    buffer_size: 4096,
                    supports_sse: true,
                    supports_usage: true,
                }),
            );

            // Claude 3+ gets the full cache; legacy models a reduced one.
            let caching = if model.contains("claude-3") {
                CachingConfig {
                    cache_key_strategy: "ephemeral".into(),
                    max_cache_size: 1024 * 1024,
                    cache_ttl_seconds: 3600,
                }
            } else {
                CachingConfig {
                    cache_key_strategy: "ephemeral".into(),
                    max_cache_size: 512 * 1024,
                    cache_ttl_seconds: 1800,
                }
            };
            reg.register(ANTHROPIC, model, Capability::Caching, CapabilityConfig::Caching(caching));

            if model.contains("claude-3") {
                reg.register(
                    ANTHROPIC,
                    model,
                    Capability::Vision,
                    CapabilityConfig::Vision(VisionConfig {
                        max_image_size: 5 * 1024 * 1024,
                        max_images_per_request: 20,
                        supported_formats: vec![
                            ImageFormat::Jpeg,
                            ImageFormat::Png,
                            ImageFormat::Gif,
                            ImageFormat::Webp,
                        ],
                        supports_video_frames: false,
                        supports_ocr: false,
                        supports_image_generation: false,
                        supports_object_detection: false,
                    }),
                );
            }

            reg.register(
                ANTHROPIC,
                model,
                Capability::SystemPrompt,
                CapabilityConfig::SystemPrompt(SystemPromptConfig {
                    max_length: 32768,
                    supports_multiple: true,
                }),
            );
        }
    }

    fn caching_requested(&self, options: &OptionMap, model: &str) -> bool {
        options
            .get("enable_caching")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            && self.has_capability(Capability::Caching, Some(model))
    }

    fn build_body(&self, req: &Request, options: &OptionMap, stream: bool) -> Result<Vec<u8>> {
        ensure_messages(req)?;
        let model = resolve_model(&self.model, req, options);

        let mut body = Map::new();
        body.insert("model".into(), json!(model));
        if let Some(max_tokens) = self.options.read().expect("options lock poisoned").get(KEY_MAX_TOKENS) {
            body.insert(KEY_MAX_TOKENS.into(), max_tokens.clone());
        }
        if stream {
            body.insert("stream".into(), json!(true));
        }

        let mut system_prompt = resolve_system_prompt(req, options).unwrap_or_default();

        let tools = tools_from_options(options);
        if !tools.is_empty() {
            let wire_tools: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.function.name,
                        "description": tool.function.description.clone().unwrap_or_default(),
                        "input_schema": tool.function.parameters,
                    })
                })
                .collect();
            body.insert("tools".into(), Value::Array(wire_tools));

            if tools.len() > 1 {
                let directive = "When multiple tools are needed to answer a question, you should \
                                 identify all required tools upfront and use them all at once in \
                                 your response, rather than using them sequentially. Do not wait \
                                 for tool results before calling other tools.";
                system_prompt = if system_prompt.is_empty() {
                    directive.to_string()
                } else {
                    format!("{directive}\n\n{system_prompt}")
                };
            }

            let choice = options
                .get("tool_choice")
                .and_then(Value::as_str)
                .unwrap_or("auto");
            body.insert("tool_choice".into(), json!({"type": choice}));
        }

        let mut system: Vec<Value> = Vec::new();
        if !system_prompt.is_empty() {
            for (i, part) in split_system_prompt(&system_prompt, SYSTEM_PROMPT_MAX_PARTS)
                .into_iter()
                .enumerate()
            {
                let mut segment = json!({"type": "text", "text": part});
                if i > 0 {
                    segment["cache_control"] = json!({"type": "ephemeral"});
                }
                system.push(segment);
            }
        }

        if let Some(response_schema) = &req.response_schema {
            if self.has_capability(Capability::StructuredResponse, Some(&model)) {
                let hint = match registry().get_typed::<StructuredResponseConfig>(ANTHROPIC, &model)
                {
                    Ok(cfg) => {
                        schema::check_schema_limits(response_schema, &cfg)?;
                        cfg.system_prompt_hint
                    }
                    Err(_) => String::new(),
                };
                let schema_json = serde_json::to_string_pretty(response_schema)?;
                let hint = if hint.is_empty() {
                    "You must respond with a JSON object that strictly adheres to this schema"
                        .to_string()
                } else {
                    hint
                };
                system.push(json!({
                    "type": "text",
                    "text": format!(
                        "{hint}:\n{schema_json}\nDo not include any explanatory text, only output valid JSON."
                    ),
                }));
            }
        }
        body.insert("system".into(), Value::Array(system));

        let caching = self.caching_requested(options, &model);
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|msg| {
                let mut text_block = json!({"type": "text", "text": msg.content});
                if msg.cache_type.is_some() || caching {
                    let cache_type = msg
                        .cache_type
                        .map(|c| c.as_str())
                        .unwrap_or("ephemeral");
                    text_block["cache_control"] = json!({"type": cache_type});
                }
                let mut content = vec![text_block];
                for call in &msg.tool_calls {
                    let input: Value = serde_json::from_str(&call.function.arguments)
                        .unwrap_or(Value::Null);
                    content.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": input,
                    }));
                }
                let mut wire = json!({"role": msg.role.as_str(), "content": content});
                if let Some(name) = &msg.name {
                    wire["name"] = json!(name);
                }
                wire
            })
            .collect();
        body.insert("messages".into(), Value::Array(messages));

        let defaults = self.options.read().expect("options lock poisoned").clone();
        merge_remaining_options(&mut body, &defaults, options, |key| {
            is_global_option(key) || key == KEY_MAX_TOKENS
        });

        serde_json::to_vec(&Value::Object(body)).map_err(Error::from)
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        ANTHROPIC
    }

    fn endpoint(&self) -> String {
        "https://api.anthropic.com/v1/messages".to_string()
    }

    fn headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            ("x-api-key".to_string(), self.api_key.clone()),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
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
        self.build_body(req, options, false)
    }

    fn prepare_stream_request(&self, req: &Request, options: &OptionMap) -> Result<Vec<u8>> {
        let model = resolve_model(&self.model, req, options);
        if !self.has_capability(Capability::Streaming, Some(&model)) {
            return Err(Error::CapabilityNotSupported {
                provider: ANTHROPIC.to_string(),
                model,
                capability: Capability::Streaming,
            });
        }
        self.build_body(req, options, true)
    }

    fn parse_response(&self, body: &[u8]) -> Result<Response> {
        let response: MessagesResponse = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;
        if response.content.is_empty() {
            return Err(Error::EmptyResponse);
        }
        tracing::debug!(
            blocks = response.content.len(),
            stop_reason = response.stop_reason.as_deref().unwrap_or(""),
            "anthropic response parsed"
        );

        let mut text_parts: Vec<String> = Vec::new();
        let mut function_calls: Vec<String> = Vec::new();
        for block in &response.content {
            match block.kind.as_str() {
                "text" => {
                    if let Some(text) = &block.text {
                        text_parts.push(text.clone());
                    }
                }
                "tool_use" | "tool_calls" => {
                    let name = block.name.as_deref().unwrap_or_default();
                    let args = block
                        .input
                        .as_ref()
                        .map(Value::to_string)
                        .unwrap_or_else(|| "{}".to_string());
                    function_calls.push(format_function_call(name, &args));
                }
                _ => {}
            }
        }

        let mut rendered = text_parts.join("\n");
        if !function_calls.is_empty() {
            if !rendered.is_empty() {
                rendered.push('\n');
            }
            rendered.push_str(&function_calls.join("\n"));
        }

        Ok(Response::text(rendered).with_usage(response.usage.to_usage()))
    }

    fn parse_stream_response(&self, chunk: &[u8]) -> Result<StreamFrame> {
        let trimmed = std::str::from_utf8(chunk)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?
            .trim();
        if trimmed.is_empty() {
            return Ok(StreamFrame::Skip);
        }
        if trimmed == "[DONE]" {
            return Ok(StreamFrame::Done);
        }

        let event: StreamEvent = serde_json::from_str(trimmed)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;

        match event.kind.as_str() {
            "content_block_delta" => match event.delta {
                Some(delta) if delta.kind.as_deref() == Some("text_delta") => {
                    match delta.text.filter(|t| !t.is_empty()) {
                        Some(text) => Ok(StreamFrame::Token(Response::text(text))),
                        None => Ok(StreamFrame::Skip),
                    }
                }
                _ => Ok(StreamFrame::Skip),
            },
            "message_start" => {
                match event.message.and_then(|m| m.usage) {
                    Some(usage) => Ok(StreamFrame::Token(Response::usage_only(usage.to_usage()))),
                    None => Ok(StreamFrame::Skip),
                }
            }
            // Counts on message_delta are cumulative over the request.
            "message_delta" => match event.usage {
                Some(usage) => Ok(StreamFrame::Token(Response::usage_only(usage.to_usage()))),
                None => Ok(StreamFrame::Skip),
            },
            "message_stop" => Ok(StreamFrame::Done),
            // ping, content_block_start/stop, tool-use partials, thinking...
            _ => Ok(StreamFrame::Skip),
        }
    }

    fn has_capability(&self, capability: Capability, model: Option<&str>) -> bool {
        let target = model.filter(|m| !m.is_empty()).unwrap_or(&self.model);
        registry().has_capability(ANTHROPIC, target, capability)
    }
}

/// Split a prompt at paragraph boundaries (double newline) into at most `n`
/// parts, spreading paragraphs as evenly as possible when there are more
/// paragraphs than parts.
fn split_system_prompt(prompt: &str, n: usize) -> Vec<String> {
    if n <= 1 {
        return vec![prompt.to_string()];
    }

    let paragraphs: Vec<&str> = prompt.split("\n\n").collect();
    if paragraphs.len() <= n {
        return paragraphs.into_iter().map(str::to_string).collect();
    }

    let per_part = paragraphs.len() / n;
    let extra = paragraphs.len() % n;
    let mut result = Vec::with_capacity(n);
    let mut index = 0;
    for i in 0..n {
        let take = per_part + usize::from(i < extra);
        result.push(paragraphs[index..index + take].join("\n\n"));
        index += take;
    }
    result
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    message: Option<StreamMessage>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

impl WireUsage {
    fn to_usage(&self) -> Usage {
        Usage::new(
            self.input_tokens,
            self.cache_creation_input_tokens,
            self.output_tokens,
            self.cache_read_input_tokens,
            0,
        )
    }
}
