//! Groq adapter.
//!
//! OpenAI-compatible endpoint with two deviations: usage is never reported
//! on streams, and structured response only attaches to unary requests.
//! `llama-guard` models register neither function calling nor streaming.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::{json, Map, Value};

use crate::capabilities::{
    registry, Capability, CapabilityConfig, DataFormat, FunctionCallingConfig, SchemaType,
    StreamingConfig, StructuredResponseConfig,
};
use crate::config::Config;
use crate::error::Error;
use crate::schema;
use crate::types::{Request, Response};
use crate::Result;

use super::openai_compat::{convert_messages, convert_tools, parse_chat_response, parse_chat_stream};
use super::{
    ensure_messages, is_global_option, merge_remaining_options, resolve_model,
    resolve_system_prompt, tools_from_options, OptionMap, Provider, StreamFrame, GROQ,
};

const GUARD_MODELS: [&str; 1] = ["llama-guard-3-8b"];

/// Adapter for `https://api.groq.com/openai/v1/chat/completions`.
pub struct GroqProvider {
    api_key: String,
    model: String,
    extra_headers: RwLock<HashMap<String, String>>,
    options: RwLock<HashMap<String, Value>>,
}

impl std::fmt::Debug for GroqProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroqProvider")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl GroqProvider {
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

    fn register_capabilities(&self) {
        let reg = registry();

        let all_models = [
            "llama-3.1-405b-reasoning",
            "llama-3.1-70b-versatile",
            "llama-3.1-8b-instant",
            "llama3-groq-70b-8192-tool-use-preview",
            "llama3-groq-8b-8192-tool-use-preview",
            "llama-3.2-1b-preview",
            "llama-3.2-3b-preview",
            "llama-3.2-11b-text-preview",
            "llama-3.2-90b-text-preview",
            "llama-guard-3-8b",
            "llama3-70b-8192",
            "llama3-8b-8192",
            "mixtral-8x7b-32768",
            "gemma-7b-it",
            "gemma2-9b-it",
            "deepseek-r1-distill-llama-70b",
            "openai/gpt-oss-20b",
            "openai/gpt-oss-120b",
            "moonshotai/kimi-k2-instruct",
            "meta-llama/llama-4-maverick-17b-128e-instruct",
            "meta-llama/llama-4-scout-17b-16e-instruct",
        ];

        let param_types = vec![
            SchemaType::Object,
            SchemaType::Array,
            SchemaType::String,
            SchemaType::Number,
            SchemaType::Boolean,
        ];

        for model in all_models {
            reg.register(
                GROQ,
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

            if !GUARD_MODELS.contains(&model) {
                reg.register(
                    GROQ,
                    model,
                    Capability::FunctionCalling,
                    CapabilityConfig::FunctionCalling(FunctionCallingConfig {
                        max_functions: 100,
                        max_parallel_calls: 10,
                        supports_parallel: true,
                        requires_tool_role: false,
                        supports_streaming: true,
                        supported_parameter_types: param_types.clone(),
                        max_nesting_depth: 10,
                    }),
                );

                reg.register(
                    GROQ,
                    model,
                    Capability::Streaming,
                    CapabilityConfig::Streaming(StreamingConfig {
                        chunk_delimiter: "data: ".into(),
                        buffer_size: 4096,
                        supports_sse: true,
                        supports_usage: false,
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
        if stream {
            body.insert("stream".into(), json!(true));
        }

        let mut messages: Vec<Value> = Vec::new();
        if let Some(system_prompt) = resolve_system_prompt(req, options) {
            messages.push(json!({"role": "system", "content": system_prompt}));
        }
        messages.extend(convert_messages(&req.messages));
        body.insert("messages".into(), Value::Array(messages));

        let tools = tools_from_options(options);
        if !tools.is_empty() {
            body.insert("tools".into(), Value::Array(convert_tools(&tools, false)));
            let choice = options
                .get("tool_choice")
                .and_then(Value::as_str)
                .unwrap_or("auto");
            body.insert("tool_choice".into(), json!(choice));
        }

        // Structured output and streaming do not mix on this vendor.
        if !stream {
            if let Some(response_schema) = &req.response_schema {
                if self.has_capability(Capability::StructuredResponse, Some(&model)) {
                    if let Ok(cfg) =
                        registry().get_typed::<StructuredResponseConfig>(GROQ, &model)
                    {
                        schema::check_schema_limits(response_schema, &cfg)?;
                    }
                    body.insert(
                        "response_format".into(),
                        json!({
                            "type": "json_schema",
                            "schema": schema::stripped_schema(response_schema),
                        }),
                    );
                }
            }
        }

        let defaults = self.options.read().expect("options lock poisoned").clone();
        merge_remaining_options(&mut body, &defaults, options, is_global_option);

        serde_json::to_vec(&Value::Object(body)).map_err(Error::from)
    }
}

impl Provider for GroqProvider {
    fn name(&self) -> &'static str {
        GROQ
    }

    fn endpoint(&self) -> String {
        "https://api.groq.com/openai/v1/chat/completions".to_string()
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
            self.set_option("max_tokens", json!(m));
        }
        if let Some(seed) = cfg.seed {
            self.set_option("seed", json!(seed));
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
                provider: GROQ.to_string(),
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
        registry().has_capability(GROQ, target, capability)
    }
}
