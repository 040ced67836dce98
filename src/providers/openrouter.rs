//! OpenRouter adapter.
//!
//! A thin OpenAI-compatible front over many upstream vendors. Callers
//! typically pass `HTTP-Referer` / `X-Title` through the extra headers;
//! everything else follows the shared chat-completions handling.

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
    resolve_system_prompt, tools_from_options, OptionMap, Provider, StreamFrame, OPENROUTER,
};

/// Adapter for `https://openrouter.ai/api/v1/chat/completions`.
pub struct OpenRouterProvider {
    api_key: String,
    model: String,
    extra_headers: RwLock<HashMap<String, String>>,
    options: RwLock<HashMap<String, Value>>,
}

impl std::fmt::Debug for OpenRouterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterProvider")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenRouterProvider {
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

        // Routed model ids; the gateway itself accepts many more, these are
        // the ones the adapter vouches for.
        let all_models = [
            "openrouter/auto",
            "openai/gpt-4o",
            "openai/gpt-4o-mini",
            "anthropic/claude-3.5-sonnet",
            "meta-llama/llama-3.1-70b-instruct",
            "mistralai/mistral-large",
            "google/gemini-flash-1.5",
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
                OPENROUTER,
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

            reg.register(
                OPENROUTER,
                model,
                Capability::FunctionCalling,
                CapabilityConfig::FunctionCalling(FunctionCallingConfig {
                    max_functions: 64,
                    max_parallel_calls: 8,
                    supports_parallel: true,
                    requires_tool_role: false,
                    supports_streaming: true,
                    supported_parameter_types: param_types.clone(),
                    max_nesting_depth: 10,
                }),
            );

            reg.register(
                OPENROUTER,
                model,
                Capability::Streaming,
                CapabilityConfig::Streaming(StreamingConfig {
                    chunk_delimiter: "data: ".into(),
                    buffer_size: 4096,
                    supports_sse: true,
                    supports_usage: true,
                }),
            );
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

        if let Some(response_schema) = &req.response_schema {
            if self.has_capability(Capability::StructuredResponse, Some(&model)) {
                if let Ok(cfg) =
                    registry().get_typed::<StructuredResponseConfig>(OPENROUTER, &model)
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

        serde_json::to_vec(&Value::Object(body)).map_err(Error::from)
    }
}

impl Provider for OpenRouterProvider {
    fn name(&self) -> &'static str {
        OPENROUTER
    }

    fn endpoint(&self) -> String {
        "https://openrouter.ai/api/v1/chat/completions".to_string()
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
                provider: OPENROUTER.to_string(),
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
        registry().has_capability(OPENROUTER, target, capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn referer_headers_pass_through() {
        let p = OpenRouterProvider::new(
            "key",
            "openrouter/auto",
            HashMap::from([
                ("HTTP-Referer".to_string(), "https://example.app".to_string()),
                ("X-Title".to_string(), "example".to_string()),
            ]),
        );
        let headers = p.headers();
        assert_eq!(headers["HTTP-Referer"], "https://example.app");
        assert_eq!(headers["X-Title"], "example");
        assert!(headers["Authorization"].starts_with("Bearer "));
    }

    #[test]
    fn routed_model_override_lands_in_body() {
        let p = OpenRouterProvider::new("key", "openrouter/auto", HashMap::new());
        let req = Request {
            messages: vec![Message::user("hi")],
            model: Some("anthropic/claude-3.5-sonnet".into()),
            ..Default::default()
        };
        let body = p.prepare_request(&req, &OptionMap::new()).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["model"], "anthropic/claude-3.5-sonnet");
    }
}
