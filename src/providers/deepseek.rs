//! DeepSeek adapter.
//!
//! Speaks the OpenAI chat-completions dialect. JSON mode takes only
//! `response_format: {type:"json_object"}`, so the schema itself travels as
//! a system-message directive. The reasoner model registers streaming only.

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
    resolve_system_prompt, tools_from_options, OptionMap, Provider, StreamFrame, DEEPSEEK,
};

/// Adapter for `https://api.deepseek.com/v1/chat/completions`.
pub struct DeepSeekProvider {
    api_key: String,
    model: String,
    extra_headers: RwLock<HashMap<String, String>>,
    options: RwLock<HashMap<String, Value>>,
}

impl std::fmt::Debug for DeepSeekProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepSeekProvider")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl DeepSeekProvider {
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

        let param_types = vec![
            SchemaType::Object,
            SchemaType::Array,
            SchemaType::String,
            SchemaType::Number,
            SchemaType::Boolean,
        ];

        for model in ["deepseek-chat", "deepseek-coder", "deepseek-reasoner"] {
            // The reasoner streams but takes no tools and no JSON mode.
            if model != "deepseek-reasoner" {
                reg.register(
                    DEEPSEEK,
                    model,
                    Capability::StructuredResponse,
                    CapabilityConfig::StructuredResponse(StructuredResponseConfig {
                        requires_tool_use: false,
                        requires_json_mode: true,
                        max_schema_depth: 10,
                        max_properties: 100,
                        supported_formats: vec![DataFormat::Json],
                        supported_types: param_types.clone(),
                        system_prompt_hint:
                            "Respond with a JSON object matching this schema".to_string(),
                    }),
                );

                reg.register(
                    DEEPSEEK,
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
            }

            reg.register(
                DEEPSEEK,
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

        let mut system_prompt = resolve_system_prompt(req, options).unwrap_or_default();

        if let Some(response_schema) = &req.response_schema {
            if self.has_capability(Capability::StructuredResponse, Some(&model)) {
                let hint = match registry().get_typed::<StructuredResponseConfig>(DEEPSEEK, &model)
                {
                    Ok(cfg) => {
                        schema::check_schema_limits(response_schema, &cfg)?;
                        cfg.system_prompt_hint
                    }
                    Err(_) => String::new(),
                };
                body.insert("response_format".into(), json!({"type": "json_object"}));
                let schema_json = serde_json::to_string_pretty(response_schema)?;
                let directive = format!("{hint}:\n{schema_json}\nOutput only valid JSON.");
                system_prompt = if system_prompt.is_empty() {
                    directive
                } else {
                    format!("{system_prompt}\n\n{directive}")
                };
            }
        }

        let mut messages: Vec<Value> = Vec::new();
        if !system_prompt.is_empty() {
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

        let defaults = self.options.read().expect("options lock poisoned").clone();
        merge_remaining_options(&mut body, &defaults, options, is_global_option);

        serde_json::to_vec(&Value::Object(body)).map_err(Error::from)
    }
}

impl Provider for DeepSeekProvider {
    fn name(&self) -> &'static str {
        DEEPSEEK
    }

    fn endpoint(&self) -> String {
        "https://api.deepseek.com/v1/chat/completions".to_string()
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
        if let Some(top_p) = cfg.top_p {
            self.set_option("top_p", json!(top_p));
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
                provider: DEEPSEEK.to_string(),
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
        registry().has_capability(DEEPSEEK, target, capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn reasoner_registers_streaming_only() {
        let p = DeepSeekProvider::new("key", "deepseek-reasoner", HashMap::new());
        assert!(p.has_capability(Capability::Streaming, None));
        assert!(!p.has_capability(Capability::FunctionCalling, None));
        assert!(!p.has_capability(Capability::StructuredResponse, None));
    }

    #[test]
    fn schema_rides_a_system_directive() {
        let p = DeepSeekProvider::new("key", "deepseek-chat", HashMap::new());
        let req = Request {
            messages: vec![Message::user("hi")],
            response_schema: Some(json!({"type": "object"})),
            ..Default::default()
        };
        let body = p.prepare_request(&req, &OptionMap::new()).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("Output only valid JSON"));
    }
}
