//! Cohere v2 chat adapter.
//!
//! The system prompt rides the `preamble` field. The vendor quirk of record:
//! on command-r models structured response is only reachable through tool
//! calling, so the registry descriptor carries `requires_tool_use` and this
//! adapter synthesizes a `structured_output` tool alongside the
//! `response_format` block when no caller tools are present.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;
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

use super::openai_compat::raw_arguments;
use super::{
    ensure_messages, format_function_call, is_global_option, merge_remaining_options,
    resolve_model, resolve_system_prompt, tools_from_options, OptionMap, Provider, StreamFrame,
    COHERE,
};

/// Adapter for `https://api.cohere.com/v2/chat`.
pub struct CohereProvider {
    api_key: String,
    model: String,
    extra_headers: RwLock<HashMap<String, String>>,
    options: RwLock<HashMap<String, Value>>,
}

impl std::fmt::Debug for CohereProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CohereProvider")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl CohereProvider {
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
            "command-a-03-2025",
            "command-r-plus-08-2024",
            "command-r-plus-04-2024",
            "command-r-plus",
            "command-r-08-2024",
            "command-r-03-2024",
            "command-r",
            "command",
            "command-light",
            "command-nightly",
            "command-light-nightly",
        ];

        let structured_models = [
            "command-a-03-2025",
            "command-r-plus-08-2024",
            "command-r-plus-04-2024",
            "command-r-plus",
            "command-r-08-2024",
            "command-r-03-2024",
            "command-r",
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
                // Structured response only works through tool calling here.
                reg.register(
                    COHERE,
                    model,
                    Capability::StructuredResponse,
                    CapabilityConfig::StructuredResponse(StructuredResponseConfig {
                        requires_tool_use: true,
                        requires_json_mode: false,
                        max_schema_depth: 5,
                        max_properties: 100,
                        supported_formats: vec![DataFormat::Json],
                        supported_types: param_types.clone(),
                        system_prompt_hint:
                            "You must use the provided tool to structure your response".to_string(),
                    }),
                );
            }

            if model.contains("command-r") {
                reg.register(
                    COHERE,
                    model,
                    Capability::FunctionCalling,
                    CapabilityConfig::FunctionCalling(FunctionCallingConfig {
                        max_functions: 50,
                        max_parallel_calls: 1,
                        supports_parallel: false,
                        requires_tool_role: true,
                        supports_streaming: true,
                        supported_parameter_types: param_types.clone(),
                        max_nesting_depth: 5,
                    }),
                );
            } else if model.contains("command") {
                reg.register(
                    COHERE,
                    model,
                    Capability::FunctionCalling,
                    CapabilityConfig::FunctionCalling(FunctionCallingConfig {
                        max_functions: 20,
                        max_parallel_calls: 1,
                        supports_parallel: false,
                        requires_tool_role: true,
                        supports_streaming: false,
                        supported_parameter_types: param_types.clone(),
                        max_nesting_depth: 5,
                    }),
                );
            }

            reg.register(
                COHERE,
                model,
                Capability::Streaming,
                CapabilityConfig::Streaming(StreamingConfig {
                    chunk_delimiter: "\n".into(),
                    buffer_size: 8192,
                    supports_sse: true,
                    supports_usage: false,
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

        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|msg| {
                let mut wire = json!({
                    "role": msg.role.as_str(),
                    "content": msg.content,
                });
                if let Some(name) = &msg.name {
                    wire["name"] = json!(name);
                }
                if !msg.tool_calls.is_empty() {
                    let calls: Vec<Value> = msg
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": call.kind,
                                "function": {
                                    "name": call.function.name,
                                    "arguments": call.function.arguments,
                                },
                            })
                        })
                        .collect();
                    wire["tool_calls"] = Value::Array(calls);
                }
                wire
            })
            .collect();
        body.insert("messages".into(), Value::Array(messages));

        if let Some(system_prompt) = resolve_system_prompt(req, options) {
            body.insert("preamble".into(), json!(system_prompt));
        }

        let mut tools = tools_from_options(options);

        if let Some(response_schema) = &req.response_schema {
            if self.has_capability(Capability::StructuredResponse, Some(&model)) {
                let descriptor =
                    registry().get_typed::<StructuredResponseConfig>(COHERE, &model).ok();
                if let Some(cfg) = &descriptor {
                    schema::check_schema_limits(response_schema, cfg)?;
                }
                body.insert(
                    "response_format".into(),
                    json!({
                        "type": "json_object",
                        "json_schema": response_schema,
                    }),
                );
                // Tool-use proxy: no native schema channel, so the schema
                // becomes the lone tool's parameters.
                if descriptor.as_ref().is_some_and(|c| c.requires_tool_use) && tools.is_empty() {
                    tools.push(crate::types::Tool::new(
                        "structured_output",
                        "Produce the structured response",
                        response_schema.clone(),
                    ));
                    body.insert("tool_choice".into(), json!("REQUIRED"));
                }
            }
        }

        if !tools.is_empty() {
            let wire_tools: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.function.name,
                            "description": tool.function.description.clone().unwrap_or_default(),
                            "parameters": tool.function.parameters,
                        },
                    })
                })
                .collect();
            body.insert("tools".into(), Value::Array(wire_tools));
        }

        let defaults = self.options.read().expect("options lock poisoned").clone();
        merge_remaining_options(&mut body, &defaults, options, |key| {
            is_global_option(key) || key == "preamble" || key == "messages" || key == "response_format"
        });

        serde_json::to_vec(&Value::Object(body)).map_err(Error::from)
    }
}

impl Provider for CohereProvider {
    fn name(&self) -> &'static str {
        COHERE
    }

    fn endpoint(&self) -> String {
        "https://api.cohere.com/v2/chat".to_string()
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
        tracing::debug!(key, %value, "cohere option set");
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
                provider: COHERE.to_string(),
                model,
                capability: Capability::Streaming,
            });
        }
        self.build_body(req, options, true)
    }

    fn parse_response(&self, body: &[u8]) -> Result<Response> {
        let response: ChatResponse = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;

        let message = response.message;
        if message.content.is_empty() && message.tool_calls.is_empty() {
            return Err(Error::EmptyResponse);
        }

        let mut rendered = String::new();
        for block in &message.content {
            if block.kind == "text" {
                rendered.push_str(&block.text);
            }
        }
        for call in &message.tool_calls {
            if !rendered.is_empty() {
                rendered.push('\n');
            }
            rendered.push_str(&format_function_call(
                &call.function.name,
                &raw_arguments(&call.function.arguments),
            ));
        }

        Ok(Response::text(rendered))
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
        match event.text.filter(|t| !t.is_empty()) {
            Some(text) => Ok(StreamFrame::Token(Response::text(text))),
            None => Ok(StreamFrame::Skip),
        }
    }

    fn has_capability(&self, capability: Capability, model: Option<&str>) -> bool {
        let target = model.filter(|m| !m.is_empty()).unwrap_or(&self.model);
        registry().has_capability(COHERE, target, capability)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn provider() -> CohereProvider {
        CohereProvider::new("key", "command-r-plus", HashMap::new())
    }

    fn request(text: &str) -> Request {
        Request {
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }

    #[test]
    fn system_prompt_rides_the_preamble() {
        let req = Request {
            messages: vec![Message::user("hi")],
            system_prompt: Some("stay formal".into()),
            ..Default::default()
        };
        let body = provider().prepare_request(&req, &OptionMap::new()).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["preamble"], "stay formal");
    }

    #[test]
    fn structured_response_sets_format_and_proxy_tool() {
        let schema = json!({"type": "object", "properties": {"x": {"type": "string"}}});
        let req = Request {
            messages: vec![Message::user("hi")],
            response_schema: Some(schema.clone()),
            ..Default::default()
        };
        let body = provider().prepare_request(&req, &OptionMap::new()).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["response_format"]["json_schema"], schema);
        // requires_tool_use steers the request through a synthesized tool.
        assert_eq!(body["tools"][0]["function"]["name"], "structured_output");
        assert_eq!(body["tools"][0]["function"]["parameters"], schema);

        let cfg: StructuredResponseConfig =
            registry().get_typed(COHERE, "command-r-plus").unwrap();
        assert!(cfg.requires_tool_use);
    }

    #[test]
    fn legacy_models_lack_structured_response() {
        let p = CohereProvider::new("key", "command-light", HashMap::new());
        assert!(!p.has_capability(Capability::StructuredResponse, None));
        assert!(p.has_capability(Capability::Streaming, None));
    }

    #[test]
    fn parse_response_concatenates_text_blocks() {
        let body = br#"{"message":{"role":"assistant","content":[
            {"type":"text","text":"part one"},
            {"type":"text","text":" and two"}
        ]}}"#;
        let resp = provider().parse_response(body).unwrap();
        assert_eq!(resp.as_text(), "part one and two");
    }

    #[test]
    fn parse_response_extracts_tool_arguments() {
        let body = br#"{"message":{"tool_calls":[
            {"id":"t1","type":"function","function":{"name":"structured_output","arguments":"{\"x\":\"y\"}"}}
        ],"content":[]}}"#;
        let resp = provider().parse_response(body).unwrap();
        assert_eq!(
            resp.as_text(),
            r#"{"function_call":{"name":"structured_output","arguments":{"x":"y"}}}"#
        );
    }

    #[test]
    fn empty_message_is_empty_response() {
        assert!(matches!(
            provider().parse_response(b"{}"),
            Err(Error::EmptyResponse)
        ));
    }

    #[test]
    fn stream_frames_yield_text_or_skip() {
        match provider().parse_stream_response(br#"{"text":"hey"}"#).unwrap() {
            StreamFrame::Token(resp) => assert_eq!(resp.as_text(), "hey"),
            other => panic!("expected token, got {other:?}"),
        }
        assert!(matches!(
            provider()
                .parse_stream_response(br#"{"type":"stream-start"}"#)
                .unwrap(),
            StreamFrame::Skip
        ));
    }

    #[test]
    fn stream_request_needs_capability() {
        let body = provider()
            .prepare_stream_request(&request("hi"), &OptionMap::new())
            .unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["stream"], true);
    }
}
