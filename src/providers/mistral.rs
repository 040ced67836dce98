//! Mistral chat-completions adapter.
//!
//! OpenAI-dialect wire format with Mistral's own `response_format` shape
//! (`{type:"json_schema", schema}`). Embedding-only and mamba models do not
//! register function calling or structured response.

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
    resolve_system_prompt, tools_from_options, OptionMap, Provider, StreamFrame, MISTRAL,
};

const KEY_MAX_TOKENS: &str = "max_tokens";

/// Adapter for `https://api.mistral.ai/v1/chat/completions`.
pub struct MistralProvider {
    api_key: String,
    model: String,
    extra_headers: RwLock<HashMap<String, String>>,
    options: RwLock<HashMap<String, Value>>,
}

impl std::fmt::Debug for MistralProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MistralProvider")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl MistralProvider {
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
            "mistral-large-latest",
            "mistral-medium-latest",
            "mistral-small-latest",
            "devstral-small-latest",
            "codestral-latest",
            "ministral-8b-latest",
            "ministral-3b-latest",
            "pixtral-12b-latest",
            "pixtral-large-latest",
            "mistral-large-2411",
            "mistral-large-2407",
            "mistral-medium-2312",
            "mistral-small-2312",
            "mistral-small-2402",
            "codestral-2405",
            "ministral-8b-2410",
            "ministral-3b-2410",
            "pixtral-12b-2409",
            "open-mistral-nemo",
            "open-mistral-7b",
            "open-mixtral-8x7b",
            "open-mixtral-8x22b",
            "codestral-mamba",
            "mistral-embed",
        ];

        let function_calling_models = [
            "mistral-large-latest",
            "mistral-large-2411",
            "mistral-large-2407",
            "mistral-medium-latest",
            "mistral-medium-2312",
            "mistral-small-latest",
            "mistral-small-2312",
            "mistral-small-2402",
            "devstral-small-latest",
            "codestral-latest",
            "codestral-2405",
            "ministral-8b-latest",
            "ministral-8b-2410",
            "ministral-3b-latest",
            "ministral-3b-2410",
            "pixtral-12b-latest",
            "pixtral-12b-2409",
            "pixtral-large-latest",
            "open-mistral-nemo",
        ];

        let param_types = vec![
            SchemaType::Object,
            SchemaType::Array,
            SchemaType::String,
            SchemaType::Number,
            SchemaType::Boolean,
        ];

        for model in all_models {
            if model != "codestral-mamba" && model != "mistral-embed" {
                reg.register(
                    MISTRAL,
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

            if function_calling_models.contains(&model) {
                reg.register(
                    MISTRAL,
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
            }

            if model != "mistral-embed" {
                reg.register(
                    MISTRAL,
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

            if model.contains("pixtral") {
                reg.register(
                    MISTRAL,
                    model,
                    Capability::Vision,
                    CapabilityConfig::Vision(VisionConfig {
                        max_image_size: 10 * 1024 * 1024,
                        max_images_per_request: 5,
                        supported_formats: vec![
                            ImageFormat::Jpeg,
                            ImageFormat::Png,
                            ImageFormat::Webp,
                        ],
                        supports_video_frames: false,
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
        if let Some(max_tokens) = self.options.read().expect("options lock poisoned").get(KEY_MAX_TOKENS) {
            body.insert(KEY_MAX_TOKENS.into(), max_tokens.clone());
        }
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
                    registry().get_typed::<StructuredResponseConfig>(MISTRAL, &model)
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

        let defaults = self.options.read().expect("options lock poisoned").clone();
        merge_remaining_options(&mut body, &defaults, options, |key| {
            is_global_option(key) || key == KEY_MAX_TOKENS
        });

        serde_json::to_vec(&Value::Object(body)).map_err(Error::from)
    }
}

impl Provider for MistralProvider {
    fn name(&self) -> &'static str {
        MISTRAL
    }

    fn endpoint(&self) -> String {
        "https://api.mistral.ai/v1/chat/completions".to_string()
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
            self.set_option("random_seed", json!(seed));
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
                provider: MISTRAL.to_string(),
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
        registry().has_capability(MISTRAL, target, capability)
    }
}
