//! Ollama adapter for locally hosted models.
//!
//! No auth. Chat-style messages collapse into a single `prompt` string
//! (optional `System:` preamble, then `role: content` blocks separated by
//! blank lines). Responses arrive as concatenated NDJSON objects; usage
//! fields are `prompt_eval_count` / `eval_count` on the `done:true` terminal
//! object. Structured response and function calling are intentionally not
//! registered.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::capabilities::{
    registry, Capability, CapabilityConfig, ImageFormat, StreamingConfig, SystemPromptConfig,
    VisionConfig,
};
use crate::config::Config;
use crate::error::Error;
use crate::types::{Request, Response, Usage};
use crate::Result;

use super::{
    ensure_messages, is_global_option, merge_remaining_options, resolve_model,
    resolve_system_prompt, OptionMap, Provider, StreamFrame, OLLAMA,
};

const DEFAULT_ENDPOINT: &str = "http://localhost:11434";

/// Adapter for a local Ollama daemon (`{base}/api/generate`).
pub struct OllamaProvider {
    model: String,
    base_url: RwLock<String>,
    extra_headers: RwLock<HashMap<String, String>>,
    options: RwLock<HashMap<String, Value>>,
}

impl std::fmt::Debug for OllamaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaProvider")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OllamaProvider {
    /// Ollama needs no api key; the daemon address comes from
    /// [`Config::ollama_endpoint`] or defaults to localhost.
    pub fn new(model: impl Into<String>, extra_headers: HashMap<String, String>) -> Self {
        let provider = Self {
            model: model.into(),
            base_url: RwLock::new(DEFAULT_ENDPOINT.to_string()),
            extra_headers: RwLock::new(extra_headers),
            options: RwLock::new(HashMap::new()),
        };
        provider.register_capabilities();
        provider
    }

    fn register_capabilities(&self) {
        let reg = registry();

        let all_models = [
            // Llama
            "llama3.2",
            "llama3.2:1b",
            "llama3.2:3b",
            "llama3.1",
            "llama3.1:8b",
            "llama3.1:70b",
            "llama3",
            "llama3:8b",
            "llama3:70b",
            "llama2",
            "llama2:7b",
            "llama2:13b",
            "llama2:70b",
            // Code Llama
            "codellama",
            "codellama:7b",
            "codellama:13b",
            "codellama:instruct",
            // Mistral family
            "mistral",
            "mistral:7b",
            "mistral:instruct",
            "mistral-nemo",
            "mixtral",
            "mixtral:8x7b",
            "mixtral:8x22b",
            // Gemma
            "gemma",
            "gemma:2b",
            "gemma:7b",
            "gemma2",
            "gemma2:9b",
            "gemma2:27b",
            // Phi
            "phi3",
            "phi3:mini",
            "phi3:medium",
            // Qwen
            "qwen2.5",
            "qwen2.5:7b",
            "qwen2.5:14b",
            "qwen2.5:32b",
            "qwen2.5:72b",
            // Others
            "deepseek-coder",
            "deepseek-llm",
            "tinyllama",
            "starcoder2",
            "zephyr",
            "openchat",
            // Vision
            "llava",
            "llava:7b",
            "llava:13b",
            "llava:34b",
            "bakllava",
            "moondream",
        ];

        let vision_models = ["llava", "bakllava", "moondream"];

        for model in all_models {
            reg.register(
                OLLAMA,
                model,
                Capability::Streaming,
                CapabilityConfig::Streaming(StreamingConfig {
                    chunk_delimiter: "\n".into(),
                    buffer_size: 4096,
                    // NDJSON, not SSE.
                    supports_sse: false,
                    supports_usage: true,
                }),
            );

            if vision_models.iter().any(|vm| model.starts_with(vm)) {
                reg.register(
                    OLLAMA,
                    model,
                    Capability::Vision,
                    CapabilityConfig::Vision(VisionConfig {
                        max_image_size: 10 * 1024 * 1024,
                        max_images_per_request: 1,
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
                OLLAMA,
                model,
                Capability::SystemPrompt,
                CapabilityConfig::SystemPrompt(SystemPromptConfig {
                    max_length: 8192,
                    supports_multiple: false,
                }),
            );
        }
        // Structured response and function calling are not registered: the
        // generate endpoint has no native support for either.
    }

    /// Collapse the chat transcript into the single-prompt body shape.
    fn collapse_prompt(req: &Request, options: &OptionMap) -> String {
        let mut prompt = String::new();
        if let Some(system_prompt) = resolve_system_prompt(req, options) {
            prompt.push_str("System: ");
            prompt.push_str(&system_prompt);
            prompt.push_str("\n\n");
        }
        for msg in &req.messages {
            prompt.push_str(msg.role.as_str());
            prompt.push_str(": ");
            prompt.push_str(&msg.content);
            prompt.push_str("\n\n");
        }
        prompt.trim().to_string()
    }

    fn build_body(&self, req: &Request, options: &OptionMap, stream: bool) -> Result<Vec<u8>> {
        ensure_messages(req)?;
        let model = resolve_model(&self.model, req, options);

        let mut body = Map::new();
        body.insert("model".into(), json!(model));
        body.insert("prompt".into(), json!(Self::collapse_prompt(req, options)));
        if stream {
            body.insert("stream".into(), json!(true));
        }

        let defaults = self.options.read().expect("options lock poisoned").clone();
        merge_remaining_options(&mut body, &defaults, options, is_global_option);

        serde_json::to_vec(&Value::Object(body)).map_err(Error::from)
    }
}

impl Provider for OllamaProvider {
    fn name(&self) -> &'static str {
        OLLAMA
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/api/generate",
            self.base_url.read().expect("endpoint lock poisoned")
        )
    }

    fn headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::from([(
            "Content-Type".to_string(),
            "application/json".to_string(),
        )]);
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
            self.set_option("num_predict", json!(m));
        }
        if let Some(seed) = cfg.seed {
            self.set_option("seed", json!(seed));
        }
        if let Some(top_p) = cfg.top_p {
            self.set_option("top_p", json!(top_p));
        }
        if let Some(min_p) = cfg.min_p {
            self.set_option("min_p", json!(min_p));
        }
        if let Some(penalty) = cfg.repeat_penalty {
            self.set_option("repeat_penalty", json!(penalty));
        }
        if let Some(endpoint) = &cfg.ollama_endpoint {
            *self.base_url.write().expect("endpoint lock poisoned") = endpoint.clone();
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
                provider: OLLAMA.to_string(),
                model,
                capability: Capability::Streaming,
            });
        }
        self.build_body(req, options, true)
    }

    /// The generate endpoint answers with concatenated NDJSON objects even
    /// on unary calls, so this loops the stream decoder over the body.
    fn parse_response(&self, body: &[u8]) -> Result<Response> {
        let mut full_text = String::new();
        let mut prompt_eval_count = 0u64;
        let mut eval_count = 0u64;

        for object in serde_json::Deserializer::from_slice(body).into_iter::<GenerateChunk>() {
            let chunk = object.map_err(|e| Error::MalformedResponse(e.to_string()))?;
            if let Some(text) = &chunk.response {
                full_text.push_str(text);
            }
            if chunk.prompt_eval_count > 0 {
                prompt_eval_count = chunk.prompt_eval_count;
            }
            if chunk.eval_count > 0 {
                eval_count = chunk.eval_count;
            }
            if chunk.done {
                break;
            }
        }

        if full_text.is_empty() && prompt_eval_count == 0 && eval_count == 0 {
            return Err(Error::EmptyResponse);
        }

        let mut resp = Response::text(full_text);
        if prompt_eval_count > 0 || eval_count > 0 {
            resp.usage = Some(Usage::new(prompt_eval_count, 0, eval_count, 0, 0));
        }
        Ok(resp)
    }

    fn parse_stream_response(&self, chunk: &[u8]) -> Result<StreamFrame> {
        let parsed: GenerateChunk = serde_json::from_slice(chunk)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;

        if parsed.done {
            if parsed.prompt_eval_count > 0 || parsed.eval_count > 0 {
                return Ok(StreamFrame::Token(Response::usage_only(Usage::new(
                    parsed.prompt_eval_count,
                    0,
                    parsed.eval_count,
                    0,
                    0,
                ))));
            }
            return Ok(StreamFrame::Done);
        }

        match parsed.response.filter(|t| !t.trim().is_empty()) {
            Some(text) => Ok(StreamFrame::Token(Response::text(text))),
            None => Ok(StreamFrame::Skip),
        }
    }

    fn has_capability(&self, capability: Capability, model: Option<&str>) -> bool {
        let target = model.filter(|m| !m.is_empty()).unwrap_or(&self.model);
        registry().has_capability(OLLAMA, target, capability)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}
