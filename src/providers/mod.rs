//! Provider 适配层 — 以统一契约封装各厂商 API 的多态适配器集合。
//!
//! Provider adapter layer. Every vendor implements the [`Provider`] trait;
//! client code works against `Arc<dyn Provider>` and never sees a vendor
//! wire format. Adapters register their capability descriptors with the
//! global registry at construction time and consult it before building
//! requests.

pub mod anthropic;
pub mod cohere;
pub mod deepseek;
pub mod gemini;
pub mod groq;
pub mod mistral;
pub mod ollama;
pub mod openai;
mod openai_compat;
pub mod openrouter;

pub use anthropic::AnthropicProvider;
pub use cohere::CohereProvider;
pub use deepseek::DeepSeekProvider;
pub use gemini::GeminiProvider;
pub use groq::GroqProvider;
pub use mistral::MistralProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use openrouter::OpenRouterProvider;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::capabilities::Capability;
use crate::config::Config;
use crate::error::Error;
use crate::types::{Request, Response, Tool};
use crate::Result;

/// Stable provider identifiers; these are also the registry key prefixes.
pub const OPENAI: &str = "openai";
pub const ANTHROPIC: &str = "anthropic";
pub const GEMINI: &str = "gemini";
pub const COHERE: &str = "cohere";
pub const MISTRAL: &str = "mistral";
pub const GROQ: &str = "groq";
pub const OLLAMA: &str = "ollama";
pub const DEEPSEEK: &str = "deepseek";
pub const OPENROUTER: &str = "openrouter";

/// Per-call option bag. Values are raw JSON so vendor-specific knobs pass
/// through untyped.
pub type OptionMap = HashMap<String, Value>;

/// Option keys consumed by the adapters themselves and therefore excluded
/// from the vendor pass-through merge. `model` is consumed by effective-model
/// resolution; merging it would let the option override a request-level
/// model, inverting the documented precedence.
pub(crate) const GLOBAL_OPTION_KEYS: [&str; 7] = [
    "system_prompt",
    "tools",
    "tool_choice",
    "structured_messages",
    "enable_caching",
    "stream",
    "model",
];

/// Outcome of decoding one streaming frame.
///
/// `Skip` is the internal drop-this-frame signal of the streaming pipeline;
/// it never reaches callers of [`TokenStream`](crate::stream::TokenStream).
#[derive(Debug)]
pub enum StreamFrame {
    Token(Response),
    Skip,
    Done,
}

/// The contract every vendor adapter implements.
///
/// Adapter instances own their headers, options, model and api key; they are
/// created per client and live as long as the client. `prepare_*` and
/// `parse_*` are CPU-bound and never touch the network.
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Stable lowercase vendor identifier.
    fn name(&self) -> &'static str;

    /// Vendor URL for the request being prepared. Some vendors differ for
    /// streaming vs unary (Gemini).
    fn endpoint(&self) -> String;

    /// Full header set including auth, merged with caller-supplied extras.
    fn headers(&self) -> HashMap<String, String>;

    /// Replace the extras map.
    fn set_extra_headers(&self, extra: HashMap<String, String>);

    /// Populate model-independent knobs from the shared [`Config`].
    fn set_default_options(&self, cfg: &Config);

    /// Per-call override; repeated writes for the same key keep the last
    /// value. Some vendors rewrite keys here (OpenAI reasoning models).
    fn set_option(&self, key: &str, value: Value);

    /// Serialize the canonical request into the vendor wire body.
    fn prepare_request(&self, req: &Request, options: &OptionMap) -> Result<Vec<u8>>;

    /// Same, flagged for streaming; fails fast with `CapabilityNotSupported`
    /// when streaming is not registered for the target model.
    fn prepare_stream_request(&self, req: &Request, options: &OptionMap) -> Result<Vec<u8>>;

    fn parse_response(&self, body: &[u8]) -> Result<Response>;

    /// Single-frame decoder for streaming responses.
    fn parse_stream_response(&self, chunk: &[u8]) -> Result<StreamFrame>;

    /// Capability check for the bound model, or `model` when given.
    fn has_capability(&self, capability: Capability, model: Option<&str>) -> bool;
}

/// Construct an adapter by provider identifier.
pub fn create_provider(
    name: &str,
    api_key: &str,
    model: &str,
    extra_headers: Option<HashMap<String, String>>,
) -> Result<Arc<dyn Provider>> {
    let extra = extra_headers.unwrap_or_default();
    let provider: Arc<dyn Provider> = match name {
        OPENAI => Arc::new(OpenAiProvider::new(api_key, model, extra)),
        ANTHROPIC => Arc::new(AnthropicProvider::new(api_key, model, extra)),
        GEMINI => Arc::new(GeminiProvider::new(api_key, model, extra)),
        COHERE => Arc::new(CohereProvider::new(api_key, model, extra)),
        MISTRAL => Arc::new(MistralProvider::new(api_key, model, extra)),
        GROQ => Arc::new(GroqProvider::new(api_key, model, extra)),
        OLLAMA => Arc::new(OllamaProvider::new(model, extra)),
        DEEPSEEK => Arc::new(DeepSeekProvider::new(api_key, model, extra)),
        OPENROUTER => Arc::new(OpenRouterProvider::new(api_key, model, extra)),
        other => return Err(Error::Configuration(format!("unknown provider: {other}"))),
    };
    Ok(provider)
}

/// Deterministic text rendering of a tool invocation, appended to the
/// natural-language content so callers receive one `Text` value carrying
/// both prose and tool-call markers. `arguments` is embedded verbatim to
/// keep the vendor's JSON byte-faithful.
pub fn format_function_call(name: &str, arguments: &str) -> String {
    let quoted = serde_json::to_string(name).unwrap_or_else(|_| "\"\"".to_string());
    let args = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    format!(r#"{{"function_call":{{"name":{quoted},"arguments":{args}}}}}"#)
}

/// Effective model for a call: request override, then per-call option, then
/// the adapter's bound model.
pub(crate) fn resolve_model(bound: &str, req: &Request, options: &OptionMap) -> String {
    if let Some(model) = req.model.as_deref().filter(|m| !m.is_empty()) {
        return model.to_string();
    }
    if let Some(model) = options.get("model").and_then(Value::as_str).filter(|m| !m.is_empty()) {
        return model.to_string();
    }
    bound.to_string()
}

/// Every adapter rejects an empty message sequence before doing anything
/// else.
pub(crate) fn ensure_messages(req: &Request) -> Result<()> {
    if req.messages.is_empty() {
        return Err(Error::Configuration(
            "request contains no messages".to_string(),
        ));
    }
    Ok(())
}

/// System prompt resolution: `req.system_prompt` wins over
/// `options["system_prompt"]`.
pub(crate) fn resolve_system_prompt(req: &Request, options: &OptionMap) -> Option<String> {
    if let Some(sp) = req.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        return Some(sp.to_string());
    }
    options
        .get("system_prompt")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Tools travel in the option bag as their serialized form.
pub(crate) fn tools_from_options(options: &OptionMap) -> Vec<Tool> {
    options
        .get("tools")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

pub(crate) fn is_global_option(key: &str) -> bool {
    GLOBAL_OPTION_KEYS.contains(&key)
}

/// Merge adapter defaults then per-call options into the body, excluding
/// keys the adapter already consumed. Later sources override earlier ones.
pub(crate) fn merge_remaining_options(
    body: &mut serde_json::Map<String, Value>,
    defaults: &HashMap<String, Value>,
    options: &OptionMap,
    consumed: impl Fn(&str) -> bool,
) {
    for (k, v) in defaults {
        if !is_global_option(k) && !consumed(k) {
            body.insert(k.clone(), v.clone());
        }
    }
    for (k, v) in options {
        if !is_global_option(k) && !consumed(k) {
            body.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn format_function_call_is_deterministic() {
        let rendered = format_function_call("get_weather", r#"{"city":"Oslo"}"#);
        assert_eq!(
            rendered,
            r#"{"function_call":{"name":"get_weather","arguments":{"city":"Oslo"}}}"#
        );
        // The rendered marker is itself valid JSON.
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["function_call"]["name"], "get_weather");
        assert_eq!(parsed["function_call"]["arguments"]["city"], "Oslo");
    }

    #[test]
    fn model_resolution_precedence() {
        let mut options = OptionMap::new();
        options.insert("model".into(), Value::String("from-options".into()));

        let req_with_model = Request {
            messages: vec![Message::user("hi")],
            model: Some("from-request".into()),
            ..Default::default()
        };
        assert_eq!(
            resolve_model("bound", &req_with_model, &options),
            "from-request"
        );

        let req_plain = Request {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        assert_eq!(resolve_model("bound", &req_plain, &options), "from-options");
        assert_eq!(resolve_model("bound", &req_plain, &OptionMap::new()), "bound");
    }

    #[test]
    fn unknown_provider_is_a_configuration_error() {
        let err = create_provider("not-a-vendor", "key", "model", None).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn empty_messages_rejected() {
        let req = Request::default();
        assert!(ensure_messages(&req).is_err());
    }
}
