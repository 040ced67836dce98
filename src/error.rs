//! 错误处理模块：整个库共用的统一错误类型。
//!
//! # Error Handling Module
//!
//! A single [`Error`] enum covers every failure the library can surface:
//!
//! | Variant | Description |
//! |---------|-------------|
//! | `Configuration` | Bad construction input: unknown provider, empty request, malformed model override |
//! | `CapabilityNotSupported` | The (provider, model) pair has no registration for a requested feature |
//! | `Schema` | A structured-response schema exceeds the descriptor limits |
//! | `Encoding` | The request body could not be marshaled to JSON |
//! | `Transport` | HTTP-layer failure, propagated without wrapping |
//! | `Api` | The vendor answered with a non-success HTTP status |
//! | `MalformedResponse` | The vendor body is not valid JSON in the expected shape |
//! | `EmptyResponse` | Structurally valid but semantically empty payload |
//! | `CapabilityNotFound` / `DescriptorTypeMismatch` | Typed registry retrieval failures |
//! | `Cancelled` | The caller's cancel signal fired while waiting on a stream |
//!
//! Frame-skipping during streaming is *not* an error: adapters return
//! [`StreamFrame::Skip`](crate::providers::StreamFrame) and the token stream
//! drops the frame silently.

use crate::capabilities::Capability;
use thiserror::Error;

/// Unified error type for the library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{capability} is not supported by {provider}/{model}")]
    CapabilityNotSupported {
        provider: String,
        model: String,
        capability: Capability,
    },

    #[error("schema error: {message}{}", .hint.as_ref().map(|h| format!("\n💡 Hint: {}", h)).unwrap_or_default())]
    Schema {
        message: String,
        hint: Option<String>,
    },

    #[error("failed to encode request body: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error: HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("empty response from provider")]
    EmptyResponse,

    #[error("{capability} not registered for {provider}/{model}")]
    CapabilityNotFound {
        provider: String,
        model: String,
        capability: Capability,
    },

    #[error("capability config type mismatch: expected {expected}, got {actual}")]
    DescriptorTypeMismatch {
        expected: Capability,
        actual: Capability,
    },

    #[error("stream cancelled")]
    Cancelled,
}

impl Error {
    /// Shorthand for a plain schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Error::Schema {
            message: message.into(),
            hint: None,
        }
    }

    /// Attach an actionable hint to a schema error.
    pub fn schema_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Error::Schema {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    /// True when retrying the operation could plausibly succeed.
    ///
    /// Only transport-level failures qualify; everything else is
    /// deterministic and surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
