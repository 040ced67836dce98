//! # polyllm
//!
//! One client for many LLM HTTP back-ends. OpenAI, Anthropic, Google
//! Gemini, Cohere, Mistral, Groq, Ollama, DeepSeek and OpenRouter sit
//! behind a single [`Provider`](providers::Provider) contract: canonical
//! requests in, canonical responses or token streams out, with each
//! vendor's quirks handled inside its adapter.
//!
//! The moving parts:
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Canonical request/message/tool/response model |
//! | [`capabilities`] | Per-(provider, model) feature descriptors and the process-wide registry |
//! | [`providers`] | The nine vendor adapters and their factory |
//! | [`stream`] | SSE/NDJSON framing and the pull-based token stream |
//! | [`client`] | `reqwest`-backed unary and streaming execution |
//!
//! ```rust,no_run
//! use polyllm::{client_for, Request};
//!
//! # async fn demo() -> polyllm::Result<()> {
//! let client = client_for("anthropic", "sk-...", "claude-3-5-sonnet", None)?;
//! let request = Request::builder()
//!     .system_prompt("Answer in one sentence.")
//!     .prompt("Why is the sky blue?")
//!     .build();
//! let response = client.generate(&request).await?;
//! println!("{}", response.as_text());
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod client;
pub mod config;
pub mod error;
pub mod providers;
pub mod schema;
pub mod stream;
pub mod types;

use std::pin::Pin;

use futures::Stream;

pub use capabilities::{registry, Capability, CapabilityConfig, CapabilityRegistry};
pub use client::{client_for, LlmClient};
pub use config::Config;
pub use error::Error;
pub use providers::{create_provider, OptionMap, Provider, StreamFrame};
pub use stream::{CancelHandle, RetryStrategy, StreamToken, TokenStream};
pub use types::{Message, Request, RequestBuilder, Response, Role, Tool, Usage};

/// Result type alias for the library.
pub type Result<T> = std::result::Result<T, Error>;

/// A pinned, boxed stream of fallible items.
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;
