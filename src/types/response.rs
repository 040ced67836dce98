//! Canonical response and token-usage accounting.

use serde::{Deserialize, Serialize};

use super::message::Role;

/// Provider-agnostic generation result.
///
/// A `Response` with no `content` but a `usage` carries a usage-only update
/// (some vendors send token counts on a trailing stream frame).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Response {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            role: Some(Role::Assistant),
            content: Some(Content::Text { text: value.into() }),
            usage: None,
        }
    }

    pub fn usage_only(usage: Usage) -> Self {
        Self {
            role: None,
            content: None,
            usage: Some(usage),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Flattened text view of the content; empty when there is none.
    pub fn as_text(&self) -> &str {
        match &self.content {
            Some(Content::Text { text }) => text,
            None => "",
        }
    }
}

/// Response content. Only text exists today; the enum is non-exhaustive so
/// future variants (image, audio) do not break downstream matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
#[non_exhaustive]
pub enum Content {
    Text { text: String },
}

/// Token-accounting record.
///
/// Counts a vendor does not report stay zero. For vendors that send
/// incremental counts during streaming, each emission is cumulative over the
/// whole request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub reasoning_tokens: u64,
}

impl Usage {
    /// Normalizing constructor used by all adapters.
    pub fn new(
        input_tokens: u64,
        cache_creation_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        reasoning_tokens: u64,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cache_creation_tokens,
            cache_read_tokens,
            reasoning_tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cache_creation_tokens: self.cache_creation_tokens + rhs.cache_creation_tokens,
            cache_read_tokens: self.cache_read_tokens + rhs.cache_read_tokens,
            reasoning_tokens: self.reasoning_tokens + rhs.reasoning_tokens,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}
