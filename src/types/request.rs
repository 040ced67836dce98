//! Canonical request and its builder.

use serde::{Deserialize, Serialize};

use super::message::{Message, Role};

/// Provider-agnostic input to a generation call.
///
/// Adapters never mutate a `Request`; they derive the vendor wire body from
/// it without side effects on the caller's value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Per-call model override; the adapter's bound model applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// JSON Schema requesting structured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }
}

/// Fluent constructor for [`Request`].
#[derive(Debug, Default)]
pub struct RequestBuilder {
    messages: Vec<Message>,
    system_prompt: Option<String>,
    model: Option<String>,
    response_schema: Option<serde_json::Value>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plain user message.
    pub fn prompt(mut self, text: impl Into<String>) -> Self {
        self.messages.push(Message::user(text));
        self
    }

    pub fn message(mut self, role: Role, content: impl Into<String>) -> Self {
        self.messages.push(Message::new(role, content));
        self
    }

    pub fn messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Request structured output conforming to the given JSON Schema.
    pub fn response_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    /// Request structured output shaped like `T`, reflecting the schema from
    /// the type. Only the derived schema is stored; nothing type-level is
    /// transmitted.
    pub fn response_schema_of<T: schemars::JsonSchema>(self) -> Self {
        self.response_schema(crate::schema::schema_of::<T>())
    }

    pub fn build(self) -> Request {
        Request {
            messages: self.messages,
            system_prompt: self.system_prompt,
            model: self.model,
            response_schema: self.response_schema,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_messages_in_order() {
        let req = Request::builder()
            .system_prompt("be terse")
            .prompt("first")
            .message(Role::Assistant, "second")
            .build();
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::User);
        assert_eq!(req.messages[1].role, Role::Assistant);
        assert_eq!(req.system_prompt.as_deref(), Some("be terse"));
    }

    #[test]
    fn schema_from_type_is_stored_as_value() {
        #[derive(schemars::JsonSchema)]
        #[allow(dead_code)]
        struct Answer {
            verdict: String,
            confidence: f64,
        }

        let req = Request::builder()
            .prompt("judge this")
            .response_schema_of::<Answer>()
            .build();
        let schema = req.response_schema.unwrap();
        assert!(schema["properties"]["verdict"].is_object());
    }
}
