//! Shared wire shapes for the OpenAI chat-completions dialect.
//!
//! OpenAI, Groq, Mistral, DeepSeek and OpenRouter all speak close variants
//! of this format; the common conversion and parsing lives here and each
//! adapter layers its own quirks on top.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Error;
use crate::types::{Message, Response, Tool, Usage};
use crate::Result;

use super::{format_function_call, StreamFrame};

/// Render canonical messages into the `messages` array.
pub(crate) fn convert_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let mut obj = json!({
                "role": msg.role.as_str(),
                "content": msg.content,
            });
            if let Some(name) = &msg.name {
                obj["name"] = json!(name);
            }
            if let Some(id) = &msg.tool_call_id {
                obj["tool_call_id"] = json!(id);
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
                obj["tool_calls"] = Value::Array(calls);
            }
            obj
        })
        .collect()
}

/// Render canonical tools into the `tools` array. `strict` adds OpenAI's
/// strict-schema marker.
pub(crate) fn convert_tools(tools: &[Tool], strict: bool) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut obj = json!({
                "type": "function",
                "function": {
                    "name": tool.function.name,
                    "description": tool.function.description.clone().unwrap_or_default(),
                    "parameters": tool.function.parameters,
                },
            });
            if strict {
                obj["strict"] = json!(true);
            }
            obj
        })
        .collect()
}

/// Arguments arrive either as a JSON string (the documented shape) or as an
/// inline object on lenient vendors; either way the raw JSON text comes out.
pub(crate) fn raw_arguments(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub usage: Option<ChatUsage>,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireToolCall {
    pub function: WireFunction,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default)]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PromptTokensDetails {
    #[serde(default, alias = "cache_tokens")]
    pub cached_tokens: u64,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl ChatUsage {
    pub(crate) fn to_usage(&self) -> Usage {
        Usage::new(
            self.prompt_tokens,
            0,
            self.completion_tokens,
            self.prompt_tokens_details
                .as_ref()
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
            self.completion_tokens_details
                .as_ref()
                .map(|d| d.reasoning_tokens)
                .unwrap_or(0),
        )
    }
}

/// Unary response parser for the dialect: text content, or tool calls
/// folded into the text through the common function-call formatter.
pub(crate) fn parse_chat_response(body: &[u8]) -> Result<Response> {
    let response: ChatResponse = serde_json::from_slice(body)
        .map_err(|e| Error::MalformedResponse(e.to_string()))?;

    if response.choices.is_empty() {
        return Err(Error::EmptyResponse);
    }

    let usage = response.usage.as_ref().map(ChatUsage::to_usage);
    let message = &response.choices[0].message;

    if let Some(content) = message.content.as_deref().filter(|c| !c.is_empty()) {
        let mut resp = Response::text(content);
        resp.usage = usage;
        return Ok(resp);
    }

    if !message.tool_calls.is_empty() {
        let calls: Vec<String> = message
            .tool_calls
            .iter()
            .map(|call| {
                format_function_call(&call.function.name, &raw_arguments(&call.function.arguments))
            })
            .collect();
        let mut resp = Response::text(calls.join("\n"));
        resp.usage = usage;
        return Ok(resp);
    }

    Err(Error::EmptyResponse)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatStreamChunk {
    #[serde(default)]
    pub usage: Option<ChatUsage>,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

/// Single-frame stream decoder for the dialect.
///
/// `[DONE]` and a non-empty `finish_reason` terminate; role-only deltas
/// skip; a trailing usage-only chunk (choices empty, usage present) yields a
/// usage-only token so `stream_options.include_usage` counts surface.
pub(crate) fn parse_chat_stream(chunk: &[u8]) -> Result<StreamFrame> {
    let trimmed = std::str::from_utf8(chunk)
        .map_err(|e| Error::MalformedResponse(e.to_string()))?
        .trim();
    if trimmed.is_empty() {
        return Ok(StreamFrame::Skip);
    }
    if trimmed == "[DONE]" {
        return Ok(StreamFrame::Done);
    }

    let response: ChatStreamChunk =
        serde_json::from_str(trimmed).map_err(|e| Error::MalformedResponse(e.to_string()))?;

    if response.choices.is_empty() {
        if let Some(usage) = response.usage.as_ref() {
            return Ok(StreamFrame::Token(Response::usage_only(usage.to_usage())));
        }
        return Ok(StreamFrame::Skip);
    }

    let choice = &response.choices[0];
    if choice.finish_reason.as_deref().is_some_and(|r| !r.is_empty()) {
        return Ok(StreamFrame::Done);
    }

    // Role announcements and other empty deltas carry nothing.
    let content = choice.delta.content.as_deref().unwrap_or("");
    if content.is_empty() {
        return Ok(StreamFrame::Skip);
    }

    let mut resp = Response::text(content);
    resp.usage = response.usage.as_ref().map(ChatUsage::to_usage);
    Ok(StreamFrame::Token(resp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, ToolCall};

    #[test]
    fn messages_carry_tool_fields() {
        let msg = Message::new(Role::Assistant, "on it")
            .with_tool_calls(vec![ToolCall::function("c1", "lookup", r#"{"q":"x"}"#)]);
        let wire = convert_messages(&[msg]);
        assert_eq!(wire[0]["tool_calls"][0]["id"], "c1");
        assert_eq!(wire[0]["tool_calls"][0]["function"]["arguments"], r#"{"q":"x"}"#);
    }

    #[test]
    fn empty_body_is_empty_response() {
        assert!(matches!(
            parse_chat_response(b"{}"),
            Err(Error::EmptyResponse)
        ));
    }

    #[test]
    fn tool_calls_fold_into_text() {
        let body = br#"{"choices":[{"message":{"content":"","tool_calls":[
            {"id":"a","type":"function","function":{"name":"f","arguments":"{\"k\":1}"}}
        ]}}]}"#;
        let resp = parse_chat_response(body).unwrap();
        assert_eq!(
            resp.as_text(),
            r#"{"function_call":{"name":"f","arguments":{"k":1}}}"#
        );
    }

    #[test]
    fn done_marker_terminates() {
        assert!(matches!(
            parse_chat_stream(b"[DONE]").unwrap(),
            StreamFrame::Done
        ));
    }

    #[test]
    fn role_only_delta_skips() {
        let chunk = br#"{"choices":[{"delta":{"role":"assistant"},"index":0}]}"#;
        assert!(matches!(
            parse_chat_stream(chunk).unwrap(),
            StreamFrame::Skip
        ));
    }

    #[test]
    fn usage_only_chunk_yields_usage_token() {
        let chunk = br#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7}}"#;
        match parse_chat_stream(chunk).unwrap() {
            StreamFrame::Token(resp) => {
                assert_eq!(resp.as_text(), "");
                assert_eq!(resp.usage.unwrap().output_tokens, 7);
            }
            other => panic!("expected usage token, got {other:?}"),
        }
    }
}
