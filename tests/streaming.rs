//! End-to-end streaming behavior: SSE frames through adapter decoding to
//! canonical tokens.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream;

use polyllm::providers::{
    AnthropicProvider, OllamaProvider, OpenAiProvider, Provider,
};
use polyllm::stream::{cancel_pair, Framing, NoRetry, TokenStream};
use polyllm::{BoxStream, Error};

fn byte_stream(chunks: Vec<&'static str>) -> BoxStream<'static, Bytes> {
    Box::pin(stream::iter(
        chunks
            .into_iter()
            .map(|s| Ok(Bytes::from_static(s.as_bytes()))),
    ))
}

fn token_stream(
    provider: Arc<dyn Provider>,
    framing: Framing,
    chunks: Vec<&'static str>,
) -> TokenStream {
    let (_handle, rx) = cancel_pair();
    TokenStream::new(byte_stream(chunks), provider, framing, Box::new(NoRetry), rx)
}

#[tokio::test]
async fn anthropic_text_deltas_index_from_zero() {
    let provider = Arc::new(AnthropicProvider::new(
        "key",
        "claude-3-5-sonnet-20241022",
        HashMap::new(),
    ));
    let mut stream = token_stream(
        provider,
        Framing::Sse,
        vec![
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ],
    );

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.text, "Hel");
    assert_eq!(first.index, 0);
    assert_eq!(first.kind, "content_block_delta");

    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.text, "lo");
    assert_eq!(second.index, 1);

    assert!(stream.next().await.unwrap().is_none());
}

#[tokio::test]
async fn anthropic_usage_interleaves_with_text() {
    let provider = Arc::new(AnthropicProvider::new(
        "key",
        "claude-3-5-sonnet-20241022",
        HashMap::new(),
    ));
    let mut stream = token_stream(
        provider,
        Framing::Sse,
        vec![
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":11,\"output_tokens\":1}}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"x\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"input_tokens\":11,\"output_tokens\":9}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        ],
    );

    let start = stream.next().await.unwrap().unwrap();
    assert_eq!(start.input_tokens, 11);
    assert_eq!(start.text, "");

    let text = stream.next().await.unwrap().unwrap();
    assert_eq!(text.text, "x");

    // Cumulative counts: the latest value is authoritative.
    let tail = stream.next().await.unwrap().unwrap();
    assert_eq!(tail.output_tokens, 9);

    assert!(stream.next().await.unwrap().is_none());
}

#[tokio::test]
async fn openai_done_marker_ends_the_stream() {
    let provider = Arc::new(OpenAiProvider::new("key", "gpt-4o", HashMap::new()));
    let mut stream = token_stream(
        provider,
        Framing::Sse,
        vec![
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"index\":0}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"},\"index\":0}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" World\"},\"index\":0}]}\n\n",
            "data: [DONE]\n\n",
        ],
    );

    let mut texts = Vec::new();
    while let Some(token) = stream.next().await.unwrap() {
        texts.push(token.text);
    }
    assert_eq!(texts, vec!["Hello", " World"]);
}

#[tokio::test]
async fn ollama_ndjson_frames_and_terminal_usage() {
    let provider = Arc::new(OllamaProvider::new("llama3.1", HashMap::new()));
    let mut stream = token_stream(
        provider,
        Framing::Ndjson,
        vec![
            "{\"response\":\"he\",\"done\":false}\n",
            "{\"response\":\"llo\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true,\"prompt_eval_count\":3,\"eval_count\":7}\n",
        ],
    );

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.text, "he");
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.text, "llo");

    let usage = stream.next().await.unwrap().unwrap();
    assert_eq!(usage.text, "");
    assert_eq!(usage.output_tokens, 7);

    assert!(stream.next().await.unwrap().is_none());
}

#[tokio::test]
async fn cancellation_surfaces_and_close_is_idempotent() {
    let provider = Arc::new(OpenAiProvider::new("key", "gpt-4o", HashMap::new()));
    let body: BoxStream<'static, Bytes> = Box::pin(stream::pending());
    let (handle, rx) = cancel_pair();
    let mut stream = TokenStream::new(body, provider, Framing::Sse, Box::new(NoRetry), rx);

    handle.cancel();
    assert!(matches!(stream.next().await, Err(Error::Cancelled)));

    stream.close();
    stream.close();
    assert!(stream.next().await.unwrap().is_none());
}

#[tokio::test]
async fn undecodable_frames_are_dropped_not_fatal() {
    let provider = Arc::new(OpenAiProvider::new("key", "gpt-4o", HashMap::new()));
    let mut stream = token_stream(
        provider,
        Framing::Sse,
        vec![
            "data: {not json\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"index\":0}]}\n\n",
            "data: [DONE]\n\n",
        ],
    );

    let token = stream.next().await.unwrap().unwrap();
    assert_eq!(token.text, "ok");
    assert_eq!(token.index, 0);
    assert!(stream.next().await.unwrap().is_none());
}

#[test]
fn concurrent_set_option_writers_are_safe() {
    let provider = Arc::new(OpenAiProvider::new("key", "gpt-4", HashMap::new()));

    let mut handles = Vec::new();
    for i in 0..100 {
        let provider = Arc::clone(&provider);
        handles.push(std::thread::spawn(move || {
            provider.set_option(&format!("key{i}"), serde_json::json!(i));
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let req = polyllm::Request::builder().prompt("hi").build();
    let body = provider
        .prepare_request(&req, &polyllm::OptionMap::new())
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    for i in 0..100 {
        assert_eq!(body[format!("key{i}")], i, "option key{i} lost");
    }
}
