//! 流式处理 — 把各厂商的增量响应事件解码成统一的 token 拉取迭代器。
//!
//! Streaming layer. An HTTP body becomes a [`TokenStream`]: the framer
//! assembles vendor frames (SSE or NDJSON), the adapter's
//! `parse_stream_response` decodes each one, and the stream yields
//! [`StreamToken`]s with strictly increasing indices. Decoder hiccups go
//! through the injected [`RetryStrategy`]; cancellation is cooperative via
//! the [`CancelHandle`] returned at stream creation.

pub mod retry;
pub mod sse;

pub use retry::{ExponentialBackoff, NoRetry, RetryStrategy};
pub use sse::{NdjsonFramer, SseFrame, SseFramer};

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::error::Error;
use crate::providers::{Provider, StreamFrame};
use crate::{BoxStream, Result};

/// Default capacity hint for stream buffers.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 4096;

/// A single decoded token from a streaming response.
#[derive(Debug, Clone, Default)]
pub struct StreamToken {
    pub text: String,
    /// The vendor event kind the token was decoded from (`content_block_delta`,
    /// ...). Observability only; callers do not interpret it.
    pub kind: String,
    /// Position in the stream, strictly increasing from 0 across yielded
    /// tokens.
    pub index: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Sender half of the cooperative cancel signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal the stream to stop. Safe to call more than once; the stream
    /// must still be closed to release the connection.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Create a linked cancel handle / receiver pair.
pub fn cancel_pair() -> (CancelHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, rx)
}

/// Wire framing used by a provider's streaming responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Sse,
    Ndjson,
}

enum Framer {
    Sse(SseFramer),
    Ndjson(NdjsonFramer),
}

impl Framer {
    async fn next_frame(&mut self) -> Option<Result<SseFrame>> {
        match self {
            Framer::Sse(f) => f.next_frame().await,
            Framer::Ndjson(f) => f.next_frame().await,
        }
    }
}

/// Pull iterator over a streaming response.
///
/// Single-owner: `next` is not safe to call from two tasks at once (the
/// type is `!Sync` by construction). Streams must be closed, or dropped,
/// to release the underlying HTTP body; `close` is idempotent.
pub struct TokenStream {
    framer: Option<Framer>,
    provider: Arc<dyn Provider>,
    retry: Box<dyn RetryStrategy>,
    cancel: watch::Receiver<bool>,
    index: usize,
}

/// Pends forever once the handle is dropped without firing, so `select!`
/// treats "no cancel signal possible" as "never cancelled".
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl TokenStream {
    /// Wrap a raw byte stream. `cancel` comes from [`cancel_pair`]; pass the
    /// receiver here and hand the [`CancelHandle`] to the caller.
    pub fn new(
        body: BoxStream<'static, Bytes>,
        provider: Arc<dyn Provider>,
        framing: Framing,
        retry: Box<dyn RetryStrategy>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let framer = match framing {
            Framing::Sse => Framer::Sse(SseFramer::new(body)),
            Framing::Ndjson => Framer::Ndjson(NdjsonFramer::new(body)),
        };
        Self {
            framer: Some(framer),
            provider,
            retry,
            cancel,
            index: 0,
        }
    }

    /// Next token; `Ok(None)` at end of stream.
    pub async fn next(&mut self) -> Result<Option<StreamToken>> {
        loop {
            if *self.cancel.borrow() {
                return Err(Error::Cancelled);
            }
            let framer = match self.framer.as_mut() {
                Some(f) => f,
                None => return Ok(None),
            };

            let cancel = &mut self.cancel;
            let frame = tokio::select! {
                _ = cancelled(cancel) => return Err(Error::Cancelled),
                frame = framer.next_frame() => frame,
            };

            let frame = match frame {
                None => {
                    self.framer = None;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    if self.retry.should_retry(&e) {
                        let delay = self.retry.next_delay();
                        tracing::debug!(error = %e, delay_ms = delay.as_millis() as u64, "retrying stream decode");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(e);
                }
                Some(Ok(frame)) => frame,
            };

            if frame.data.is_empty() {
                continue;
            }

            match self.provider.parse_stream_response(frame.data.as_bytes()) {
                Ok(StreamFrame::Token(resp)) => {
                    let mut token = StreamToken {
                        kind: frame.event,
                        index: self.index,
                        ..Default::default()
                    };
                    token.text = resp.as_text().to_string();
                    if let Some(usage) = resp.usage {
                        token.input_tokens = usage.input_tokens;
                        token.output_tokens = usage.output_tokens;
                    }
                    self.index += 1;
                    return Ok(Some(token));
                }
                Ok(StreamFrame::Skip) => continue,
                Ok(StreamFrame::Done) => {
                    self.framer = None;
                    return Ok(None);
                }
                // Likely a partial frame; the framer may assemble a complete
                // one on the next pull.
                Err(e) => {
                    tracing::debug!(error = %e, "dropping undecodable stream frame");
                    continue;
                }
            }
        }
    }

    /// Release the underlying HTTP body. Idempotent.
    pub fn close(&mut self) {
        self.framer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    use crate::providers::Provider;
    use crate::types::{Request, Response, Usage};
    use crate::OptionMap;

    /// Minimal adapter double: every frame whose data is "tok:<x>" yields
    /// text <x>, "done" ends the stream, anything else skips.
    #[derive(Debug)]
    struct FakeProvider;

    impl Provider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn endpoint(&self) -> String {
            "http://localhost/test".into()
        }
        fn headers(&self) -> HashMap<String, String> {
            HashMap::new()
        }
        fn set_extra_headers(&self, _extra: HashMap<String, String>) {}
        fn set_default_options(&self, _cfg: &crate::config::Config) {}
        fn set_option(&self, _key: &str, _value: serde_json::Value) {}
        fn prepare_request(&self, _req: &Request, _options: &OptionMap) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn prepare_stream_request(&self, _req: &Request, _options: &OptionMap) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn parse_response(&self, _body: &[u8]) -> Result<Response> {
            Err(Error::EmptyResponse)
        }
        fn parse_stream_response(&self, chunk: &[u8]) -> Result<StreamFrame> {
            let text = std::str::from_utf8(chunk).unwrap();
            if text == "done" {
                return Ok(StreamFrame::Done);
            }
            match text.strip_prefix("tok:") {
                Some(rest) => Ok(StreamFrame::Token(
                    Response::text(rest).with_usage(Usage::new(1, 0, 1, 0, 0)),
                )),
                None => Ok(StreamFrame::Skip),
            }
        }
        fn has_capability(
            &self,
            _capability: crate::capabilities::Capability,
            _model: Option<&str>,
        ) -> bool {
            true
        }
    }

    fn stream_over(frames: Vec<&'static str>) -> TokenStream {
        let body: BoxStream<'static, Bytes> = Box::pin(stream::iter(
            frames
                .into_iter()
                .map(|s| Ok(Bytes::from_static(s.as_bytes()))),
        ));
        let (_handle, rx) = cancel_pair();
        TokenStream::new(
            body,
            Arc::new(FakeProvider),
            Framing::Sse,
            Box::new(NoRetry),
            rx,
        )
    }

    #[tokio::test]
    async fn indices_are_contiguous_from_zero() {
        let mut stream = stream_over(vec![
            "data: tok:a\n\n",
            "data: noise\n\n",
            "data: tok:b\n\n",
            "data: tok:c\n\n",
            "data: done\n\n",
        ]);
        let mut indices = Vec::new();
        while let Some(token) = stream.next().await.unwrap() {
            indices.push(token.index);
        }
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn done_frame_terminates_and_stays_terminated() {
        let mut stream = stream_over(vec!["data: done\n\n", "data: tok:late\n\n"]);
        assert!(stream.next().await.unwrap().is_none());
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_stream_reports_cancelled() {
        let body: BoxStream<'static, Bytes> = Box::pin(stream::pending());
        let (handle, rx) = cancel_pair();
        let mut stream = TokenStream::new(
            body,
            Arc::new(FakeProvider),
            Framing::Sse,
            Box::new(NoRetry),
            rx,
        );
        handle.cancel();
        assert!(matches!(stream.next().await, Err(Error::Cancelled)));
        // close stays idempotent after cancellation
        stream.close();
        stream.close();
    }

    #[tokio::test]
    async fn usage_propagates_onto_tokens() {
        let mut stream = stream_over(vec!["data: tok:x\n\n"]);
        let token = stream.next().await.unwrap().unwrap();
        assert_eq!(token.input_tokens, 1);
        assert_eq!(token.output_tokens, 1);
        assert_eq!(token.text, "x");
    }
}
