//! Line-oriented stream framers (SSE and NDJSON) over a byte stream.

use bytes::Bytes;
use futures::StreamExt;

use crate::{BoxStream, Result};

/// One decoded Server-Sent-Events frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, empty when the vendor sends none.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Reads the body line by line, accumulating `event:` and `data:` fields;
/// an empty line dispatches the frame. Comment lines (leading `:`) are
/// skipped, a single space after the field colon is stripped, and multi-line
/// `data:` fields concatenate with newlines.
pub struct SseFramer {
    input: BoxStream<'static, Bytes>,
    buf: String,
}

impl SseFramer {
    pub fn new(input: BoxStream<'static, Bytes>) -> Self {
        Self {
            input,
            buf: String::new(),
        }
    }

    /// Pull the next complete frame. `None` means the body is exhausted;
    /// fields buffered without a terminating blank line are dropped.
    pub async fn next_frame(&mut self) -> Option<Result<SseFrame>> {
        let mut event = String::new();
        let mut data: Vec<String> = Vec::new();

        loop {
            while let Some(idx) = self.buf.find('\n') {
                let line: String = self.buf.drain(..=idx).collect();
                let line = line.trim_end_matches(['\n', '\r']);

                if line.is_empty() {
                    return Some(Ok(SseFrame {
                        event: std::mem::take(&mut event),
                        data: data.join("\n"),
                    }));
                }

                let (name, value) = match line.split_once(':') {
                    Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
                    None => (line, ""),
                };

                match name {
                    // Comment line ("`: keep-alive`").
                    "" => continue,
                    "event" => event = value.to_string(),
                    "data" => data.push(value.to_string()),
                    _ => continue,
                }
            }

            match self.input.next().await {
                Some(Ok(bytes)) => self.buf.push_str(&String::from_utf8_lossy(&bytes)),
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        }
    }
}

/// NDJSON framer: each non-empty line becomes one frame with an empty event
/// name. Used for vendors that stream concatenated JSON objects instead of
/// SSE (Ollama).
pub struct NdjsonFramer {
    input: BoxStream<'static, Bytes>,
    buf: String,
    done: bool,
}

impl NdjsonFramer {
    pub fn new(input: BoxStream<'static, Bytes>) -> Self {
        Self {
            input,
            buf: String::new(),
            done: false,
        }
    }

    pub async fn next_frame(&mut self) -> Option<Result<SseFrame>> {
        loop {
            while let Some(idx) = self.buf.find('\n') {
                let line: String = self.buf.drain(..=idx).collect();
                let line = line.trim();
                if !line.is_empty() {
                    return Some(Ok(SseFrame {
                        event: String::new(),
                        data: line.to_string(),
                    }));
                }
            }

            if self.done {
                let line = self.buf.trim().to_string();
                self.buf.clear();
                if line.is_empty() {
                    return None;
                }
                return Some(Ok(SseFrame {
                    event: String::new(),
                    data: line,
                }));
            }

            match self.input.next().await {
                Some(Ok(bytes)) => self.buf.push_str(&String::from_utf8_lossy(&bytes)),
                Some(Err(e)) => return Some(Err(e)),
                None => self.done = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn byte_stream(chunks: Vec<&'static str>) -> BoxStream<'static, Bytes> {
        Box::pin(stream::iter(
            chunks.into_iter().map(|s| Ok(Bytes::from_static(s.as_bytes()))),
        ))
    }

    #[tokio::test]
    async fn multi_line_data_joins_with_newline() {
        let mut framer = SseFramer::new(byte_stream(vec!["data: a\ndata: b\n\n"]));
        let frame = framer.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.data, "a\nb");
    }

    #[tokio::test]
    async fn event_and_data_accumulate_until_blank_line() {
        let mut framer = SseFramer::new(byte_stream(vec![
            "event: message_start\n",
            "data: {\"x\":1}\n",
            "\n",
            ": a comment\n",
            "data:{\"y\":2}\n\n",
        ]));

        let first = framer.next_frame().await.unwrap().unwrap();
        assert_eq!(first.event, "message_start");
        assert_eq!(first.data, "{\"x\":1}");

        // Comment skipped; missing space after the colon tolerated.
        let second = framer.next_frame().await.unwrap().unwrap();
        assert_eq!(second.event, "");
        assert_eq!(second.data, "{\"y\":2}");

        assert!(framer.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn frames_split_across_chunks() {
        let mut framer = SseFramer::new(byte_stream(vec!["data: hel", "lo\n", "\n"]));
        let frame = framer.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.data, "hello");
    }

    #[tokio::test]
    async fn crlf_lines_are_handled() {
        let mut framer = SseFramer::new(byte_stream(vec!["data: x\r\n\r\n"]));
        let frame = framer.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.data, "x");
    }

    #[tokio::test]
    async fn ndjson_framer_emits_one_object_per_line() {
        let mut framer =
            NdjsonFramer::new(byte_stream(vec!["{\"a\":1}\n{\"b\":", "2}\n", "{\"c\":3}"]));
        assert_eq!(framer.next_frame().await.unwrap().unwrap().data, "{\"a\":1}");
        assert_eq!(framer.next_frame().await.unwrap().unwrap().data, "{\"b\":2}");
        // Trailing object without newline still surfaces at EOF.
        assert_eq!(framer.next_frame().await.unwrap().unwrap().data, "{\"c\":3}");
        assert!(framer.next_frame().await.is_none());
    }
}
