//! `text/event-stream` decoding.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use mime::Mime;
use serde::{Deserialize, Serialize};

use super::{AnyValue, DecodeTarget, Decoder};
use crate::body::{BoxStream, ByteStream};
use crate::error::ClientError;

/// A parsed Server-Sent Event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseEvent {
    /// Optional event ID
    pub id: Option<String>,
    /// Optional event type
    pub event: Option<String>,
    /// Event data, multi-line data joined with `\n`
    pub data: String,
    /// Optional retry interval in milliseconds
    pub retry: Option<u64>,
}

/// Incremental parser turning a byte stream into events
pub struct SseEventStream {
    inner: ByteStream,
    buffer: BytesMut,
    max_event_size: usize,
    finished: bool,
}

impl SseEventStream {
    #[must_use]
    pub fn new(stream: ByteStream, max_event_size: usize) -> Self {
        Self {
            inner: stream,
            buffer: BytesMut::new(),
            max_event_size,
            finished: false,
        }
    }

    /// Read the next event carrying data.
    ///
    /// # Errors
    /// Propagates body errors; fails with [`ClientError::Decoding`] on invalid
    /// UTF-8 or an event larger than the configured limit.
    pub async fn next_event(&mut self) -> Result<Option<SseEvent>, ClientError> {
        loop {
            while let Some(block) = self.take_block() {
                if let Some(event) = parse_event(&block)? {
                    return Ok(Some(event));
                }
            }

            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let rest = self.buffer.split().freeze();
                return parse_event(&rest);
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.extend_from_slice(&chunk);
                    if self.buffer.len() > self.max_event_size && find_separator(&self.buffer).is_none() {
                        self.finished = true;
                        self.buffer.clear();
                        return Err(ClientError::Decoding(format!(
                            "server-sent event exceeds {} bytes",
                            self.max_event_size
                        )));
                    }
                }
                Some(Err(e)) => return Err(e),
                None => self.finished = true,
            }
        }
    }

    /// Remove one complete event block (including its blank line) from the buffer.
    fn take_block(&mut self) -> Option<Bytes> {
        let (end, sep_len) = find_separator(&self.buffer)?;
        let block = self.buffer.split_to(end + sep_len);
        Some(block.freeze().slice(..end))
    }
}

/// Position and length of the first blank-line separator.
fn find_separator(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_event(block: &[u8]) -> Result<Option<SseEvent>, ClientError> {
    let text = std::str::from_utf8(block)
        .map_err(|e| ClientError::Decoding(format!("Invalid UTF-8 in SSE: {e}")))?;

    let mut event = SseEvent::default();
    let mut data_lines = Vec::new();

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => event.id = Some(value.to_owned()),
            "event" => event.event = Some(value.to_owned()),
            "data" => data_lines.push(value),
            "retry" => event.retry = value.trim().parse().ok(),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return Ok(None);
    }
    event.data = data_lines.join("\n");
    Ok(Some(event))
}

/// Decodes `text/event-stream` bodies.
///
/// Targets `SseEvent` yield whole events, `String` yields each event's data,
/// any other type parses the data of each event as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerSentEventDecoder;

fn convert(target: &DecodeTarget, event: SseEvent) -> Result<AnyValue, ClientError> {
    if target.is::<SseEvent>() {
        Ok(Box::new(event))
    } else if target.is::<String>() {
        Ok(Box::new(event.data))
    } else {
        target.from_json(event.data.as_bytes())
    }
}

impl Decoder for ServerSentEventDecoder {
    fn can_decode(&self, _target: &DecodeTarget, media_type: Option<&Mime>) -> bool {
        media_type.is_some_and(|m| m.essence_str() == mime::TEXT_EVENT_STREAM.essence_str())
    }

    fn decode(
        &self,
        target: &DecodeTarget,
        body: Bytes,
        _media_type: Option<&Mime>,
    ) -> Result<AnyValue, ClientError> {
        let mut rest = &body[..];
        while !rest.is_empty() {
            let (block, next) = match find_separator(rest) {
                Some((end, sep)) => (&rest[..end], &rest[end + sep..]),
                None => (rest, &[][..]),
            };
            if let Some(event) = parse_event(block)? {
                return convert(target, event);
            }
            rest = next;
        }
        Err(ClientError::Decoding("event stream contained no events".into()))
    }

    fn decode_stream(
        self: Arc<Self>,
        target: DecodeTarget,
        body: ByteStream,
        _media_type: Option<Mime>,
        max_in_memory_size: usize,
    ) -> BoxStream<Result<AnyValue, ClientError>> {
        let events = SseEventStream::new(body, max_in_memory_size);
        Box::pin(stream::unfold(Some(events), move |state| async move {
            let mut events = state?;
            match events.next_event().await {
                Ok(Some(event)) => Some((convert(&target, event), Some(events))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::downcast;

    fn events_from(chunks: Vec<&'static str>) -> SseEventStream {
        let data = chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes())));
        SseEventStream::new(Box::pin(stream::iter(data)), 1024)
    }

    #[test]
    fn test_parse_simple_event() {
        let event = parse_event(b"data: hello world").unwrap().unwrap();
        assert_eq!(event.data, "hello world");
        assert_eq!(event.id, None);
        assert_eq!(event.event, None);
    }

    #[test]
    fn test_parse_event_with_id() {
        let event = parse_event(b"id: 123\nevent: message\ndata: hello\nretry: 3000")
            .unwrap()
            .unwrap();
        assert_eq!(event.data, "hello");
        assert_eq!(event.id.as_deref(), Some("123"));
        assert_eq!(event.event.as_deref(), Some("message"));
        assert_eq!(event.retry, Some(3000));
    }

    #[test]
    fn test_parse_multiline_data_and_comments() {
        let event = parse_event(b": keep-alive\ndata: line 1\ndata:line 2\ndata")
            .unwrap()
            .unwrap();
        assert_eq!(event.data, "line 1\nline 2\n");
    }

    #[tokio::test]
    async fn test_sse_stream_split_chunks() {
        let mut sse = events_from(vec!["data: event 1\n\nda", "ta: event 2\r\n\r\n", ": ping\n\n"]);

        assert_eq!(sse.next_event().await.unwrap().unwrap().data, "event 1");
        assert_eq!(sse.next_event().await.unwrap().unwrap().data, "event 2");
        assert!(sse.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_typed_data_decoding() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Tick {
            n: u32,
        }

        let body = stream::iter(vec![Ok(Bytes::from_static(
            b"data: {\"n\":1}\n\ndata: {\"n\":2}\n\n",
        ))]);
        let ticks: Vec<Tick> = Arc::new(ServerSentEventDecoder)
            .decode_stream(DecodeTarget::of::<Tick>(), Box::pin(body), None, 1024)
            .map(|v| downcast::<Tick>(v.unwrap()).unwrap())
            .collect()
            .await;
        assert_eq!(ticks, vec![Tick { n: 1 }, Tick { n: 2 }]);
    }

    #[test]
    fn test_only_event_stream_media() {
        let target = DecodeTarget::of::<SseEvent>();
        assert!(ServerSentEventDecoder.can_decode(&target, Some(&mime::TEXT_EVENT_STREAM)));
        assert!(!ServerSentEventDecoder.can_decode(&target, Some(&mime::APPLICATION_JSON)));
    }
}
