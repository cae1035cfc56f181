use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use mime::Mime;

use super::{
    is_json, is_streaming_json, split_lines, AnyValue, DecodeTarget, Decoder, EncodableValue,
    Encoder, SequenceFraming, TypeDescriptor,
};
use crate::body::{collect_limited, BoxStream, ByteStream};
use crate::error::ClientError;

/// JSON via `serde_json`, including NDJSON and `application/stream+json`.
///
/// Also accepts bodies without a content type.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

fn supports(media_type: Option<&Mime>) -> bool {
    media_type.is_none_or(|m| is_json(m) || is_streaming_json(m))
}

impl Encoder for JsonCodec {
    fn can_encode(&self, _ty: &TypeDescriptor, media_type: Option<&Mime>) -> bool {
        supports(media_type)
    }

    fn default_media_type(&self) -> Mime {
        mime::APPLICATION_JSON
    }

    fn encode(&self, value: &EncodableValue, _media_type: &Mime) -> Result<Bytes, ClientError> {
        value.to_json().map(Bytes::from)
    }

    fn framing(&self, media_type: &Mime) -> SequenceFraming {
        if is_streaming_json(media_type) {
            SequenceFraming {
                prefix: Bytes::new(),
                separator: Bytes::from_static(b"\n"),
                suffix: Bytes::from_static(b"\n"),
            }
        } else {
            SequenceFraming {
                prefix: Bytes::from_static(b"["),
                separator: Bytes::from_static(b","),
                suffix: Bytes::from_static(b"]"),
            }
        }
    }
}

impl Decoder for JsonCodec {
    fn can_decode(&self, _target: &DecodeTarget, media_type: Option<&Mime>) -> bool {
        supports(media_type)
    }

    fn decode(
        &self,
        target: &DecodeTarget,
        body: Bytes,
        _media_type: Option<&Mime>,
    ) -> Result<AnyValue, ClientError> {
        target.from_json(&body)
    }

    fn decode_stream(
        self: Arc<Self>,
        target: DecodeTarget,
        body: ByteStream,
        media_type: Option<Mime>,
        max_in_memory_size: usize,
    ) -> BoxStream<Result<AnyValue, ClientError>> {
        if media_type.as_ref().is_some_and(is_streaming_json) {
            let values = split_lines(body, max_in_memory_size).filter_map(move |line| async move {
                match line {
                    Ok(line) if line.iter().all(u8::is_ascii_whitespace) => None,
                    Ok(line) => Some(target.from_json(&line)),
                    Err(e) => Some(Err(e)),
                }
            });
            return Box::pin(values);
        }

        // a plain JSON body is either an array of elements or one element
        let values = stream::once(async move {
            let bytes = collect_limited(body, max_in_memory_size).await?;
            match bytes.iter().copied().find(|b| !b.is_ascii_whitespace()) {
                None => Ok(Vec::new()),
                Some(b'[') => target.from_json_array(&bytes),
                Some(_) => target.from_json(&bytes).map(|v| vec![v]),
            }
        })
        .flat_map(|decoded| match decoded {
            Ok(values) => stream::iter(values.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        });
        Box::pin(values)
    }
}
