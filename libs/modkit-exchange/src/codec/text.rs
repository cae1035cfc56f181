use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use mime::Mime;

use super::{split_lines, AnyValue, DecodeTarget, Decoder, EncodableValue, Encoder, TypeDescriptor};
use crate::body::{BoxStream, ByteStream};
use crate::error::ClientError;

/// Raw bytes in both directions: `Bytes` and `Vec<u8>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

fn is_raw(ty: &TypeDescriptor) -> bool {
    ty.is::<Bytes>() || ty.is::<Vec<u8>>()
}

impl Encoder for BytesCodec {
    fn can_encode(&self, ty: &TypeDescriptor, _media_type: Option<&Mime>) -> bool {
        is_raw(ty)
    }

    fn default_media_type(&self) -> Mime {
        mime::APPLICATION_OCTET_STREAM
    }

    fn encode(&self, value: &EncodableValue, _media_type: &Mime) -> Result<Bytes, ClientError> {
        if let Some(b) = value.downcast_ref::<Bytes>() {
            return Ok(b.clone());
        }
        value
            .downcast_ref::<Vec<u8>>()
            .map(|v| Bytes::copy_from_slice(v))
            .ok_or_else(|| {
                ClientError::Encoding(format!("{:?} is not a byte buffer", value.type_descriptor()))
            })
    }
}

impl Decoder for BytesCodec {
    fn can_decode(&self, target: &DecodeTarget, _media_type: Option<&Mime>) -> bool {
        is_raw(target.type_descriptor())
    }

    fn decode(
        &self,
        target: &DecodeTarget,
        body: Bytes,
        _media_type: Option<&Mime>,
    ) -> Result<AnyValue, ClientError> {
        if target.is::<Vec<u8>>() {
            Ok(Box::new(body.to_vec()))
        } else {
            Ok(Box::new(body))
        }
    }

    fn decode_stream(
        self: Arc<Self>,
        target: DecodeTarget,
        body: ByteStream,
        media_type: Option<Mime>,
        _max_in_memory_size: usize,
    ) -> BoxStream<Result<AnyValue, ClientError>> {
        // chunks pass through as they arrive
        Box::pin(body.map(move |chunk| self.decode(&target, chunk?, media_type.as_ref())))
    }
}

/// UTF-8 text: `String` values and targets, any content type.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Encoder for StringCodec {
    fn can_encode(&self, ty: &TypeDescriptor, _media_type: Option<&Mime>) -> bool {
        ty.is::<String>() || ty.is::<&'static str>()
    }

    fn default_media_type(&self) -> Mime {
        mime::TEXT_PLAIN_UTF_8
    }

    fn encode(&self, value: &EncodableValue, _media_type: &Mime) -> Result<Bytes, ClientError> {
        if let Some(s) = value.downcast_ref::<String>() {
            return Ok(Bytes::copy_from_slice(s.as_bytes()));
        }
        value
            .downcast_ref::<&'static str>()
            .map(|s| Bytes::from_static(s.as_bytes()))
            .ok_or_else(|| {
                ClientError::Encoding(format!("{:?} is not a string", value.type_descriptor()))
            })
    }
}

fn utf8(body: Bytes) -> Result<String, ClientError> {
    String::from_utf8(body.to_vec())
        .map_err(|e| ClientError::Decoding(format!("Invalid UTF-8: {e}")))
}

impl Decoder for StringCodec {
    fn can_decode(&self, target: &DecodeTarget, _media_type: Option<&Mime>) -> bool {
        target.is::<String>()
    }

    fn decode(
        &self,
        _target: &DecodeTarget,
        body: Bytes,
        _media_type: Option<&Mime>,
    ) -> Result<AnyValue, ClientError> {
        Ok(Box::new(utf8(body)?))
    }

    fn decode_stream(
        self: Arc<Self>,
        _target: DecodeTarget,
        body: ByteStream,
        _media_type: Option<Mime>,
        max_in_memory_size: usize,
    ) -> BoxStream<Result<AnyValue, ClientError>> {
        Box::pin(
            split_lines(body, max_in_memory_size)
                .map(|line| utf8(line?).map(|s| Box::new(s) as AnyValue)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::downcast;
    use futures::stream;

    #[test]
    fn test_string_roundtrip_types() {
        let encoded = StringCodec
            .encode(&EncodableValue::new("hello"), &mime::TEXT_PLAIN)
            .unwrap();
        assert_eq!(encoded, Bytes::from_static(b"hello"));

        let decoded = StringCodec
            .decode(&DecodeTarget::of::<String>(), encoded, None)
            .unwrap();
        assert_eq!(downcast::<String>(decoded).unwrap(), "hello");
    }

    #[test]
    fn test_invalid_utf8() {
        let err = StringCodec
            .decode(
                &DecodeTarget::of::<String>(),
                Bytes::from_static(&[0xff, 0xfe]),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ClientError::Decoding(_)));
    }

    #[tokio::test]
    async fn test_string_lines() {
        let chunks = vec![Ok(Bytes::from_static(b"a\nb")), Ok(Bytes::from_static(b"c\n"))];
        let lines: Vec<String> = Arc::new(StringCodec)
            .decode_stream(
                DecodeTarget::of::<String>(),
                Box::pin(stream::iter(chunks)),
                None,
                1024,
            )
            .map(|v| downcast::<String>(v.unwrap()).unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["a", "bc"]);
    }

    #[test]
    fn test_bytes_targets() {
        let vec_target = DecodeTarget::of::<Vec<u8>>();
        assert!(BytesCodec.can_decode(&vec_target, None));
        let v = BytesCodec
            .decode(&vec_target, Bytes::from_static(&[1, 2]), None)
            .unwrap();
        assert_eq!(downcast::<Vec<u8>>(v).unwrap(), vec![1, 2]);
        assert!(!BytesCodec.can_decode(&DecodeTarget::of::<String>(), None));
    }
}
