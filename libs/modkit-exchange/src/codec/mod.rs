//! Body codecs and the registry that selects them.
//!
//! Values cross the registry type-erased: requests carry an
//! [`EncodableValue`] and decoders produce an [`AnyValue`] that the caller
//! downcasts back into the requested type. Both sides keep monomorphized
//! serde hooks so format codecs can work with any `Serialize` /
//! `DeserializeOwned` type without knowing it statically.

mod form;
mod json;
pub mod sse;
mod text;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use mime::Mime;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::body::{collect_limited, BoxStream, ByteStream};
use crate::error::ClientError;

pub use form::FormEncoder;
pub use json::JsonCodec;
pub use sse::ServerSentEventDecoder;
pub use text::{BytesCodec, StringCodec};

/// Default limit for bodies buffered in memory before decoding.
pub const DEFAULT_MAX_IN_MEMORY_SIZE: usize = 256 * 1024;

/// Type-erased decoded value.
pub type AnyValue = Box<dyn Any + Send>;

/// Runtime identity of a body type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    id: TypeId,
    name: &'static str,
}

impl TypeDescriptor {
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

type ErasedRef<'a> = &'a (dyn Any + Send + Sync);

/// A request body value together with the hooks needed to serialize it.
#[derive(Clone)]
pub struct EncodableValue {
    value: Arc<dyn Any + Send + Sync>,
    ty: TypeDescriptor,
    to_json: fn(ErasedRef<'_>) -> Result<Vec<u8>, ClientError>,
    to_form: fn(ErasedRef<'_>) -> Result<String, ClientError>,
}

impl EncodableValue {
    #[must_use]
    pub fn new<T>(value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self {
            value: Arc::new(value),
            ty: TypeDescriptor::of::<T>(),
            to_json: json_of::<T>,
            to_form: form_of::<T>,
        }
    }

    #[must_use]
    pub fn type_descriptor(&self) -> &TypeDescriptor {
        &self.ty
    }

    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Serialize as JSON.
    ///
    /// # Errors
    /// Returns [`ClientError::Encoding`] if serde rejects the value.
    pub fn to_json(&self) -> Result<Vec<u8>, ClientError> {
        (self.to_json)(self.value.as_ref())
    }

    /// Serialize as `application/x-www-form-urlencoded`.
    ///
    /// # Errors
    /// Returns [`ClientError::Encoding`] if the value is not a flat map or struct.
    pub fn to_form(&self) -> Result<String, ClientError> {
        (self.to_form)(self.value.as_ref())
    }
}

impl fmt::Debug for EncodableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EncodableValue").field(&self.ty).finish()
    }
}

fn downcast_for_encoding<T: 'static>(value: ErasedRef<'_>) -> Result<&T, ClientError> {
    value.downcast_ref::<T>().ok_or_else(|| {
        ClientError::Encoding(format!(
            "value is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

fn json_of<T: Serialize + 'static>(value: ErasedRef<'_>) -> Result<Vec<u8>, ClientError> {
    serde_json::to_vec(downcast_for_encoding::<T>(value)?)
        .map_err(|e| ClientError::Encoding(e.to_string()))
}

fn form_of<T: Serialize + 'static>(value: ErasedRef<'_>) -> Result<String, ClientError> {
    serde_urlencoded::to_string(downcast_for_encoding::<T>(value)?)
        .map_err(|e| ClientError::Encoding(e.to_string()))
}

/// The type a response body is decoded into, with its serde hooks.
#[derive(Clone, Copy)]
pub struct DecodeTarget {
    ty: TypeDescriptor,
    from_json: fn(&[u8]) -> Result<AnyValue, ClientError>,
    from_json_array: fn(&[u8]) -> Result<Vec<AnyValue>, ClientError>,
}

impl DecodeTarget {
    #[must_use]
    pub fn of<T>() -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        Self {
            ty: TypeDescriptor::of::<T>(),
            from_json: value_from_json::<T>,
            from_json_array: array_from_json::<T>,
        }
    }

    #[must_use]
    pub fn type_descriptor(&self) -> &TypeDescriptor {
        &self.ty
    }

    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.ty.is::<T>()
    }

    /// Deserialize one JSON document into the target type.
    ///
    /// # Errors
    /// Returns [`ClientError::Decoding`] on malformed input.
    pub fn from_json(&self, bytes: &[u8]) -> Result<AnyValue, ClientError> {
        (self.from_json)(bytes)
    }

    /// Deserialize a JSON array into values of the target type.
    ///
    /// # Errors
    /// Returns [`ClientError::Decoding`] on malformed input.
    pub fn from_json_array(&self, bytes: &[u8]) -> Result<Vec<AnyValue>, ClientError> {
        (self.from_json_array)(bytes)
    }
}

impl fmt::Debug for DecodeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DecodeTarget").field(&self.ty).finish()
    }
}

fn value_from_json<T: DeserializeOwned + Send + 'static>(
    bytes: &[u8],
) -> Result<AnyValue, ClientError> {
    let value: T = serde_json::from_slice(bytes)?;
    Ok(Box::new(value))
}

fn array_from_json<T: DeserializeOwned + Send + 'static>(
    bytes: &[u8],
) -> Result<Vec<AnyValue>, ClientError> {
    let values: Vec<T> = serde_json::from_slice(bytes)?;
    Ok(values
        .into_iter()
        .map(|v| Box::new(v) as AnyValue)
        .collect())
}

/// Recover a concrete value from a decoder's output.
pub(crate) fn downcast<T: 'static>(value: AnyValue) -> Result<T, ClientError> {
    value.downcast::<T>().map(|v| *v).map_err(|_| {
        ClientError::Decoding(format!(
            "decoder produced a value that is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Bytes emitted around and between the elements of an encoded sequence.
#[derive(Debug, Clone, Default)]
pub struct SequenceFraming {
    pub prefix: Bytes,
    pub separator: Bytes,
    pub suffix: Bytes,
}

/// Serializes request body values.
pub trait Encoder: Send + Sync {
    fn can_encode(&self, ty: &TypeDescriptor, media_type: Option<&Mime>) -> bool;

    /// Content type used when the request declares none.
    fn default_media_type(&self) -> Mime;

    /// Encode a single value.
    ///
    /// # Errors
    /// Returns [`ClientError::Encoding`] when the value cannot be serialized.
    fn encode(&self, value: &EncodableValue, media_type: &Mime) -> Result<Bytes, ClientError>;

    /// Framing applied when encoding a sequence of values.
    fn framing(&self, _media_type: &Mime) -> SequenceFraming {
        SequenceFraming::default()
    }
}

/// Deserializes response bodies.
pub trait Decoder: Send + Sync + 'static {
    fn can_decode(&self, target: &DecodeTarget, media_type: Option<&Mime>) -> bool;

    /// Decode a fully buffered body into one value.
    ///
    /// # Errors
    /// Returns [`ClientError::Decoding`] on malformed input.
    fn decode(
        &self,
        target: &DecodeTarget,
        body: Bytes,
        media_type: Option<&Mime>,
    ) -> Result<AnyValue, ClientError>;

    /// Decode a body incrementally into a sequence of values.
    ///
    /// The default buffers the whole body (up to `max_in_memory_size`) and
    /// yields one value.
    fn decode_stream(
        self: Arc<Self>,
        target: DecodeTarget,
        body: ByteStream,
        media_type: Option<Mime>,
        max_in_memory_size: usize,
    ) -> BoxStream<Result<AnyValue, ClientError>> {
        Box::pin(stream::once(async move {
            let bytes = collect_limited(body, max_in_memory_size).await?;
            self.decode(&target, bytes, media_type.as_ref())
        }))
    }
}

/// Lookup of encoders and decoders by type and content type.
pub trait CodecRegistry: Send + Sync {
    fn find_encoder(
        &self,
        ty: &TypeDescriptor,
        media_type: Option<&Mime>,
    ) -> Option<Arc<dyn Encoder>>;

    fn find_decoder(
        &self,
        target: &DecodeTarget,
        media_type: Option<&Mime>,
    ) -> Option<Arc<dyn Decoder>>;

    /// Upper bound on bytes buffered for single-value decoding.
    fn max_in_memory_size(&self) -> usize {
        DEFAULT_MAX_IN_MEMORY_SIZE
    }
}

/// Ordered codec registry: custom codecs first, then the defaults.
#[derive(Clone)]
pub struct Codecs {
    encoders: Vec<Arc<dyn Encoder>>,
    decoders: Vec<Arc<dyn Decoder>>,
    max_in_memory_size: usize,
}

impl Codecs {
    #[must_use]
    pub fn builder() -> CodecsBuilder {
        CodecsBuilder::default()
    }
}

impl Default for Codecs {
    fn default() -> Self {
        CodecsBuilder::default().build()
    }
}

impl fmt::Debug for Codecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codecs")
            .field("encoders", &self.encoders.len())
            .field("decoders", &self.decoders.len())
            .field("max_in_memory_size", &self.max_in_memory_size)
            .finish()
    }
}

impl CodecRegistry for Codecs {
    fn find_encoder(
        &self,
        ty: &TypeDescriptor,
        media_type: Option<&Mime>,
    ) -> Option<Arc<dyn Encoder>> {
        self.encoders
            .iter()
            .find(|e| e.can_encode(ty, media_type))
            .cloned()
    }

    fn find_decoder(
        &self,
        target: &DecodeTarget,
        media_type: Option<&Mime>,
    ) -> Option<Arc<dyn Decoder>> {
        self.decoders
            .iter()
            .find(|d| d.can_decode(target, media_type))
            .cloned()
    }

    fn max_in_memory_size(&self) -> usize {
        self.max_in_memory_size
    }
}

/// Builder for [`Codecs`]
pub struct CodecsBuilder {
    custom_encoders: Vec<Arc<dyn Encoder>>,
    custom_decoders: Vec<Arc<dyn Decoder>>,
    register_defaults: bool,
    max_in_memory_size: usize,
}

impl Default for CodecsBuilder {
    fn default() -> Self {
        Self {
            custom_encoders: Vec::new(),
            custom_decoders: Vec::new(),
            register_defaults: true,
            max_in_memory_size: DEFAULT_MAX_IN_MEMORY_SIZE,
        }
    }
}

impl CodecsBuilder {
    /// Add an encoder consulted before the defaults
    #[must_use]
    pub fn encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.custom_encoders.push(Arc::new(encoder));
        self
    }

    /// Add a decoder consulted before the defaults
    #[must_use]
    pub fn decoder(mut self, decoder: impl Decoder) -> Self {
        self.custom_decoders.push(Arc::new(decoder));
        self
    }

    /// Whether the built-in codecs are registered after the custom ones
    #[must_use]
    pub fn register_defaults(mut self, register: bool) -> Self {
        self.register_defaults = register;
        self
    }

    #[must_use]
    pub fn max_in_memory_size(mut self, bytes: usize) -> Self {
        self.max_in_memory_size = bytes;
        self
    }

    #[must_use]
    pub fn build(self) -> Codecs {
        let mut encoders = self.custom_encoders;
        let mut decoders = self.custom_decoders;
        if self.register_defaults {
            encoders.push(Arc::new(BytesCodec));
            encoders.push(Arc::new(StringCodec));
            encoders.push(Arc::new(FormEncoder));
            encoders.push(Arc::new(JsonCodec));

            decoders.push(Arc::new(ServerSentEventDecoder));
            decoders.push(Arc::new(BytesCodec));
            decoders.push(Arc::new(StringCodec));
            decoders.push(Arc::new(JsonCodec));
        }
        Codecs {
            encoders,
            decoders,
            max_in_memory_size: self.max_in_memory_size,
        }
    }
}

/// Apply `framing` around a stream of already-encoded elements.
pub(crate) fn frame_sequence(
    elements: BoxStream<Result<Bytes, ClientError>>,
    framing: SequenceFraming,
) -> ByteStream {
    let SequenceFraming {
        prefix,
        separator,
        suffix,
    } = framing;

    let body = elements.enumerate().map(move |(i, chunk)| -> Result<Bytes, ClientError> {
        let chunk = chunk?;
        if i == 0 || separator.is_empty() {
            return Ok(chunk);
        }
        let mut buf = BytesMut::with_capacity(separator.len() + chunk.len());
        buf.extend_from_slice(&separator);
        buf.extend_from_slice(&chunk);
        Ok(buf.freeze())
    });

    let head = stream::iter((!prefix.is_empty()).then(|| Ok::<_, ClientError>(prefix)));
    let tail = stream::iter((!suffix.is_empty()).then(|| Ok::<_, ClientError>(suffix)));
    Box::pin(head.chain(body).chain(tail))
}

/// Split a chunk stream on `\n`, stripping a trailing `\r`.
///
/// Fails once a single line grows beyond `max_line_len` bytes.
pub(crate) fn split_lines(body: ByteStream, max_line_len: usize) -> ByteStream {
    struct State {
        inner: ByteStream,
        buf: BytesMut,
        done: bool,
    }

    let state = State {
        inner: body,
        buf: BytesMut::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let mut line = st.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Some((Ok(line.freeze()), st));
            }
            if st.done {
                if st.buf.is_empty() {
                    return None;
                }
                let line = st.buf.split().freeze();
                return Some((Ok(line), st));
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(&chunk);
                    if st.buf.len() > max_line_len && !st.buf.contains(&b'\n') {
                        st.done = true;
                        st.buf.clear();
                        let err = ClientError::Decoding(format!(
                            "exceeded limit on max bytes per line: {max_line_len}"
                        ));
                        return Some((Err(err), st));
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    st.buf.clear();
                    return Some((Err(e), st));
                }
                None => st.done = true,
            }
        }
    }))
}

pub(crate) fn is_json(media_type: &Mime) -> bool {
    media_type.type_() == mime::APPLICATION
        && (media_type.subtype() == mime::JSON || media_type.suffix() == Some(mime::JSON))
}

pub(crate) fn is_streaming_json(media_type: &Mime) -> bool {
    matches!(
        media_type.essence_str(),
        "application/x-ndjson" | "application/stream+json"
    )
}
