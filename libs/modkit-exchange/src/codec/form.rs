use bytes::Bytes;
use mime::Mime;

use super::{EncodableValue, Encoder, TypeDescriptor};
use crate::error::ClientError;

/// `application/x-www-form-urlencoded` bodies via `serde_urlencoded`.
///
/// Only selected when the request declares the form content type.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormEncoder;

impl Encoder for FormEncoder {
    fn can_encode(&self, _ty: &TypeDescriptor, media_type: Option<&Mime>) -> bool {
        media_type.is_some_and(|m| m.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str())
    }

    fn default_media_type(&self) -> Mime {
        mime::APPLICATION_WWW_FORM_URLENCODED
    }

    fn encode(&self, value: &EncodableValue, _media_type: &Mime) -> Result<Bytes, ClientError> {
        value.to_form().map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_form_encoding() {
        let form = BTreeMap::from([("grant_type", "client_credentials"), ("scope", "a b")]);
        let encoded = FormEncoder
            .encode(&EncodableValue::new(form), &mime::APPLICATION_WWW_FORM_URLENCODED)
            .unwrap();
        assert_eq!(
            encoded,
            Bytes::from_static(b"grant_type=client_credentials&scope=a+b")
        );
    }

    #[test]
    fn test_only_for_declared_form() {
        let ty = TypeDescriptor::of::<BTreeMap<String, String>>();
        assert!(!FormEncoder.can_encode(&ty, None));
        assert!(!FormEncoder.can_encode(&ty, Some(&mime::APPLICATION_JSON)));
        assert!(FormEncoder.can_encode(&ty, Some(&mime::APPLICATION_WWW_FORM_URLENCODED)));
    }
}
