//! Payload codecs.
//!
//! A [`Codec`] turns a typed message into the body bytes of an
//! [`Envelope`](crate::Envelope) and back. The default codec is [`Json`],
//! which produces UTF-8 JSON text.

use serde::{Serialize, de::DeserializeOwned};
use tracing_error::SpanTrace;

/// Serializes typed payloads to envelope bodies and back.
///
/// Implementations must be symmetric: anything `encode` produces for a value
/// of type `T` must `decode` back into an equal `T`.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Serialize a value into body bytes.
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized;

    /// Deserialize body bytes into a value of type `T`.
    fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned;

    /// MIME type of the bodies this codec produces.
    fn content_type(&self) -> &'static str;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Codec for Json {
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(value).map_err(|e| CodecError::encoding(Box::new(e)))
    }

    fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(bytes).map_err(|e| CodecError::decoding(Box::new(e)))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

/// Error returned by codec operations.
///
/// Each error captures:
/// - The failing direction (see [`CodecErrorKind`])
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct CodecError {
    context: SpanTrace,
    kind: CodecErrorKind,
}

/// Codec error kinds.
#[derive(Debug)]
pub enum CodecErrorKind {
    /// The value cannot be represented in the codec's format.
    Encoding(tower::BoxError),
    /// The bytes are not well-formed for the expected type.
    Decoding(tower::BoxError),
}

impl CodecError {
    /// Create an encoding error.
    pub fn encoding(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: CodecErrorKind::Encoding(err),
        }
    }

    /// Create a decoding error.
    pub fn decoding(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: CodecErrorKind::Decoding(err),
        }
    }

    /// The kind of failure.
    pub fn kind(&self) -> &CodecErrorKind {
        &self.kind
    }

    /// Whether this error came from decoding.
    pub fn is_decoding(&self) -> bool {
        matches!(self.kind, CodecErrorKind::Decoding(_))
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CodecErrorKind::Encoding(err) => writeln!(f, "Encoding error: {err}"),
            CodecErrorKind::Decoding(err) => writeln!(f, "Decoding error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            CodecErrorKind::Encoding(err) => Some(err.as_ref()),
            CodecErrorKind::Decoding(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Forecast {
        location: String,
        temperature_c: i32,
        summary: Option<String>,
    }

    #[test]
    fn json_body_is_utf8_text_that_decodes_back() {
        let forecast = Forecast {
            location: "NYC".into(),
            temperature_c: 20,
            summary: Some("Mild".into()),
        };

        let bytes = Json.encode(&forecast).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains(r#""temperatureC":20"#));

        let decoded: Forecast = Json.decode(&bytes).unwrap();
        assert_eq!(decoded, forecast);
    }

    #[test]
    fn malformed_body_is_a_decoding_error() {
        let err = Json.decode::<Forecast>(b"{not json").unwrap_err();
        assert!(err.is_decoding());
        assert!(err.to_string().starts_with("Decoding error"));

        let err = Json.decode::<Forecast>(br#"{"location":"NYC"}"#).unwrap_err();
        assert!(err.is_decoding());
    }

    #[test]
    fn non_string_map_keys_are_an_encoding_error() {
        let mut map = HashMap::new();
        map.insert((1u8, 2u8), "pair");

        let err = Json.encode(&map).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::Encoding(_)));
    }
}
