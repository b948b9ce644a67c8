use std::collections::HashMap;

/// String-keyed propagation metadata carried alongside a message body.
pub type Headers = HashMap<String, String>;

/// Wire-level unit exchanged with the broker.
///
/// `Envelope` bundles a serialized message body together with its headers.
/// It is intentionally transport-agnostic: broker adapters translate the
/// headers to and from their native representation.
///
/// ## Design
///
/// - `headers` carry only propagation metadata (trace context and baggage).
///   They are written by the sender and read-only for the receiver.
/// - `body` is the codec's serialized payload.
/// - `content_type` names the codec's format, when known. Brokers with a
///   native content-type property carry it there.
///
/// ## Conversion
///
/// `Envelope` implements `From<(Headers, Vec<u8>)>` for ergonomic construction
/// when headers and body are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use courier::{Envelope, envelope::Headers};
///
/// let mut headers = Headers::new();
/// headers.insert("baggage".to_owned(), "tenant=acme".to_owned());
///
/// let envelope = Envelope {
///     headers: headers.clone(),
///     body: br#"{"id":42}"#.to_vec(),
///     content_type: None,
/// };
///
/// // or, equivalently
/// let other: Envelope = (headers, br#"{"id":42}"#.to_vec()).into();
/// assert_eq!(envelope, other);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Propagation metadata.
    pub headers: Headers,
    /// Serialized message payload.
    pub body: Vec<u8>,
    /// MIME type of `body`.
    pub content_type: Option<String>,
}

impl Envelope {
    /// Create an envelope with no headers and an empty body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Body interpreted as UTF-8 text, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

impl From<(Headers, Vec<u8>)> for Envelope {
    fn from(value: (Headers, Vec<u8>)) -> Self {
        Envelope {
            headers: value.0,
            body: value.1,
            content_type: None,
        }
    }
}
