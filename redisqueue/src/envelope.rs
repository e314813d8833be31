//! Message envelope codec
//!
//! Every published payload is wrapped in a JSON envelope so that headers
//! (currently only the trace context) travel alongside the caller's content:
//!
//! ```json
//! {"content": {"do_what": "x"}, "headers": {"trace": {"traceparent": "00-..."}}}
//! ```
//!
//! `content` is opaque: it is encoded from any `Serialize` value and handed
//! back on decode as the raw JSON text, so the handler picks the type.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;

/// Trace-context key/value pairs carried in the envelope headers
pub type TraceHeaders = HashMap<String, String>;

/// Envelope headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Serialized trace context, empty when no trace is active
    #[serde(default, deserialize_with = "null_as_default")]
    pub trace: TraceHeaders,
}

/// Envelope wrapping message content and headers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Caller-defined content
    pub content: T,
    /// Message headers
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: Headers,
}

/// Borrowing view used by [`decode`] so content stays uninterpreted
#[derive(Deserialize)]
struct RawEnvelope<'a> {
    #[serde(borrow)]
    content: &'a RawValue,
    #[serde(default, deserialize_with = "null_as_default")]
    headers: Headers,
}

/// Result of decoding an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Raw JSON text of the `content` value
    pub content: Vec<u8>,
    /// Trace headers, empty if absent on the wire
    pub trace: TraceHeaders,
}

impl Decoded {
    /// Deserialize the content into the caller's expected type
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.content)
            .map_err(|e| Error::Handler(format!("content does not match expected type: {}", e)))
    }
}

/// Encode content and trace headers into envelope bytes
pub fn encode<T: Serialize + ?Sized>(content: &T, trace: TraceHeaders) -> Result<Vec<u8>> {
    let envelope = Envelope {
        content,
        headers: Headers { trace },
    };
    serde_json::to_vec(&envelope).map_err(Error::Encode)
}

/// Decode envelope bytes into raw content and trace headers
pub fn decode(bytes: &[u8]) -> Result<Decoded> {
    let raw: RawEnvelope<'_> = serde_json::from_slice(bytes)
        .map_err(|e| Error::MalformedEnvelope(e.to_string()))?;

    Ok(Decoded {
        content: raw.content.get().as_bytes().to_vec(),
        trace: raw.headers.trace,
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct DoSomething {
        do_what: String,
    }

    #[test]
    fn test_encode_wire_shape() {
        let bytes = encode(&json!({"do_what": "x"}), TraceHeaders::new()).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"content":{"do_what":"x"},"headers":{"trace":{}}}"#
        );
    }

    #[test]
    fn test_decode_returns_serialized_content_and_headers() {
        let content = DoSomething { do_what: "Do something".into() };
        let mut trace = TraceHeaders::new();
        trace.insert(
            "traceparent".into(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".into(),
        );

        let bytes = encode(&content, trace.clone()).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.content, serde_json::to_vec(&content).unwrap());
        assert_eq!(decoded.trace, trace);
        assert_eq!(decoded.content_as::<DoSomething>().unwrap(), content);
    }

    #[test]
    fn test_decode_scalar_and_null_content() {
        let decoded = decode(br#"{"content":42,"headers":{"trace":{}}}"#).unwrap();
        assert_eq!(decoded.content, b"42");

        let decoded = decode(br#"{"content":null,"headers":{"trace":{}}}"#).unwrap();
        assert_eq!(decoded.content, b"null");
    }

    #[test]
    fn test_decode_tolerates_missing_trace() {
        let decoded = decode(br#"{"content":{"a":1},"headers":{}}"#).unwrap();
        assert!(decoded.trace.is_empty());

        let decoded = decode(br#"{"content":{"a":1},"headers":{"trace":null}}"#).unwrap();
        assert!(decoded.trace.is_empty());

        let decoded = decode(br#"{"content":{"a":1}}"#).unwrap();
        assert!(decoded.trace.is_empty());
        assert_eq!(decoded.content, br#"{"a":1}"#);
    }

    #[test]
    fn test_decode_rejects_missing_content() {
        let err = decode(br#"{"headers":{"trace":{}}}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not json").unwrap_err(), Error::MalformedEnvelope(_)));
        assert!(matches!(decode(b"[1,2,3]").unwrap_err(), Error::MalformedEnvelope(_)));
        assert!(matches!(decode(b"").unwrap_err(), Error::MalformedEnvelope(_)));
        assert!(matches!(
            decode(br#"{"content":1,"headers":{"trace":{"k":5}}}"#).unwrap_err(),
            Error::MalformedEnvelope(_)
        ));
    }

    #[test]
    fn test_encode_rejects_unserializable_content() {
        let mut content: BTreeMap<Vec<u8>, u8> = BTreeMap::new();
        content.insert(vec![1, 2], 3);

        let err = encode(&content, TraceHeaders::new()).unwrap_err();
        assert!(matches!(err, Error::Encode(_)));
    }

    #[test]
    fn test_typed_envelope_deserializes() {
        let bytes = encode(&DoSomething { do_what: "x".into() }, TraceHeaders::new()).unwrap();
        let envelope: Envelope<DoSomething> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope.content.do_what, "x");
        assert!(envelope.headers.trace.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use serde_json::{Number, Value};

        fn json_value() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i64>().prop_map(Value::from),
                any::<f64>().prop_filter_map("finite", |f| Number::from_f64(f).map(Value::Number)),
                ".{0,16}".prop_map(Value::String),
            ];
            leaf.prop_recursive(4, 32, 6, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                    prop::collection::btree_map(".{0,8}", inner, 0..6)
                        .prop_map(|map| Value::Object(map.into_iter().collect())),
                ]
            })
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Decoding hands back exactly the serialized content and the trace headers.
            #[test]
            fn decode_inverts_encode(
                content in json_value(),
                trace in prop::collection::hash_map(".{0,12}", ".{0,24}", 0..4)
            ) {
                let bytes = encode(&content, trace.clone()).unwrap();
                let decoded = decode(&bytes).unwrap();

                prop_assert_eq!(decoded.content, serde_json::to_vec(&content).unwrap());
                prop_assert_eq!(decoded.trace, trace);
            }
        }
    }
}
