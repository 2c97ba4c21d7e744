//! Pluggable wire serializer.
//!
//! The protocol only requires a `pack`/`unpack` pair over the
//! `(header, name, args)` triple; MessagePack is the default encoding.

use rmpv::Value;

use crate::error::RpcError;
use crate::event::{Event, Header};

/// Serializes events to single-frame binary blobs and back.
///
/// Implementations must preserve maps, ordered sequences, integers, UTF-8
/// strings, binary strings, booleans, and nil.
pub trait Serializer: Send + Sync {
    fn pack(&self, header: &Header, name: &str, args: &Value) -> Result<Vec<u8>, RpcError>;

    fn unpack(&self, blob: &[u8]) -> Result<(Header, String, Value), RpcError>;
}

/// Default MessagePack serializer.
pub struct MsgPack;

impl Serializer for MsgPack {
    fn pack(&self, header: &Header, name: &str, args: &Value) -> Result<Vec<u8>, RpcError> {
        let header_pairs: Vec<(Value, Value)> = header
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
            .collect();
        let triple = Value::Array(vec![
            Value::Map(header_pairs),
            Value::from(name),
            args.clone(),
        ]);
        let mut blob = Vec::new();
        rmpv::encode::write_value(&mut blob, &triple)?;
        Ok(blob)
    }

    fn unpack(&self, blob: &[u8]) -> Result<(Header, String, Value), RpcError> {
        let mut cursor = blob;
        let value = rmpv::decode::read_value(&mut cursor)?;

        let mut parts = match value {
            Value::Array(parts) if parts.len() == 3 => parts,
            other => {
                return Err(RpcError::Protocol(format!(
                    "invalid event format, expected a 3-element sequence, got: {other}"
                )));
            }
        };

        let args = parts.pop().expect("3 elements checked above");
        let name = parts.pop().expect("3 elements checked above");
        let raw_header = parts.pop().expect("3 elements checked above");

        let name = match name {
            Value::String(s) => s
                .into_str()
                .ok_or_else(|| RpcError::Protocol("event name is not valid UTF-8".into()))?,
            other => {
                return Err(RpcError::Protocol(format!(
                    "event name is not a string: {other}"
                )));
            }
        };

        // Legacy v1 peers may ship a non-map header; coerce to empty.
        let header = match raw_header {
            Value::Map(pairs) => pairs
                .into_iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_owned(), v.clone())))
                .collect(),
            _ => Header::new(),
        };

        Ok((header, name, args))
    }
}

/// Convert any serializable value into a wire value, e.g. to pass a struct
/// as a call argument.
pub fn to_wire<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    let bytes = rmp_serde::to_vec_named(value)?;
    Ok(rmpv::decode::read_value(&mut bytes.as_slice())?)
}

/// Convert a wire value into a typed value, e.g. to parse a handler's
/// arguments into a struct.
pub fn from_wire<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, RpcError> {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, value)?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

/// Pack a full event body (identity frames excluded by definition).
pub(crate) fn pack_event(serializer: &dyn Serializer, event: &Event) -> Result<Vec<u8>, RpcError> {
    serializer.pack(event.header(), event.name(), event.args())
}

/// Unpack an event body. Identity frames are attached by the caller.
pub(crate) fn unpack_event(serializer: &dyn Serializer, blob: &[u8]) -> Result<Event, RpcError> {
    let (header, name, args) = serializer.unpack(blob)?;
    Ok(Event::with_header(name, args, header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    #[test]
    fn pack_unpack_is_identity() {
        let serializer = MsgPack;
        let mut header = Header::new();
        header.insert("message_id".into(), Value::from("id-1"));
        header.insert("v".into(), Value::from(3));

        let args = Value::Array(vec![
            Value::from(1),
            Value::from("two"),
            Value::Boolean(true),
            Value::Nil,
            Value::Binary(vec![0xde, 0xad]),
        ]);

        let blob = serializer.pack(&header, "add", &args).unwrap();
        let (header2, name, args2) = serializer.unpack(&blob).unwrap();

        assert_eq!(name, "add");
        assert_eq!(args2, args);
        assert_eq!(header2.get("message_id"), header.get("message_id"));
        assert_eq!(header2.get("v"), header.get("v"));
    }

    #[test]
    fn legacy_non_map_header_coerced_to_empty() {
        let serializer = MsgPack;
        let triple = Value::Array(vec![
            Value::Nil,
            Value::from("ping"),
            Value::Array(vec![]),
        ]);
        let mut blob = Vec::new();
        rmpv::encode::write_value(&mut blob, &triple).unwrap();

        let (header, name, _args) = serializer.unpack(&blob).unwrap();
        assert_eq!(name, "ping");
        assert!(header.is_empty());
    }

    #[test]
    fn rejects_non_triple() {
        let serializer = MsgPack;
        let pair = Value::Array(vec![Value::Nil, Value::from("x")]);
        let mut blob = Vec::new();
        rmpv::encode::write_value(&mut blob, &pair).unwrap();

        assert!(matches!(
            serializer.unpack(&blob),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_garbage() {
        let serializer = MsgPack;
        assert!(serializer.unpack(&[0xc1]).is_err());
    }

    #[test]
    fn typed_values_round_trip_through_the_wire_shape() {
        use serde::{Deserialize, Serialize};

        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Job {
            id: u32,
            tag: String,
        }

        let job = Job {
            id: 7,
            tag: "resize".into(),
        };
        let wire = to_wire(&job).unwrap();
        assert!(matches!(wire, Value::Map(_)));

        let back: Job = from_wire(&wire).unwrap();
        assert_eq!(back, job);
    }
}
