//! Wire-format event: the atomic unit exchanged over a transport.
//!
//! An event is a `(header, name, args)` triple serialized with the context's
//! serializer (MessagePack by default). The header carries the `message_id`
//! and protocol version, plus `response_to` on every event after the first
//! one of a conversation. On ROUTER/DEALER sockets the peer identity frames
//! ride out-of-band of the serialized body.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use rmpv::Value;

/// Protocol version stamped into every fresh event header.
pub const PROTOCOL_VERSION: i64 = 3;

/// Header key holding the globally unique id of an event.
pub const MESSAGE_ID: &str = "message_id";

/// Header key holding the protocol version.
pub const VERSION: &str = "v";

/// Header key holding the id of the conversation-opening event.
pub const RESPONSE_TO: &str = "response_to";

/// Keep-alive event name.
pub const HEARTBEAT: &str = "_zpc_hb";

/// Flow-control credit grant event name.
pub const MORE: &str = "_zpc_more";

/// Successful request/reply answer.
pub const REPLY_OK: &str = "OK";

/// Failure answer.
pub const REPLY_ERR: &str = "ERR";

/// One chunk of a streamed answer.
pub const STREAM: &str = "STREAM";

/// Terminal frame of a streamed answer.
pub const STREAM_DONE: &str = "STREAM_DONE";

/// A wrapped sub-event (nested multiplexing).
pub const WRAPPED: &str = "w";

/// Event header: free-form string-keyed map of MessagePack values.
pub type Header = HashMap<String, Value>;

/// One message on the wire: header map, name, and argument value.
///
/// `args` is usually an array (the positional arguments of a call or the
/// payload of a reply), but `STREAM` chunks carry the bare yielded value.
#[derive(Debug, Clone)]
pub struct Event {
    header: Header,
    name: String,
    args: Value,
    identity: Option<Vec<Bytes>>,
}

impl Event {
    /// Build an event with a fresh header for the given message id.
    pub(crate) fn with_msgid(name: impl Into<String>, args: Value, msgid: String) -> Self {
        let mut header = Header::new();
        header.insert(MESSAGE_ID.into(), Value::from(msgid));
        header.insert(VERSION.into(), Value::from(PROTOCOL_VERSION));
        Self {
            header,
            name: name.into(),
            args,
            identity: None,
        }
    }

    /// Build an event around an existing header (e.g. one decoded off the
    /// wire).
    pub fn with_header(name: impl Into<String>, args: Value, header: Header) -> Self {
        Self {
            header,
            name: name.into(),
            args,
            identity: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// Identity frames prepended by a ROUTER socket; not part of the
    /// serialized body.
    pub fn identity(&self) -> Option<&[Bytes]> {
        self.identity.as_deref()
    }

    pub fn set_identity(&mut self, identity: Option<Vec<Bytes>>) {
        self.identity = identity;
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header.get(MESSAGE_ID).and_then(Value::as_str)
    }

    pub fn response_to(&self) -> Option<&str> {
        self.header.get(RESPONSE_TO).and_then(Value::as_str)
    }

    pub fn set_response_to(&mut self, channel_id: impl Into<String>) {
        self.header
            .insert(RESPONSE_TO.into(), Value::from(channel_id.into()));
    }

    /// Protocol version declared by the header, if any.
    pub fn version(&self) -> Option<i64> {
        self.header.get(VERSION).and_then(Value::as_i64)
    }

    /// Merge extra header entries (middleware-provided task context) into
    /// this event's header.
    pub fn merge_header(&mut self, xheader: Header) {
        self.header.extend(xheader);
    }

    /// Positional arguments as a list. A non-array `args` value is surfaced
    /// as a single argument.
    pub fn args_vec(&self) -> Vec<Value> {
        match &self.args {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(identity) = &self.identity {
            let frames: Vec<String> = identity.iter().map(|b| format!("{b:?}")).collect();
            write!(f, "<{}> ", frames.join(", "))?;
        }
        write!(f, "{} {:?} {}", self.name, self.header, self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_header_has_id_and_version() {
        let ev = Event::with_msgid("add", Value::Array(vec![1.into(), 4.into()]), "abc123".into());
        assert_eq!(ev.message_id(), Some("abc123"));
        assert_eq!(ev.version(), Some(PROTOCOL_VERSION));
        assert_eq!(ev.response_to(), None);
    }

    #[test]
    fn response_to_round_trips() {
        let mut ev = Event::with_msgid("OK", Value::Nil, "id1".into());
        ev.set_response_to("id0");
        assert_eq!(ev.response_to(), Some("id0"));
    }

    #[test]
    fn args_vec_wraps_scalars() {
        let ev = Event::with_msgid("STREAM", Value::from(7), "id".into());
        assert_eq!(ev.args_vec(), vec![Value::from(7)]);

        let ev = Event::with_msgid("add", Value::Array(vec![1.into(), 2.into()]), "id".into());
        assert_eq!(ev.args_vec().len(), 2);
    }

    #[test]
    fn merge_header_overrides_and_extends() {
        let mut ev = Event::with_msgid("call", Value::Nil, "id".into());
        let mut extra = Header::new();
        extra.insert("trace_id".into(), Value::from("t-1"));
        ev.merge_header(extra);
        assert_eq!(
            ev.header().get("trace_id").and_then(Value::as_str),
            Some("t-1")
        );
        assert_eq!(ev.message_id(), Some("id"));
    }
}
