//! Events transport: one ZeroMQ socket pattern carrying one event per
//! message.
//!
//! The payload is always a single serialized frame. DEALER/ROUTER add the
//! protocol-inherent envelope: identity frames (ROUTER side) followed by an
//! empty delimiter, then the payload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rmpv::Value;
use tracing::{debug, instrument};
use zeromq::ZmqMessage;

use crate::context::Context;
use crate::error::RpcError;
use crate::event::{Event, Header};
use crate::serializer::{pack_event, unpack_event};
use crate::socket::{SocketHandle, SocketKind};
use crate::traits::ChannelBase;

/// Sends and receives events over one ZeroMQ socket.
pub struct Events {
    kind: SocketKind,
    context: Arc<Context>,
    socket: SocketHandle,
}

impl Events {
    pub fn new(kind: SocketKind, context: Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            context,
            socket: SocketHandle::new(kind),
        })
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Bind to an endpoint, after passing it through the middleware chain's
    /// endpoint resolution.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn bind(&self, endpoint: &str) -> Result<(), RpcError> {
        let endpoint = self.context.hook_resolve_endpoint(endpoint.to_owned());
        debug!(endpoint = %endpoint, "binding socket");
        self.socket.bind(&endpoint).await
    }

    /// Connect to an endpoint, after passing it through the middleware
    /// chain's endpoint resolution.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn connect(&self, endpoint: &str) -> Result<(), RpcError> {
        let endpoint = self.context.hook_resolve_endpoint(endpoint.to_owned());
        debug!(endpoint = %endpoint, "connecting socket");
        self.socket.connect(&endpoint).await
    }

    /// Subscribe to a topic prefix (SUB sockets only). The empty prefix
    /// subscribes to everything.
    pub async fn subscribe(&self, prefix: &str) -> Result<(), RpcError> {
        self.socket.subscribe(prefix).await
    }

    fn frames_for(&self, event: &Event) -> Result<ZmqMessage, RpcError> {
        let blob = pack_event(self.context.serializer().as_ref(), event)?;

        if let Some(identity) = event.identity() {
            if !identity.is_empty() {
                let mut msg = ZmqMessage::from(identity[0].to_vec());
                for frame in &identity[1..] {
                    msg.push_back(frame.clone());
                }
                msg.push_back(Bytes::new());
                msg.push_back(blob.into());
                return Ok(msg);
            }
        }

        if self.kind.uses_envelope() {
            let mut msg = ZmqMessage::from(Vec::new());
            msg.push_back(blob.into());
            Ok(msg)
        } else {
            Ok(ZmqMessage::from(blob))
        }
    }

    /// Split a received multipart message into identity frames and the
    /// payload blob. The empty delimiter between them is dropped.
    fn split_frames(frames: Vec<Bytes>) -> Result<(Option<Vec<Bytes>>, Bytes), RpcError> {
        match frames.len() {
            0 => Err(RpcError::Protocol("empty multipart message".into())),
            1 => {
                let mut frames = frames;
                Ok((None, frames.pop().expect("one frame present")))
            }
            2 => {
                let mut frames = frames;
                let blob = frames.pop().expect("two frames present");
                Ok((Some(frames), blob))
            }
            _ => {
                let mut frames = frames;
                let blob = frames.pop().expect("multiple frames present");
                frames.pop(); // empty delimiter
                Ok((Some(frames), blob))
            }
        }
    }
}

#[async_trait]
impl ChannelBase for Events {
    fn context(&self) -> Arc<Context> {
        self.context.clone()
    }

    fn recv_is_supported(&self) -> bool {
        self.kind.recv_is_supported()
    }

    fn emit_is_supported(&self) -> bool {
        self.kind.emit_is_supported()
    }

    fn new_event(&self, name: &str, args: Value, xheader: Option<Header>) -> Event {
        let mut event = Event::with_msgid(name, args, self.context.new_msgid());
        if let Some(xheader) = xheader {
            event.merge_header(xheader);
        }
        event
    }

    async fn emit_event(&self, event: Event, timeout: Option<Duration>) -> Result<(), RpcError> {
        debug!(event = %event, "--> emitting");
        let msg = self.frames_for(&event)?;
        self.socket.send(msg, timeout).await
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Event, RpcError> {
        let msg = self.socket.recv(timeout).await?;
        let (identity, blob) = Self::split_frames(msg.into_vec())?;
        let mut event = unpack_event(self.context.serializer().as_ref(), &blob)?;
        event.set_identity(identity);
        debug!(event = %event, "<-- received");
        Ok(event)
    }

    async fn close(&self) {
        self.socket.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_single_frame_has_no_identity() {
        let frames = vec![Bytes::from_static(b"payload")];
        let (identity, blob) = Events::split_frames(frames).unwrap();
        assert!(identity.is_none());
        assert_eq!(&blob[..], b"payload");
    }

    #[test]
    fn split_two_frames_keeps_leading_frame_as_identity() {
        let frames = vec![Bytes::new(), Bytes::from_static(b"payload")];
        let (identity, blob) = Events::split_frames(frames).unwrap();
        assert_eq!(identity.unwrap().len(), 1);
        assert_eq!(&blob[..], b"payload");
    }

    #[test]
    fn split_router_envelope_drops_delimiter() {
        let frames = vec![
            Bytes::from_static(b"peer-1"),
            Bytes::new(),
            Bytes::from_static(b"payload"),
        ];
        let (identity, blob) = Events::split_frames(frames).unwrap();
        let identity = identity.unwrap();
        assert_eq!(identity.len(), 1);
        assert_eq!(&identity[0][..], b"peer-1");
        assert_eq!(&blob[..], b"payload");
    }

    #[test]
    fn split_empty_message_is_protocol_error() {
        assert!(matches!(
            Events::split_frames(Vec::new()),
            Err(RpcError::Protocol(_))
        ));
    }
}
