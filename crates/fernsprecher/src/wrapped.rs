//! Nested multiplexing: an events-like surface over a single channel.
//!
//! Inner events are serialized and shipped as the payload of `w` events on
//! the wrapped channel. Since [`WrappedEvents`] speaks [`ChannelBase`], a
//! [`ChannelMultiplexer`](crate::channel::ChannelMultiplexer) can run on top
//! of it, multiplexing sub-conversations inside one conversation,
//! recursively.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmpv::Value;

use crate::context::Context;
use crate::error::RpcError;
use crate::event::{Event, Header, WRAPPED};
use crate::serializer::{pack_event, unpack_event};
use crate::traits::ChannelBase;

/// Presents a channel as a transport for inner events.
pub struct WrappedEvents {
    channel: Arc<dyn ChannelBase>,
}

impl WrappedEvents {
    pub fn new(channel: Arc<dyn ChannelBase>) -> Arc<Self> {
        Arc::new(Self { channel })
    }
}

#[async_trait]
impl ChannelBase for WrappedEvents {
    fn context(&self) -> Arc<Context> {
        self.channel.context()
    }

    fn recv_is_supported(&self) -> bool {
        self.channel.recv_is_supported()
    }

    fn emit_is_supported(&self) -> bool {
        self.channel.emit_is_supported()
    }

    fn new_event(&self, name: &str, args: Value, xheader: Option<Header>) -> Event {
        let mut event = Event::with_msgid(name, args, self.context().new_msgid());
        if let Some(xheader) = xheader {
            event.merge_header(xheader);
        }
        event
    }

    /// The inner event is packed whole and becomes the argument of a `w`
    /// event on the carrier channel.
    async fn emit_event(&self, event: Event, timeout: Option<Duration>) -> Result<(), RpcError> {
        let blob = pack_event(self.context().serializer().as_ref(), &event)?;
        let carrier = self
            .channel
            .new_event(WRAPPED, Value::Binary(blob), None);
        self.channel.emit_event(carrier, timeout).await
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Event, RpcError> {
        let carrier = self.channel.recv(timeout).await?;
        let blob = match carrier.args() {
            Value::Binary(blob) => blob.as_slice(),
            other => {
                return Err(RpcError::Protocol(format!(
                    "wrapped event payload is not binary: {other}"
                )));
            }
        };
        unpack_event(self.context().serializer().as_ref(), blob)
    }

    async fn close(&self) {
        self.channel.close().await;
    }
}
