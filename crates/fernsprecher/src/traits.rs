//! The channel seam shared by every layer of the stack.
//!
//! Transports, multiplexers, channels and their heartbeat/flow-control
//! wrappers all speak the same narrow interface, so a layer never cares what
//! it is stacked on. Wrapped events exploit this to multiplex recursively
//! over a single logical conversation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmpv::Value;

use crate::context::Context;
use crate::error::RpcError;
use crate::event::{Event, Header};

/// One emit/recv surface of the stack.
///
/// `emit_event` and `recv` are safe to call from one task at a time per
/// direction; layers serialize internally where needed.
#[async_trait]
pub trait ChannelBase: Send + Sync {
    /// The context this layer allocates message ids from and dispatches
    /// middleware hooks through.
    fn context(&self) -> Arc<Context>;

    fn recv_is_supported(&self) -> bool;

    fn emit_is_supported(&self) -> bool;

    /// Build an event addressed to this layer's conversation. Layers may
    /// stamp headers (channel id) or rewrite control names (v2 aliasing).
    fn new_event(&self, name: &str, args: Value, xheader: Option<Header>) -> Event;

    /// Send one event. A full downstream queue fails with
    /// [`RpcError::Timeout`] once `timeout` elapses; `None` waits forever.
    async fn emit_event(&self, event: Event, timeout: Option<Duration>) -> Result<(), RpcError>;

    /// Receive one event, waiting up to `timeout`.
    async fn recv(&self, timeout: Option<Duration>) -> Result<Event, RpcError>;

    /// Tear the layer down. Pending operations fail with a closed error;
    /// owned background tasks stop.
    async fn close(&self);

    /// Convenience: build and send in one step.
    async fn emit(&self, name: &str, args: Value, xheader: Option<Header>) -> Result<(), RpcError> {
        let event = self.new_event(name, args, xheader);
        self.emit_event(event, None).await
    }
}
