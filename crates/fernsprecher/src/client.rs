//! Client facade: a DEALER socket and one channel stack per call.
//!
//! Every call opens a fresh channel, wraps it in the heartbeat and
//! flow-control layers, emits the request with the middleware task context
//! merged into its header, and hands the first reply to the matching call
//! pattern. A first reply that misses the deadline closes the channel and
//! surfaces as a timeout naming the method.

use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::buffered::BufferedChannel;
use crate::channel::ChannelMultiplexer;
use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::{RpcError, TimeoutExpired};
use crate::event::Event;
use crate::events::Events;
use crate::heartbeat::HeartbeatChannel;
use crate::patterns::{patterns_list, Reply};
use crate::socket::SocketKind;
use crate::traits::ChannelBase;

/// Per-call options; unset fields fall back to the client's configuration.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline for the first reply event.
    pub timeout: Option<Duration>,

    /// Receive-window size for this call's channel.
    pub slots: Option<usize>,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// A call running in the background; resolve it with
/// [`wait`](PendingReply::wait).
pub struct PendingReply {
    handle: JoinHandle<Result<Reply, RpcError>>,
}

impl PendingReply {
    pub async fn wait(self) -> Result<Reply, RpcError> {
        self.handle.await.map_err(|_| RpcError::Closed)?
    }
}

struct ClientInner {
    context: Arc<Context>,
    events: Arc<Events>,
    multiplexer: Arc<ChannelMultiplexer>,
    timeout: Duration,
    heartbeat: Duration,
    passive_heartbeat: bool,
    slots: usize,
}

/// RPC client over a DEALER socket.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client on the global context with default settings.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default(), Context::global())
    }

    pub fn with_config(config: ClientConfig, context: Arc<Context>) -> Self {
        let events = Events::new(SocketKind::Dealer, context.clone());
        let multiplexer = ChannelMultiplexer::new(events.clone(), true);
        Self {
            inner: Arc::new(ClientInner {
                context,
                events,
                multiplexer,
                timeout: config.timeout(),
                heartbeat: config.heartbeat(),
                passive_heartbeat: config.passive_heartbeat,
                slots: config.slots,
            }),
        }
    }

    pub async fn connect(&self, endpoint: &str) -> Result<(), RpcError> {
        self.inner.events.connect(endpoint).await
    }

    pub async fn bind(&self, endpoint: &str) -> Result<(), RpcError> {
        self.inner.events.bind(endpoint).await
    }

    /// Call a remote method and wait for its reply.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, RpcError> {
        self.call_with(method, args, CallOptions::default()).await
    }

    pub async fn call_with(
        &self,
        method: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Reply, RpcError> {
        let (request, bufchan, timeout) = self.send_request(method, args, &options).await?;
        process_response(self.inner.clone(), request, bufchan, timeout).await
    }

    /// Emit the request, then resolve the reply on a background task.
    pub async fn call_async(
        &self,
        method: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<PendingReply, RpcError> {
        let (request, bufchan, timeout) = self.send_request(method, args, &options).await?;
        let inner = self.inner.clone();
        let handle = tokio::spawn(process_response(inner, request, bufchan, timeout));
        Ok(PendingReply { handle })
    }

    async fn send_request(
        &self,
        method: &str,
        args: Vec<Value>,
        options: &CallOptions,
    ) -> Result<(Event, Arc<BufferedChannel>, Duration), RpcError> {
        let inner = &self.inner;
        let channel = inner.multiplexer.channel(None);
        let hbchan = HeartbeatChannel::new(channel, inner.heartbeat, inner.passive_heartbeat);
        let bufchan = BufferedChannel::new(hbchan, options.slots.unwrap_or(inner.slots));

        let xheader = inner.context.hook_get_task_context();
        let request = bufchan.new_event(method, Value::Array(args), Some(xheader));
        inner.context.hook_client_before_request(&request);

        debug!(method = %method, message_id = ?request.message_id(), "calling remote method");
        if let Err(e) = bufchan.emit_event(request.clone(), None).await {
            bufchan.close().await;
            return Err(e);
        }

        Ok((request, bufchan, options.timeout.unwrap_or(inner.timeout)))
    }

    pub async fn close(&self) {
        self.inner.multiplexer.close().await;
        self.inner.events.close().await;
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

async fn process_response(
    inner: Arc<ClientInner>,
    request: Event,
    bufchan: Arc<BufferedChannel>,
    timeout: Duration,
) -> Result<Reply, RpcError> {
    let reply = match bufchan.recv(Some(timeout)).await {
        Ok(reply) => reply,
        Err(RpcError::Timeout(_)) => {
            let error: RpcError = TimeoutExpired::when(
                Some(timeout),
                format!("calling remote method {}", request.name()),
            )
            .into();
            bufchan.close().await;
            inner
                .context
                .hook_client_after_request(&request, None, Some(&error));
            return Err(error);
        }
        Err(other) => {
            bufchan.close().await;
            return Err(other);
        }
    };

    let patterns = inner.context.hook_client_patterns_list(patterns_list());
    let pattern = patterns.iter().find(|p| p.accept_answer(&reply));
    let Some(pattern) = pattern else {
        let error = RpcError::Protocol(format!(
            "unable to find a pattern for: {}",
            reply.name()
        ));
        bufchan.close().await;
        inner
            .context
            .hook_client_after_request(&request, Some(&reply), Some(&error));
        return Err(error);
    };

    pattern
        .process_answer(inner.context.clone(), bufchan, request, reply)
        .await
}
