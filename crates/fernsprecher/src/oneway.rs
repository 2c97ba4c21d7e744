//! One-way facades: PUSH/PULL work distribution and PUB/SUB broadcast.
//!
//! These bypass channels entirely. An emit ships a single event carrying
//! only the task-context header; a receiver dispatches each event straight
//! to the registered method. Handler failures are logged and reported to the
//! exception-inspection hook, never sent back.

use std::sync::{Arc, Mutex as StdMutex};

use rmpv::Value;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{HandlerError, RpcError};
use crate::event::Event;
use crate::events::Events;
use crate::server::{MethodHandler, Methods};
use crate::socket::SocketKind;
use crate::traits::ChannelBase;

/// Fire-and-forget sender over a PUSH socket.
pub struct Pusher {
    context: Arc<Context>,
    events: Arc<Events>,
}

impl Pusher {
    pub fn new() -> Self {
        Self::with_context(Context::global())
    }

    pub fn with_context(context: Arc<Context>) -> Self {
        Self::with_kind(SocketKind::Push, context)
    }

    fn with_kind(kind: SocketKind, context: Arc<Context>) -> Self {
        let events = Events::new(kind, context.clone());
        Self { context, events }
    }

    pub async fn connect(&self, endpoint: &str) -> Result<(), RpcError> {
        self.events.connect(endpoint).await
    }

    pub async fn bind(&self, endpoint: &str) -> Result<(), RpcError> {
        self.events.bind(endpoint).await
    }

    /// Send one event; there is never a reply.
    pub async fn emit(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        let xheader = self.context.hook_get_task_context();
        self.events
            .emit(method, Value::Array(args), Some(xheader))
            .await
    }

    pub async fn close(&self) {
        self.events.close().await;
    }
}

impl Default for Pusher {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcast sender over a PUB socket. Same surface as [`Pusher`].
pub struct Publisher {
    inner: Pusher,
}

impl Publisher {
    pub fn new() -> Self {
        Self::with_context(Context::global())
    }

    pub fn with_context(context: Arc<Context>) -> Self {
        Self {
            inner: Pusher::with_kind(SocketKind::Pub, context),
        }
    }

    pub async fn connect(&self, endpoint: &str) -> Result<(), RpcError> {
        self.inner.connect(endpoint).await
    }

    pub async fn bind(&self, endpoint: &str) -> Result<(), RpcError> {
        self.inner.bind(endpoint).await
    }

    pub async fn emit(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.inner.emit(method, args).await
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Work receiver over a PULL socket: dispatches each event to its method.
pub struct Puller {
    context: Arc<Context>,
    events: Arc<Events>,
    methods: Arc<Methods>,
    receiver: StdMutex<Option<AbortHandle>>,
}

impl Puller {
    pub fn new(methods: Methods) -> Self {
        Self::with_context(methods, Context::global())
    }

    pub fn with_context(methods: Methods, context: Arc<Context>) -> Self {
        Self::with_kind(SocketKind::Pull, methods, context)
    }

    fn with_kind(kind: SocketKind, methods: Methods, context: Arc<Context>) -> Self {
        let events = Events::new(kind, context.clone());
        Self {
            context,
            events,
            methods: Arc::new(methods),
            receiver: StdMutex::new(None),
        }
    }

    pub async fn bind(&self, endpoint: &str) -> Result<(), RpcError> {
        self.events.bind(endpoint).await
    }

    pub async fn connect(&self, endpoint: &str) -> Result<(), RpcError> {
        self.events.connect(endpoint).await
    }

    /// Dispatch incoming events until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        let handle = {
            let mut guard = self.receiver.lock().expect("receiver lock");
            if guard.is_some() {
                return;
            }
            let handle = tokio::spawn(receiver_loop(
                self.context.clone(),
                self.events.clone(),
                self.methods.clone(),
            ));
            *guard = Some(handle.abort_handle());
            handle
        };
        let _ = handle.await;
    }

    /// Spawn the dispatch loop in the background.
    pub fn spawn(&self) -> Option<JoinHandle<()>> {
        let mut guard = self.receiver.lock().expect("receiver lock");
        if guard.is_some() {
            return None;
        }
        let handle = tokio::spawn(receiver_loop(
            self.context.clone(),
            self.events.clone(),
            self.methods.clone(),
        ));
        *guard = Some(handle.abort_handle());
        Some(handle)
    }

    pub fn stop(&self) {
        let handle = self.receiver.lock().expect("receiver lock").take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub async fn close(&self) {
        self.stop();
        self.events.close().await;
    }
}

async fn receiver_loop(context: Arc<Context>, events: Arc<Events>, methods: Arc<Methods>) {
    loop {
        let event = match events.recv(None).await {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "one-way receiver ending");
                break;
            }
        };

        if let Err(fault) = dispatch_one(&context, &methods, &event).await {
            warn!(method = %event.name(), error = %fault, "one-way handler failed");
            context.hook_server_inspect_exception(&event, None, &fault);
        }
    }
}

async fn dispatch_one(
    context: &Arc<Context>,
    methods: &Arc<Methods>,
    event: &Event,
) -> Result<(), HandlerError> {
    let method = methods
        .get(event.name())
        .ok_or_else(|| HandlerError::new("NameError", event.name()))?;

    let handler = match method.handler() {
        MethodHandler::Rep(handler) => handler,
        MethodHandler::Stream(_) => {
            return Err(HandlerError::new(
                "TypeError",
                "streaming methods cannot serve one-way events",
            ));
        }
    };

    context.hook_load_task_context(event.header());
    context.hook_server_before_exec(event);
    handler(event.args_vec()).await?;
    // One-way patterns have no reply event to report.
    context.hook_server_after_exec(event, None);
    Ok(())
}

/// Broadcast receiver over a SUB socket, subscribed to everything.
pub struct Subscriber {
    inner: Puller,
}

impl Subscriber {
    pub fn new(methods: Methods) -> Self {
        Self::with_context(methods, Context::global())
    }

    pub fn with_context(methods: Methods, context: Arc<Context>) -> Self {
        Self {
            inner: Puller::with_kind(SocketKind::Sub, methods, context),
        }
    }

    /// Connect and subscribe to every topic.
    pub async fn connect(&self, endpoint: &str) -> Result<(), RpcError> {
        self.inner.connect(endpoint).await?;
        self.inner.events.subscribe("").await
    }

    pub async fn bind(&self, endpoint: &str) -> Result<(), RpcError> {
        self.inner.bind(endpoint).await?;
        self.inner.events.subscribe("").await
    }

    pub async fn run(&self) {
        self.inner.run().await;
    }

    pub fn spawn(&self) -> Option<JoinHandle<()>> {
        self.inner.spawn()
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }
}
