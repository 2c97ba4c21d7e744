//! Server facade: a ROUTER socket, a method registry, and one task per
//! in-flight request.
//!
//! The acceptor loop pulls conversation-opening events off the multiplexer's
//! broadcast queue and spawns a handler task per request. Each handler wraps
//! its channel in the heartbeat and flow-control layers (heartbeating
//! passively for legacy v1 peers), dispatches through the method's call
//! pattern, and converts handler failures into `ERR` replies.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use rmpv::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::buffered::BufferedChannel;
use crate::channel::ChannelMultiplexer;
use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::{HandlerError, RpcError};
use crate::event::{Event, REPLY_ERR};
use crate::events::Events;
use crate::heartbeat::HeartbeatChannel;
use crate::patterns::{process_call, DispatchError};
use crate::socket::SocketKind;
use crate::traits::ChannelBase;

/// Method names starting with this prefix are reserved for the framework's
/// introspection procedures.
pub const RESERVED_PREFIX: &str = "_zerorpc_";

const BUILTIN_LIST: &str = "_zerorpc_list";
const BUILTIN_NAME: &str = "_zerorpc_name";
const BUILTIN_PING: &str = "_zerorpc_ping";
const BUILTIN_HELP: &str = "_zerorpc_help";
const BUILTIN_ARGS: &str = "_zerorpc_args";
const BUILTIN_INSPECT: &str = "_zerorpc_inspect";

/// Boxed single-reply handler.
pub type RepHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// The item stream a streaming handler produces.
pub type ValueStream = BoxStream<'static, Result<Value, HandlerError>>;

/// Boxed streaming handler.
pub type StreamHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<ValueStream, HandlerError>> + Send + Sync>;

/// How a method answers: one reply, or a stream of chunks.
pub enum MethodHandler {
    Rep(RepHandler),
    Stream(StreamHandler),
}

/// One registered procedure: handler plus introspection metadata.
pub struct MethodDef {
    name: String,
    handler: MethodHandler,
    doc: Option<String>,
    arg_names: Vec<String>,
}

impl MethodDef {
    pub(crate) fn new_rep(name: impl Into<String>, handler: RepHandler) -> Self {
        Self {
            name: name.into(),
            handler: MethodHandler::Rep(handler),
            doc: None,
            arg_names: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handler(&self) -> &MethodHandler {
        &self.handler
    }

    /// Attach a documentation string, surfaced by the introspection
    /// procedures.
    pub fn doc(&mut self, doc: impl Into<String>) -> &mut Self {
        self.doc = Some(doc.into());
        self
    }

    /// Name the positional arguments, surfaced by the introspection
    /// procedures.
    pub fn args(&mut self, names: &[&str]) -> &mut Self {
        self.arg_names = names.iter().map(|n| (*n).to_owned()).collect();
        self
    }

    pub fn doc_str(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn arg_names(&self) -> &[String] {
        &self.arg_names
    }
}

/// Named registry of procedures a server exposes.
pub struct Methods {
    name: String,
    table: HashMap<String, MethodDef>,
}

impl Methods {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: HashMap::new(),
        }
    }

    /// Service name reported by the introspection procedures.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_name(name: &str) {
        assert!(
            !name.starts_with(RESERVED_PREFIX),
            "method names starting with {RESERVED_PREFIX} are reserved"
        );
    }

    /// Register a single-reply procedure.
    pub fn rep<F, Fut>(&mut self, name: &str, handler: F) -> &mut MethodDef
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        Self::check_name(name);
        let handler: RepHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.table
            .insert(name.to_owned(), MethodDef::new_rep(name, handler));
        self.table.get_mut(name).expect("method just inserted")
    }

    /// Register a streaming procedure: each yielded item becomes one
    /// `STREAM` chunk.
    pub fn stream<F, Fut>(&mut self, name: &str, handler: F) -> &mut MethodDef
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueStream, HandlerError>> + Send + 'static,
    {
        Self::check_name(name);
        let handler: StreamHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.table.insert(
            name.to_owned(),
            MethodDef {
                name: name.to_owned(),
                handler: MethodHandler::Stream(handler),
                doc: None,
                arg_names: Vec::new(),
            },
        );
        self.table.get_mut(name).expect("method just inserted")
    }

    pub fn get(&self, name: &str) -> Option<&MethodDef> {
        self.table.get(name)
    }

    /// Method names not starting with an underscore, sorted.
    pub fn public_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .table
            .keys()
            .filter(|name| !name.starts_with('_'))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

struct ServerInner {
    context: Arc<Context>,
    events: Arc<Events>,
    multiplexer: Arc<ChannelMultiplexer>,
    methods: Arc<Methods>,
    heartbeat: Duration,
    inbox_size: usize,
    pool: Option<Arc<Semaphore>>,
    acceptor: StdMutex<Option<AbortHandle>>,
    tasks: Mutex<JoinSet<()>>,
}

/// RPC server over a ROUTER socket.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Build a server on the global context with default settings.
    pub fn new(methods: Methods) -> Self {
        Self::with_config(methods, ServerConfig::default(), Context::global())
    }

    pub fn with_config(methods: Methods, config: ServerConfig, context: Arc<Context>) -> Self {
        let events = Events::new(SocketKind::Router, context.clone());
        let multiplexer = ChannelMultiplexer::new(events.clone(), false);
        let pool = config
            .pool_size
            .filter(|size| *size > 0)
            .map(|size| Arc::new(Semaphore::new(size)));

        Self {
            inner: Arc::new(ServerInner {
                context,
                events,
                multiplexer,
                methods: Arc::new(methods),
                heartbeat: config.heartbeat(),
                inbox_size: config.buffer_slots,
                pool,
                acceptor: StdMutex::new(None),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.methods.name()
    }

    pub async fn bind(&self, endpoint: &str) -> Result<(), RpcError> {
        self.inner.events.bind(endpoint).await
    }

    pub async fn connect(&self, endpoint: &str) -> Result<(), RpcError> {
        self.inner.events.connect(endpoint).await
    }

    /// Serve until [`stop`](Self::stop) is called. In-flight handlers are
    /// awaited before returning.
    pub async fn run(&self) {
        let handle = {
            let mut guard = self.inner.acceptor.lock().expect("acceptor lock");
            if guard.is_some() {
                return;
            }
            let inner = self.inner.clone();
            let handle = tokio::spawn(acceptor_loop(inner));
            *guard = Some(handle.abort_handle());
            handle
        };
        info!(name = %self.inner.methods.name(), "server running");
        let _ = handle.await;
        self.drain_tasks().await;
    }

    /// Kill the acceptor; in-flight handlers keep running.
    pub fn stop(&self) {
        let handle = self.inner.acceptor.lock().expect("acceptor lock").take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Stop accepting, wait for in-flight handlers, then close the
    /// multiplexer and the socket.
    pub async fn close(&self) {
        self.stop();
        self.drain_tasks().await;
        self.inner.multiplexer.close().await;
        self.inner.events.close().await;
    }

    async fn drain_tasks(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}

async fn acceptor_loop(inner: Arc<ServerInner>) {
    loop {
        let event = match inner.multiplexer.recv(None).await {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "acceptor ending");
                break;
            }
        };

        let permit = match &inner.pool {
            Some(pool) => match pool.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };

        let task_inner = inner.clone();
        let mut tasks = inner.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(handle_request(task_inner, event, permit));
    }
}

async fn handle_request(
    inner: Arc<ServerInner>,
    initial: Event,
    _permit: Option<OwnedSemaphorePermit>,
) {
    // Peers that never declared v ≥ 2 only understand single-string errors
    // and must not be heartbeated first.
    let protocol_v1 = initial.version().unwrap_or(1) < 2;
    let channel = inner.multiplexer.channel(Some(initial));
    let hbchan = HeartbeatChannel::new(channel, inner.heartbeat, protocol_v1);
    let bufchan = BufferedChannel::new(hbchan, inner.inbox_size);

    let request = match bufchan.recv(None).await {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "request channel died before dispatch");
            bufchan.close().await;
            return;
        }
    };
    inner.context.hook_load_task_context(request.header());

    match dispatch(&inner, &bufchan, &request).await {
        Ok(()) => {}
        Err(DispatchError::Fault(fault)) => {
            warn!(method = %request.name(), error = %fault, "method call failed");
            let reply = bufchan.new_event(
                REPLY_ERR,
                error_reply_args(&fault, protocol_v1),
                Some(inner.context.hook_get_task_context()),
            );
            inner
                .context
                .hook_server_inspect_exception(&request, Some(&reply), &fault);
            if let Err(e) = bufchan.emit_event(reply, None).await {
                warn!(error = %e, "unable to send error reply");
            }
        }
        Err(DispatchError::Transport(e)) => {
            // Typically a lost remote; nothing can be sent back.
            warn!(method = %request.name(), error = %e, "request ended without reply");
        }
    }

    bufchan.close().await;
}

async fn dispatch(
    inner: &Arc<ServerInner>,
    channel: &Arc<BufferedChannel>,
    request: &Event,
) -> Result<(), DispatchError> {
    if let Some(method) = inner.methods.get(request.name()) {
        return process_call(&inner.context, channel, request, method).await;
    }
    if let Some(method) = builtin_method(inner, request.name()) {
        return process_call(&inner.context, channel, request, &method).await;
    }
    Err(DispatchError::Fault(HandlerError::new(
        "NameError",
        request.name(),
    )))
}

fn error_reply_args(fault: &HandlerError, protocol_v1: bool) -> Value {
    if protocol_v1 {
        return Value::Array(vec![Value::from(fault.to_string())]);
    }
    let traceback = fault
        .traceback
        .clone()
        .unwrap_or_else(|| format!("{}: {}\n", fault.name, fault.message));
    Value::Array(vec![
        Value::from(fault.name.as_str()),
        Value::from(fault.message.as_str()),
        Value::from(traceback),
    ])
}

/// Introspection procedures. They reflect over the registry and never shadow
/// user methods.
fn builtin_method(inner: &Arc<ServerInner>, name: &str) -> Option<MethodDef> {
    let methods = inner.methods.clone();
    let handler: RepHandler = match name {
        BUILTIN_LIST => Arc::new(move |_args| {
            let names: Vec<Value> = methods
                .public_names()
                .into_iter()
                .map(Value::from)
                .collect();
            Box::pin(async move { Ok(Value::Array(names)) })
        }),
        BUILTIN_NAME => Arc::new(move |_args| {
            let name = methods.name().to_owned();
            Box::pin(async move { Ok(Value::from(name)) })
        }),
        BUILTIN_PING => Arc::new(move |_args| {
            let name = methods.name().to_owned();
            Box::pin(async move { Ok(Value::Array(vec![Value::from("pong"), Value::from(name)])) })
        }),
        BUILTIN_HELP => Arc::new(move |args| {
            let result = lookup_method(&methods, &args).map(|method| {
                method
                    .doc_str()
                    .map(Value::from)
                    .unwrap_or(Value::Nil)
            });
            Box::pin(async move { result })
        }),
        BUILTIN_ARGS => Arc::new(move |args| {
            let result = lookup_method(&methods, &args).map(|method| {
                Value::Array(
                    method
                        .arg_names()
                        .iter()
                        .map(|n| Value::from(n.as_str()))
                        .collect(),
                )
            });
            Box::pin(async move { result })
        }),
        BUILTIN_INSPECT => Arc::new(move |_args| {
            let detailed: Vec<(Value, Value)> = methods
                .public_names()
                .into_iter()
                .filter_map(|name| methods.get(&name).map(|m| (name, m)))
                .map(|(name, method)| {
                    let args = Value::Array(
                        method
                            .arg_names()
                            .iter()
                            .map(|n| {
                                Value::Map(vec![(Value::from("name"), Value::from(n.as_str()))])
                            })
                            .collect(),
                    );
                    let doc = method.doc_str().map(Value::from).unwrap_or(Value::Nil);
                    (
                        Value::from(name),
                        Value::Map(vec![
                            (Value::from("args"), args),
                            (Value::from("doc"), doc),
                        ]),
                    )
                })
                .collect();
            let inspection = Value::Map(vec![
                (Value::from("name"), Value::from(methods.name())),
                (Value::from("methods"), Value::Map(detailed)),
            ]);
            Box::pin(async move { Ok(inspection) })
        }),
        _ => return None,
    };
    Some(MethodDef::new_rep(name, handler))
}

fn lookup_method<'a>(methods: &'a Methods, args: &[Value]) -> Result<&'a MethodDef, HandlerError> {
    let name = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::new("TypeError", "expected a method name argument"))?;
    methods
        .get(name)
        .ok_or_else(|| HandlerError::new("NameError", name))
}
