//! Process-wide context: middleware chain, serializer, message-id
//! generation.
//!
//! A single global context serves as the convenience default; constructors
//! accept an explicit `Arc<Context>` everywhere so tests and embedders can
//! isolate themselves.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use rand::Rng;
use uuid::Uuid;

use crate::error::{HandlerError, RemoteError, RpcError};
use crate::event::{Event, Header};
use crate::middleware::Middleware;
use crate::patterns::ReplyPattern;
use crate::serializer::{MsgPack, Serializer};

/// Message-id generator: a 32-bit counter over a random base, reset to a
/// fresh base and a fresh random window whenever the window is exhausted.
/// Keeps ids unique within and across process restarts.
struct MsgIdGen {
    base: String,
    counter: u64,
    stop: u64,
}

impl MsgIdGen {
    fn new() -> Self {
        let mut gen = Self {
            base: String::new(),
            counter: 0,
            stop: 0,
        };
        gen.reset();
        gen
    }

    fn reset(&mut self) {
        let mut rng = rand::thread_rng();
        self.base = Uuid::new_v4().to_string()[8..].to_owned();
        self.counter = rng.gen_range(0..1u64 << 32);
        self.stop = rng.gen_range(self.counter..1u64 << 32);
    }

    fn next(&mut self) -> String {
        if self.counter >= self.stop {
            self.reset();
        } else {
            self.counter += 1;
        }
        format!("{:08x}{}", self.counter, self.base)
    }
}

pub struct Context {
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    serializer: Arc<dyn Serializer>,
    msgid: Mutex<MsgIdGen>,
}

impl Context {
    pub fn new() -> Arc<Self> {
        Self::with_serializer(Arc::new(MsgPack))
    }

    pub fn with_serializer(serializer: Arc<dyn Serializer>) -> Arc<Self> {
        Arc::new(Self {
            middlewares: RwLock::new(Vec::new()),
            serializer,
            msgid: Mutex::new(MsgIdGen::new()),
        })
    }

    /// The process-wide default context.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<Context>> = OnceLock::new();
        GLOBAL.get_or_init(Context::new).clone()
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn new_msgid(&self) -> String {
        self.msgid.lock().expect("msgid lock").next()
    }

    /// Append a middleware to the chain. Hooks run in registration order.
    pub fn register_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares
            .write()
            .expect("middleware registry lock")
            .push(middleware);
    }

    fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares
            .read()
            .expect("middleware registry lock")
            .clone()
    }

    pub fn hook_resolve_endpoint(&self, endpoint: String) -> String {
        self.middlewares()
            .iter()
            .fold(endpoint, |ep, mw| mw.resolve_endpoint(ep))
    }

    pub fn hook_load_task_context(&self, header: &Header) {
        for mw in self.middlewares() {
            mw.load_task_context(header);
        }
    }

    pub fn hook_get_task_context(&self) -> Header {
        let mut header = Header::new();
        for mw in self.middlewares() {
            header.extend(mw.get_task_context());
        }
        header
    }

    pub fn hook_server_before_exec(&self, request: &Event) {
        for mw in self.middlewares() {
            mw.server_before_exec(request);
        }
    }

    pub fn hook_server_after_exec(&self, request: &Event, reply: Option<&Event>) {
        for mw in self.middlewares() {
            mw.server_after_exec(request, reply);
        }
    }

    pub fn hook_server_inspect_exception(
        &self,
        request: &Event,
        reply: Option<&Event>,
        error: &HandlerError,
    ) {
        let task_context = self.hook_get_task_context();
        for mw in self.middlewares() {
            mw.server_inspect_exception(request, reply, &task_context, error);
        }
    }

    pub fn hook_client_handle_remote_error(&self, event: &Event) -> Option<RemoteError> {
        let mut result = None;
        for mw in self.middlewares() {
            if let Some(error) = mw.client_handle_remote_error(event) {
                result = Some(error);
            }
        }
        result
    }

    pub fn hook_client_before_request(&self, request: &Event) {
        for mw in self.middlewares() {
            mw.client_before_request(request);
        }
    }

    pub fn hook_client_after_request(
        &self,
        request: &Event,
        reply: Option<&Event>,
        error: Option<&RpcError>,
    ) {
        for mw in self.middlewares() {
            mw.client_after_request(request, reply, error);
        }
    }

    pub fn hook_client_patterns_list(
        &self,
        patterns: Vec<Arc<dyn ReplyPattern>>,
    ) -> Vec<Arc<dyn ReplyPattern>> {
        self.middlewares()
            .iter()
            .fold(patterns, |list, mw| mw.client_patterns_list(list))
    }
}

/// Capture the current task context and re-apply it when `fut` starts on a
/// freshly spawned task, so trace identifiers survive task boundaries:
///
/// ```ignore
/// tokio::spawn(fork_task_context(context.clone(), async move {
///     client.call("method", vec![]).await
/// }));
/// ```
pub fn fork_task_context<F>(context: Arc<Context>, fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let xheader = context.hook_get_task_context();
    async move {
        context.hook_load_task_context(&xheader);
        fut.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn msgids_are_unique() {
        let mut gen = MsgIdGen::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(gen.next()), "duplicate message id");
        }
    }

    #[test]
    fn msgids_survive_window_resets() {
        let mut gen = MsgIdGen::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            // Exhaust the window so every next() triggers a reset.
            gen.stop = gen.counter;
            assert!(seen.insert(gen.next()), "duplicate message id after reset");
        }
    }

    #[test]
    fn msgid_counter_is_eight_hex_digits() {
        let ctx = Context::new();
        let id = ctx.new_msgid();
        assert!(id.len() > 8);
        assert!(id[..8].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn resolve_endpoint_chains_in_order() {
        struct Suffix(&'static str);
        impl Middleware for Suffix {
            fn resolve_endpoint(&self, endpoint: String) -> String {
                format!("{endpoint}{}", self.0)
            }
        }

        let ctx = Context::new();
        ctx.register_middleware(Arc::new(Suffix("-a")));
        ctx.register_middleware(Arc::new(Suffix("-b")));
        assert_eq!(ctx.hook_resolve_endpoint("ep".into()), "ep-a-b");
    }

    #[test]
    fn get_task_context_merges() {
        struct One;
        impl Middleware for One {
            fn get_task_context(&self) -> Header {
                let mut h = Header::new();
                h.insert("trace_id".into(), "t-1".into());
                h
            }
        }
        struct Two;
        impl Middleware for Two {
            fn get_task_context(&self) -> Header {
                let mut h = Header::new();
                h.insert("client_id".into(), "c-1".into());
                h
            }
        }

        let ctx = Context::new();
        ctx.register_middleware(Arc::new(One));
        ctx.register_middleware(Arc::new(Two));
        let header = ctx.hook_get_task_context();
        assert_eq!(header.len(), 2);
    }

    #[test]
    fn last_remote_error_override_wins() {
        struct Override(&'static str);
        impl Middleware for Override {
            fn client_handle_remote_error(&self, _event: &Event) -> Option<RemoteError> {
                Some(RemoteError::new(self.0, "m", None))
            }
        }

        let ctx = Context::new();
        ctx.register_middleware(Arc::new(Override("First")));
        ctx.register_middleware(Arc::new(Override("Second")));

        let event = Event::with_msgid("ERR", rmpv::Value::Nil, "id".into());
        let err = ctx.hook_client_handle_remote_error(&event).unwrap();
        assert_eq!(err.name, "Second");
    }
}
