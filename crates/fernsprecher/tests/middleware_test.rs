//! Middleware chain tests: endpoint resolution, lifecycle hooks, task
//! context propagation, and remote-error translation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{random_ipc_endpoint, SETTLE};
use fernsprecher::{
    Client, ClientConfig, Context, Event, HandlerError, Header, Methods, Middleware, RemoteError,
    RpcError, Server, ServerConfig, Value,
};

fn echo_methods() -> Methods {
    let mut methods = Methods::new("echoer");
    methods.rep("echo", |args| async move {
        Ok(args.into_iter().next().unwrap_or(Value::Nil))
    });
    methods.rep("boom", |_args| async move {
        Err::<Value, _>(HandlerError::new("ValueError", "boom"))
    });
    methods.rep("nap", |_args| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(Value::Nil)
    });
    methods
}

async fn start_with_context(
    server_context: Arc<Context>,
    client_context: Arc<Context>,
    client_config: ClientConfig,
) -> (Arc<Server>, Client, tokio::task::JoinHandle<()>, String) {
    let endpoint = random_ipc_endpoint();
    let server = Arc::new(Server::with_config(
        echo_methods(),
        ServerConfig::default(),
        server_context,
    ));
    server.bind(&endpoint).await.unwrap();
    let run_server = server.clone();
    let run_task = tokio::spawn(async move { run_server.run().await });

    let client = Client::with_config(client_config, client_context);
    client.connect(&endpoint).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    (server, client, run_task, endpoint)
}

#[tokio::test]
async fn resolve_endpoint_rewrites_service_names() {
    struct Resolver {
        target: String,
    }
    impl Middleware for Resolver {
        fn resolve_endpoint(&self, endpoint: String) -> String {
            if endpoint == "echo_service" {
                self.target.clone()
            } else {
                endpoint
            }
        }
    }

    let endpoint = random_ipc_endpoint();
    let server_context = Context::new();
    server_context.register_middleware(Arc::new(Resolver {
        target: endpoint.clone(),
    }));
    let client_context = Context::new();
    client_context.register_middleware(Arc::new(Resolver {
        target: endpoint.clone(),
    }));

    let server = Arc::new(Server::with_config(
        echo_methods(),
        ServerConfig::default(),
        server_context,
    ));
    // Both sides bind/connect through the resolver, never seeing the real
    // address.
    server.bind("echo_service").await.unwrap();
    let run_server = server.clone();
    let run_task = tokio::spawn(async move { run_server.run().await });

    let client = Client::with_config(ClientConfig::default(), client_context);
    client.connect("echo_service").await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let reply = client.call("echo", vec![Value::from(7)]).await.unwrap();
    assert_eq!(reply.into_value().unwrap(), Value::from(7));

    client.close().await;
    server.close().await;
    let _ = run_task.await;
}

#[derive(Default)]
struct HookCounter {
    server_before: AtomicUsize,
    server_after: AtomicUsize,
    server_inspected: AtomicUsize,
    client_before: AtomicUsize,
    client_after: AtomicUsize,
    last_client_error: Mutex<Option<String>>,
    last_reply_was_none: Mutex<Option<bool>>,
}

impl Middleware for HookCounter {
    fn server_before_exec(&self, _request: &Event) {
        self.server_before.fetch_add(1, Ordering::SeqCst);
    }

    fn server_after_exec(&self, _request: &Event, _reply: Option<&Event>) {
        self.server_after.fetch_add(1, Ordering::SeqCst);
    }

    fn server_inspect_exception(
        &self,
        _request: &Event,
        _reply: Option<&Event>,
        _task_context: &Header,
        _error: &HandlerError,
    ) {
        self.server_inspected.fetch_add(1, Ordering::SeqCst);
    }

    fn client_before_request(&self, _request: &Event) {
        self.client_before.fetch_add(1, Ordering::SeqCst);
    }

    fn client_after_request(
        &self,
        _request: &Event,
        reply: Option<&Event>,
        error: Option<&RpcError>,
    ) {
        self.client_after.fetch_add(1, Ordering::SeqCst);
        *self.last_reply_was_none.lock().unwrap() = Some(reply.is_none());
        *self.last_client_error.lock().unwrap() = error.map(|e| e.to_string());
    }
}

#[tokio::test]
async fn exec_hooks_fire_around_successful_calls() {
    let server_context = Context::new();
    let counter = Arc::new(HookCounter::default());
    server_context.register_middleware(counter.clone());

    let (server, client, run_task, _endpoint) =
        start_with_context(server_context, Context::new(), ClientConfig::default()).await;

    client.call("echo", vec![Value::from(1)]).await.unwrap();
    client.call("echo", vec![Value::from(2)]).await.unwrap();

    assert_eq!(counter.server_before.load(Ordering::SeqCst), 2);
    assert_eq!(counter.server_after.load(Ordering::SeqCst), 2);
    assert_eq!(counter.server_inspected.load(Ordering::SeqCst), 0);

    client.close().await;
    server.close().await;
    let _ = run_task.await;
}

#[tokio::test]
async fn failed_call_reaches_the_inspection_hook() {
    let server_context = Context::new();
    let counter = Arc::new(HookCounter::default());
    server_context.register_middleware(counter.clone());

    let (server, client, run_task, _endpoint) =
        start_with_context(server_context, Context::new(), ClientConfig::default()).await;

    let result = client.call("boom", vec![]).await;
    assert!(matches!(result, Err(RpcError::Remote(_))));

    assert_eq!(counter.server_before.load(Ordering::SeqCst), 1);
    assert_eq!(counter.server_after.load(Ordering::SeqCst), 0);
    assert_eq!(counter.server_inspected.load(Ordering::SeqCst), 1);

    client.close().await;
    server.close().await;
    let _ = run_task.await;
}

#[tokio::test]
async fn client_hooks_fire_for_replies_and_errors() {
    let client_context = Context::new();
    let counter = Arc::new(HookCounter::default());
    client_context.register_middleware(counter.clone());

    let (server, client, run_task, _endpoint) =
        start_with_context(Context::new(), client_context, ClientConfig::default()).await;

    client.call("echo", vec![Value::from(1)]).await.unwrap();
    assert_eq!(counter.client_before.load(Ordering::SeqCst), 1);
    assert_eq!(counter.client_after.load(Ordering::SeqCst), 1);
    assert_eq!(*counter.last_reply_was_none.lock().unwrap(), Some(false));
    assert_eq!(*counter.last_client_error.lock().unwrap(), None);

    let result = client.call("boom", vec![]).await;
    assert!(result.is_err());
    assert_eq!(counter.client_after.load(Ordering::SeqCst), 2);
    assert!(counter
        .last_client_error
        .lock()
        .unwrap()
        .as_deref()
        .is_some_and(|e| e.contains("boom")));

    client.close().await;
    server.close().await;
    let _ = run_task.await;
}

#[tokio::test]
async fn timed_out_call_reports_a_none_reply() {
    let client_context = Context::new();
    let counter = Arc::new(HookCounter::default());
    client_context.register_middleware(counter.clone());

    let config = ClientConfig {
        timeout_ms: 200,
        ..ClientConfig::default()
    };
    let (server, client, run_task, _endpoint) =
        start_with_context(Context::new(), client_context, config).await;

    let result = client.call("nap", vec![]).await;
    assert!(matches!(result, Err(RpcError::Timeout(_))));

    assert_eq!(counter.client_after.load(Ordering::SeqCst), 1);
    assert_eq!(*counter.last_reply_was_none.lock().unwrap(), Some(true));
    assert!(counter
        .last_client_error
        .lock()
        .unwrap()
        .as_deref()
        .is_some_and(|e| e.contains("timeout")));

    client.close().await;
    server.close().await;
    let _ = run_task.await;
}

#[tokio::test]
async fn task_context_propagates_from_client_to_server() {
    // One shared middleware instance registered on both contexts: what the
    // client stamps into headers, the server-side hook reads back.
    #[derive(Default)]
    struct Tracer {
        seen: Mutex<Option<String>>,
    }
    impl Middleware for Tracer {
        fn get_task_context(&self) -> Header {
            let mut header = Header::new();
            header.insert("trace_id".into(), Value::from("trace-77"));
            header
        }

        fn load_task_context(&self, header: &Header) {
            if let Some(trace) = header.get("trace_id").and_then(Value::as_str) {
                *self.seen.lock().unwrap() = Some(trace.to_owned());
            }
        }
    }

    let tracer = Arc::new(Tracer::default());
    let server_context = Context::new();
    server_context.register_middleware(tracer.clone());
    let client_context = Context::new();
    client_context.register_middleware(tracer.clone());

    let (server, client, run_task, _endpoint) =
        start_with_context(server_context, client_context, ClientConfig::default()).await;

    client.call("echo", vec![Value::from(1)]).await.unwrap();
    assert_eq!(
        tracer.seen.lock().unwrap().as_deref(),
        Some("trace-77"),
        "server never observed the client's trace id",
    );

    client.close().await;
    server.close().await;
    let _ = run_task.await;
}

#[tokio::test]
async fn remote_error_hook_overrides_the_default_translation() {
    struct Translator;
    impl Middleware for Translator {
        fn client_handle_remote_error(&self, event: &Event) -> Option<RemoteError> {
            let name = event
                .args_vec()
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            Some(RemoteError::new(format!("Translated{name}"), "rewritten", None))
        }
    }

    let client_context = Context::new();
    client_context.register_middleware(Arc::new(Translator));

    let (server, client, run_task, _endpoint) =
        start_with_context(Context::new(), client_context, ClientConfig::default()).await;

    let result = client.call("boom", vec![]).await;
    match result {
        Err(RpcError::Remote(error)) => {
            assert_eq!(error.name, "TranslatedValueError");
            assert_eq!(error.msg, "rewritten");
        }
        other => panic!("expected translated error, got {other:?}"),
    }

    client.close().await;
    server.close().await;
    let _ = run_task.await;
}

#[tokio::test]
async fn fork_task_context_carries_headers_into_spawned_tasks() {
    #[derive(Default)]
    struct Store {
        current: Mutex<Option<String>>,
    }
    impl Middleware for Store {
        fn get_task_context(&self) -> Header {
            let mut header = Header::new();
            if let Some(id) = self.current.lock().unwrap().clone() {
                header.insert("trace_id".into(), Value::from(id));
            }
            header
        }

        fn load_task_context(&self, header: &Header) {
            if let Some(trace) = header.get("trace_id").and_then(Value::as_str) {
                *self.current.lock().unwrap() = Some(trace.to_owned());
            }
        }
    }

    let store = Arc::new(Store::default());
    let context = Context::new();
    context.register_middleware(store.clone());

    // Seed the current task's context, then fork it into a new task.
    let mut seeded = Header::new();
    seeded.insert("trace_id".into(), Value::from("forked-1"));
    context.hook_load_task_context(&seeded);

    *store.current.lock().unwrap() = Some("forked-1".into());
    let forked = fernsprecher::fork_task_context(context.clone(), async move {});
    *store.current.lock().unwrap() = None;

    tokio::spawn(forked).await.unwrap();
    assert_eq!(store.current.lock().unwrap().as_deref(), Some("forked-1"));
}
