//! Background-call tests: the async handle resolves out of band.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{random_ipc_endpoint, SETTLE};
use fernsprecher::{
    CallOptions, Client, ClientConfig, Context, Methods, RpcError, Server, ServerConfig, Value,
};

async fn start() -> (Arc<Server>, Client, tokio::task::JoinHandle<()>) {
    let endpoint = random_ipc_endpoint();

    let mut methods = Methods::new("asyncable");
    methods.rep("double", |args| async move {
        let n = args.first().and_then(Value::as_i64).unwrap_or(0);
        Ok(Value::from(n * 2))
    });
    methods.rep("slow_double", |args| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let n = args.first().and_then(Value::as_i64).unwrap_or(0);
        Ok(Value::from(n * 2))
    });

    let server = Arc::new(Server::with_config(
        methods,
        ServerConfig::default(),
        Context::new(),
    ));
    server.bind(&endpoint).await.unwrap();
    let run_server = server.clone();
    let run_task = tokio::spawn(async move { run_server.run().await });

    let client = Client::with_config(ClientConfig::default(), Context::new());
    client.connect(&endpoint).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    (server, client, run_task)
}

#[tokio::test]
async fn async_call_resolves_later() {
    let (server, client, run_task) = start().await;

    let pending = client
        .call_async("slow_double", vec![Value::from(21)], CallOptions::default())
        .await
        .unwrap();

    // The call is in flight; we are free to do other work meanwhile.
    let direct = client.call("double", vec![Value::from(1)]).await.unwrap();
    assert_eq!(direct.into_value().unwrap(), Value::from(2));

    let reply = pending.wait().await.unwrap();
    assert_eq!(reply.into_value().unwrap(), Value::from(42));

    client.close().await;
    server.close().await;
    let _ = run_task.await;
}

#[tokio::test]
async fn many_async_calls_in_flight() {
    let (server, client, run_task) = start().await;

    let mut pendings = Vec::new();
    for n in 0..10i64 {
        let pending = client
            .call_async("double", vec![Value::from(n)], CallOptions::default())
            .await
            .unwrap();
        pendings.push((n, pending));
    }
    for (n, pending) in pendings {
        let reply = pending.wait().await.unwrap();
        assert_eq!(reply.into_value().unwrap(), Value::from(n * 2));
    }

    client.close().await;
    server.close().await;
    let _ = run_task.await;
}

#[tokio::test]
async fn async_call_times_out_like_a_sync_one() {
    let (server, client, run_task) = start().await;

    let options = CallOptions {
        timeout: Some(Duration::from_millis(100)),
        slots: None,
    };
    let pending = client
        .call_async("slow_double", vec![Value::from(1)], options)
        .await
        .unwrap();

    let result = pending.wait().await;
    assert!(matches!(result, Err(RpcError::Timeout(_))));

    client.close().await;
    server.close().await;
    let _ = run_task.await;
}
