//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use fernsprecher::{Context, Events, SocketKind};
use tracing_subscriber::EnvFilter;

/// Time for sockets to finish connecting before traffic flows.
pub const SETTLE: Duration = Duration::from_millis(200);

/// Generous deadline for any single receive in a test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Route crate logs through `RUST_LOG` when debugging a test run.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A fresh ipc endpoint, unique per call so tests never collide.
pub fn random_ipc_endpoint() -> String {
    format!("ipc:///tmp/fernsprecher-test-{}.sock", uuid::Uuid::new_v4())
}

/// A connected ROUTER/DEALER transport pair over a fresh ipc endpoint, on
/// isolated contexts.
pub async fn bound_router_dealer() -> (Arc<Events>, Arc<Events>) {
    init_tracing();
    let endpoint = random_ipc_endpoint();

    let server_events = Events::new(SocketKind::Router, Context::new());
    server_events.bind(&endpoint).await.unwrap();

    let client_events = Events::new(SocketKind::Dealer, Context::new());
    client_events.connect(&endpoint).await.unwrap();

    tokio::time::sleep(SETTLE).await;
    (server_events, client_events)
}
