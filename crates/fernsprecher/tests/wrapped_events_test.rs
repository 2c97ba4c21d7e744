//! Nested multiplexing tests: inner events ride as `w` payloads on one
//! conversation, and a multiplexer can run on top of them.

mod common;

use common::{bound_router_dealer, RECV_TIMEOUT};
use fernsprecher::{ChannelBase, ChannelMultiplexer, Value, WrappedEvents};

#[tokio::test]
async fn sub_event_crosses_one_channel() {
    let (server_events, client_events) = bound_router_dealer().await;
    let server_mux = ChannelMultiplexer::new(server_events, false);
    let client_mux = ChannelMultiplexer::new(client_events, true);

    let client_channel = client_mux.channel(None);
    let client_wrapped = WrappedEvents::new(client_channel);
    client_wrapped
        .emit("coucou", Value::from(42), None)
        .await
        .unwrap();

    // On the wire it is a single `w` event with a binary payload.
    let carrier = server_mux.recv(Some(RECV_TIMEOUT)).await.unwrap();
    assert_eq!(carrier.name(), "w");
    assert!(matches!(carrier.args(), Value::Binary(_)));

    let server_channel = server_mux.channel(Some(carrier));
    let server_wrapped = WrappedEvents::new(server_channel);
    let inner = server_wrapped.recv(Some(RECV_TIMEOUT)).await.unwrap();
    assert_eq!(inner.name(), "coucou");
    assert_eq!(inner.args(), &Value::from(42));
    assert!(inner.message_id().is_some());
}

#[tokio::test]
async fn multiple_wrapped_channels_stay_separate() {
    let (server_events, client_events) = bound_router_dealer().await;
    let server_mux = ChannelMultiplexer::new(server_events, false);
    let client_mux = ChannelMultiplexer::new(client_events, true);

    let first = WrappedEvents::new(client_mux.channel(None));
    let second = WrappedEvents::new(client_mux.channel(None));
    first.emit("coucou1", Value::from(43), None).await.unwrap();
    second.emit("coucou2", Value::from(44), None).await.unwrap();

    let carrier = server_mux.recv(Some(RECV_TIMEOUT)).await.unwrap();
    let first_srv = WrappedEvents::new(server_mux.channel(Some(carrier)));
    let inner = first_srv.recv(Some(RECV_TIMEOUT)).await.unwrap();
    assert_eq!(inner.name(), "coucou1");
    assert_eq!(inner.args(), &Value::from(43));

    let carrier = server_mux.recv(Some(RECV_TIMEOUT)).await.unwrap();
    let second_srv = WrappedEvents::new(server_mux.channel(Some(carrier)));
    let inner = second_srv.recv(Some(RECV_TIMEOUT)).await.unwrap();
    assert_eq!(inner.name(), "coucou2");
    assert_eq!(inner.args(), &Value::from(44));

    // A follow-up on the second conversation lands on its channel, not the
    // broadcast queue.
    second.emit("another", Value::from(42), None).await.unwrap();
    let inner = second_srv.recv(Some(RECV_TIMEOUT)).await.unwrap();
    assert_eq!(inner.name(), "another");
    assert_eq!(inner.args(), &Value::from(42));
}

#[tokio::test]
async fn multiplexer_runs_recursively_over_wrapped_events() {
    let (server_events, client_events) = bound_router_dealer().await;
    let server_mux = ChannelMultiplexer::new(server_events, false);
    let client_mux = ChannelMultiplexer::new(client_events, true);

    // Client side: a sub-multiplexer inside one conversation.
    let client_wrapped = WrappedEvents::new(client_mux.channel(None));
    let client_sub_mux = ChannelMultiplexer::new(client_wrapped, true);
    let client_sub_channel = client_sub_mux.channel(None);
    client_sub_channel
        .emit("nested-hello", Value::from(1), None)
        .await
        .unwrap();
    let sub_id = client_sub_channel.id().unwrap();

    // Server side: adopt the outer conversation, then the inner one.
    let carrier = server_mux.recv(Some(RECV_TIMEOUT)).await.unwrap();
    let server_wrapped = WrappedEvents::new(server_mux.channel(Some(carrier)));
    let server_sub_mux = ChannelMultiplexer::new(server_wrapped, false);

    let opening = server_sub_mux.recv(Some(RECV_TIMEOUT)).await.unwrap();
    assert_eq!(opening.name(), "nested-hello");
    assert_eq!(opening.message_id(), Some(sub_id.as_str()));

    let server_sub_channel = server_sub_mux.channel(Some(opening));
    let request = server_sub_channel.recv(Some(RECV_TIMEOUT)).await.unwrap();
    assert_eq!(request.name(), "nested-hello");

    server_sub_channel
        .emit("nested-answer", Value::from(2), None)
        .await
        .unwrap();

    // The answer is routed through both multiplexers back to the inner
    // channel.
    let reply = client_sub_channel.recv(Some(RECV_TIMEOUT)).await.unwrap();
    assert_eq!(reply.name(), "nested-answer");
    assert_eq!(reply.response_to(), Some(sub_id.as_str()));

    client_sub_channel.close().await;
    server_sub_channel.close().await;
}
