// tests/connection.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{echo, echo_spans, init_logging, wait_for_state, within, Action, Worker};
use ner_rpc::{
    // ---
    ConnectionState,
    MemoryBroker,
    RpcClient,
    ReconnectPolicy,
    RpcConfig,
    RpcError,
};

/// Worker that never answers "hang" and echoes everything else.
fn hang_or_echo(broker: &MemoryBroker) -> Worker {
    Worker::spawn(broker, |req| {
        if req.input == "hang" {
            Action::Ignore
        } else {
            echo(req)
        }
    })
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let client = common::connected_client(&broker, "twice").await;

    client.connect().await.unwrap();
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connect_refused() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    broker.refuse_connections(true);
    let client = common::client_builder(&broker, "refused").build().unwrap();

    let res = client.connect().await;
    assert!(matches!(res, Err(RpcError::Connection(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(client.predict("x").await, Err(RpcError::NotConnected)));
}

#[tokio::test]
async fn test_disconnect_fails_pending_and_releases_session() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let _worker = hang_or_echo(&broker);
    let client = common::connected_client(&broker, "bye").await;
    assert_eq!(broker.queue_count(), 2);

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.predict_with_timeout("hang", Duration::from_secs(10)).await })
    };
    common::wait_until("call in flight", || client.pending_count() == 1).await;

    client.disconnect().await;

    let res = within(call).await.unwrap();
    assert!(matches!(res, Err(RpcError::ConnectionLost)));
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(broker.connection_count(), 0);
    // Only the worker queue is left; the reply queue went with the session.
    assert_eq!(broker.queue_count(), 1);

    assert!(matches!(client.predict("x").await, Err(RpcError::NotConnected)));
}

#[tokio::test]
async fn test_reconnects_after_link_drop() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let worker = hang_or_echo(&broker);
    let client = common::connected_client(&broker, "phoenix").await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.predict_with_timeout("hang", Duration::from_secs(10)).await })
    };
    common::wait_until("request at worker", || worker.seen_count() == 1).await;
    let old_reply_to = worker.seen.lock().unwrap()[0].reply_to.clone().unwrap();

    assert_eq!(broker.sever_links(), 1);

    let res = within(call).await.unwrap();
    assert!(matches!(res, Err(RpcError::ConnectionLost)));

    let state = wait_for_state(&client, |s| *s == ConnectionState::Connected).await;
    assert_eq!(state, ConnectionState::Connected);
    assert_eq!(broker.connection_count(), 1);
    assert!(!broker.has_queue(old_reply_to.as_str()));

    assert_eq!(client.predict("again").await.unwrap(), echo_spans("again"));
}

#[tokio::test]
async fn test_gives_up_after_bounded_attempts() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let _worker = hang_or_echo(&broker);
    let client = common::connected_client(&broker, "doomed").await;

    broker.refuse_connections(true);
    broker.sever_links();

    let state = wait_for_state(&client, |s| *s == ConnectionState::Failed).await;
    assert_eq!(state, ConnectionState::Failed);
    assert_eq!(broker.connection_count(), 0);

    let res = client.predict("x").await;
    assert!(matches!(res, Err(RpcError::Connection(_))));

    // An explicit connect recovers once the broker is back.
    broker.refuse_connections(false);
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.predict("back").await.unwrap(), echo_spans("back"));
}

#[tokio::test]
async fn test_no_reconnect_goes_straight_to_failed() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let config = RpcConfig::memory("once").with_reconnect(ReconnectPolicy::disabled());
    let client = RpcClient::new(Arc::new(broker.clone()), config).unwrap();
    client.connect().await.unwrap();

    broker.sever_links();

    wait_for_state(&client, |s| *s == ConnectionState::Failed).await;
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_disconnect_stops_reconnect_loop() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let client = common::client_builder(&broker, "quiet")
        .reconnect_initial_delay(Duration::from_millis(200))
        .reconnect_max_delay(Duration::from_millis(500))
        .build()
        .unwrap();
    client.connect().await.unwrap();

    broker.refuse_connections(true);
    broker.sever_links();
    wait_for_state(&client, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;

    client.disconnect().await;
    broker.refuse_connections(false);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_run_connected_always_disconnects() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let _worker = hang_or_echo(&broker);
    let client = common::client_builder(&broker, "scoped").build().unwrap();

    let spans = client
        .run_connected(|c| async move { c.predict("inside").await })
        .await
        .unwrap();
    assert_eq!(spans, echo_spans("inside"));
    assert!(!client.is_connected());
    assert_eq!(broker.connection_count(), 0);

    let res: ner_rpc::Result<()> = client
        .run_connected(|_| async { Err(RpcError::Cancelled) })
        .await;
    assert!(matches!(res, Err(RpcError::Cancelled)));
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_dropping_client_releases_session() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let client = common::connected_client(&broker, "dropped").await;
    assert_eq!(broker.connection_count(), 1);

    drop(client);
    common::wait_until("session released", || broker.connection_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_link_dead_before_install_is_not_left_connected() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    broker.sever_after_declare(true);
    let config = RpcConfig::memory("stillborn").with_reconnect(ReconnectPolicy::disabled());
    let client = RpcClient::new(Arc::new(broker.clone()), config).unwrap();

    client.connect().await.unwrap();

    let state = wait_for_state(&client, |s| *s == ConnectionState::Failed).await;
    assert_eq!(state, ConnectionState::Failed);
    assert_eq!(broker.connection_count(), 0);
    assert!(matches!(client.predict("x").await, Err(RpcError::Connection(_))));
}

#[tokio::test]
async fn test_link_dead_before_install_triggers_reconnect() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let _worker = hang_or_echo(&broker);
    broker.sever_after_declare(true);
    let client = common::connected_client(&broker, "flaky").await;

    wait_for_state(&client, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;

    broker.sever_after_declare(false);

    // Sessions severed at declare never count as live, so this only holds
    // once a healthy session is installed.
    common::wait_until("healthy session", || {
        client.is_connected() && broker.connection_count() == 1
    })
    .await;
    assert_eq!(client.predict("alive").await.unwrap(), echo_spans("alive"));
}
