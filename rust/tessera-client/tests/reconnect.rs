//! Connection lifecycle: loss notifications, in-flight failure on
//! teardown, first-connection recovery, and cluster identity checks.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use support::MockNode;
use tessera_client::{Client, ClientConfig, ConnectError, ParamValue, Status};

const CLUSTER: (i64, i32) = (1_700_000_000_000, 1);

#[tokio::test]
async fn lost_connection_fails_in_flight_requests() {
    let node = MockNode::start(0, CLUSTER).await;
    let down_events = Arc::new(AtomicUsize::new(0));
    let down_counter = down_events.clone();

    let client = Client::new(
        ClientConfig::new()
            .disable_connection_mgmt()
            .on_connection_down(move |_, _| {
                down_counter.fetch_add(1, Ordering::SeqCst);
            }),
    );
    client.connect(&node.addr.to_string()).await.unwrap();
    support::settle(&client).await;

    let future = client.call_procedure("ArbitraryDurationProc", vec![ParamValue::I64(5000)]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    node.kill();

    let response = tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("in-flight request fails promptly")
        .expect("admitted");
    assert_eq!(response.status(), Status::ConnectionLost);
    assert_eq!(down_events.load(Ordering::SeqCst), 1);
    assert!(client.connected_hosts().is_empty());

    client.close().await;
}

#[tokio::test]
async fn client_recovers_after_node_restart() {
    let node = MockNode::start(0, CLUSTER).await;
    let addr = node.addr;

    let client = Client::new(
        ClientConfig::new()
            .reconnect_delay(Duration::from_millis(100))
            .reconnect_retry_delay(Duration::from_millis(200)),
    );
    client.connect(&addr.to_string()).await.unwrap();
    support::settle(&client).await;

    node.kill();
    drop(node);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.connected_hosts().is_empty());

    // Bring the node back on the same port; the recovery task retries
    // the historical connect set until it succeeds.
    let _node = MockNode::start_at(addr, 0, CLUSTER).await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.connected_hosts().is_empty() {
        assert!(Instant::now() < deadline, "client did not reconnect in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    support::settle(&client).await;
    let response = client
        .call_procedure("ArbitraryDurationProc", vec![ParamValue::I64(0)])
        .await
        .expect("admitted after recovery");
    assert_eq!(response.status(), Status::Success);

    client.close().await;
}

#[tokio::test]
async fn foreign_cluster_is_rejected() {
    let node_a = MockNode::start(0, CLUSTER).await;
    let node_b = MockNode::start(1, (999, 2)).await;

    let client = Client::new(ClientConfig::new().disable_connection_mgmt());
    client.connect(&node_a.addr.to_string()).await.unwrap();

    let err = client
        .connect(&node_b.addr.to_string())
        .await
        .expect_err("different cluster identity must be rejected");
    assert!(matches!(err, ConnectError::ClusterMismatch { .. }));
    assert_eq!(client.connected_hosts().len(), 1);

    client.close().await;
}

#[tokio::test]
async fn connect_with_retry_waits_for_the_node() {
    // Reserve a port, then release it so the first attempts fail.
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let client = Client::new(ClientConfig::new().connection_setup_timeout(Duration::from_secs(2)));
    let server = addr.to_string();

    let connector = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .connect_with_retry(&server, Duration::from_secs(5), Duration::from_millis(100))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(400)).await;
    let _node = MockNode::start_at(addr, 0, CLUSTER).await;

    connector
        .await
        .expect("task completes")
        .expect("connect eventually succeeds");
    assert_eq!(client.connected_hosts().len(), 1);

    client.close().await;
}
