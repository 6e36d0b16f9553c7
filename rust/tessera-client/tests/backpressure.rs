//! Two-tier backpressure: the request warning/resume notifications and
//! the hard admission cap.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use support::MockNode;
use tessera_client::{CallError, Client, ClientConfig, ParamValue};

const CLUSTER: (i64, i32) = (1_700_000_000_000, 1);

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[tokio::test]
async fn warning_and_resume_fire_exactly_once_each() {
    const PROC_TIME: u64 = 2000;
    const TOTAL: usize = 20;
    const WARNING: usize = 15;
    const RESUME: usize = 5;

    let on_events = Arc::new(AtomicUsize::new(0));
    let off_events = Arc::new(AtomicUsize::new(0));
    let on_counter = on_events.clone();
    let off_counter = off_events.clone();

    let node = MockNode::start(0, CLUSTER).await;
    let client = Client::new(
        ClientConfig::new()
            .procedure_call_timeout(ms(PROC_TIME + 1000))
            .outstanding_txn_limit(5)
            .request_backpressure_levels(WARNING, RESUME)
            .on_request_backpressure(move |on| {
                if on {
                    on_counter.fetch_add(1, Ordering::SeqCst);
                } else {
                    off_counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
    );
    client.connect(&node.addr.to_string()).await.unwrap();
    support::settle(&client).await;

    // The first fourteen admissions stay under the warning level.
    let mut futures = Vec::new();
    for _ in 1..WARNING {
        futures.push(client.call_procedure("ArbitraryDurationProc", vec![ParamValue::I64(
            PROC_TIME as i64,
        )]));
    }
    assert_eq!(on_events.load(Ordering::SeqCst), 0);
    assert_eq!(off_events.load(Ordering::SeqCst), 0);

    // The fifteenth crosses the warning level: exactly one notification.
    for _ in WARNING..=TOTAL {
        futures.push(client.call_procedure("ArbitraryDurationProc", vec![ParamValue::I64(
            PROC_TIME as i64,
        )]));
    }
    assert_eq!(on_events.load(Ordering::SeqCst), 1);
    assert_eq!(off_events.load(Ordering::SeqCst), 0);

    // As requests drain below the resume level, exactly one `false`.
    let all = async {
        for future in futures {
            let _ = future.await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), all)
        .await
        .expect("all calls resolve");
    client.drain().await;

    assert_eq!(on_events.load(Ordering::SeqCst), 1);
    assert_eq!(off_events.load(Ordering::SeqCst), 1);

    client.close().await;
}

#[tokio::test]
async fn hard_cap_rejects_admission() {
    const PROC_TIME: i64 = 2000;
    const LIMIT: usize = 10;

    let node = MockNode::start(0, CLUSTER).await;
    let client = Client::new(
        ClientConfig::new()
            .procedure_call_timeout(ms(PROC_TIME as u64 + 1000))
            .outstanding_txn_limit(5)
            .request_limit(LIMIT),
    );
    client.connect(&node.addr.to_string()).await.unwrap();
    support::settle(&client).await;

    // These all queue fine.
    let mut futures = Vec::new();
    for _ in 0..LIMIT {
        futures.push(
            client.call_procedure("ArbitraryDurationProc", vec![ParamValue::I64(PROC_TIME)]),
        );
    }
    assert_eq!(client.current_request_count(), LIMIT);

    // The eleventh goes over the edge, synchronously.
    let over = client
        .call_procedure("ArbitraryDurationProc", vec![ParamValue::I64(PROC_TIME)])
        .await;
    match over {
        Err(CallError::RequestLimit { limit }) => assert_eq!(limit, LIMIT),
        other => panic!("expected request-limit error, got {other:?}"),
    }

    for future in futures {
        let _ = future.await;
    }
    client.drain().await;
    client.close().await;
}

#[tokio::test]
async fn outstanding_limit_resize_is_reported() {
    let node = MockNode::start(0, CLUSTER).await;
    let client = Client::new(ClientConfig::new().outstanding_txn_limit(8));
    client.connect(&node.addr.to_string()).await.unwrap();
    support::settle(&client).await;

    // Nothing in flight: grow and shrink take full effect.
    assert_eq!(client.set_outstanding_txn_limit(12), 12);
    assert_eq!(client.set_outstanding_txn_limit(3), 3);
    assert_eq!(client.outstanding_txn_count(), 0);

    client.close().await;
}
