//! Ticket correlation under concurrency

mod common;

use common::*;
use futures::future::join_all;
use objlink::LinkError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

/// N concurrent queries on one connection: each caller gets exactly its
/// own reply, never a neighbour's.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_queries_do_not_cross_talk() {
    init_logging();

    const CALLERS: usize = 50;

    let server = start_test_server().await;
    let client = connect_client(server.addr).await;
    let echo = client
        .create_node("Echo1", "EchoDevice", vec![])
        .await
        .unwrap();

    let barrier = Arc::new(Barrier::new(CALLERS));
    let mut handles = Vec::new();

    for i in 0..CALLERS {
        let echo = echo.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let reply = echo.call("Echo", vec![json!(i)]).await.unwrap();
            assert_eq!(reply, json!(i), "caller {} observed a foreign reply", i);
        }));
    }

    for result in join_all(handles).await {
        result.unwrap();
    }

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_query_timeout_releases_ticket() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let slow = client
        .create_node("Slow1", "SlowDevice", vec![])
        .await
        .unwrap();

    let err = slow.call("Stall", vec![]).await.unwrap_err();
    assert!(matches!(err, LinkError::QueryTimeout { .. }));

    // The abandoned ticket was released; fresh calls still correlate.
    let echo = client
        .create_node("Echo1", "EchoDevice", vec![])
        .await
        .unwrap();
    assert_eq!(
        echo.call("Echo", vec![json!("after")]).await.unwrap(),
        json!("after")
    );

    client.shutdown();
    server.stop().await;
}

/// Sequential calls keep correlating after earlier tickets are consumed;
/// no reply is ever attributed to a retired id.
#[tokio::test]
async fn test_sequential_queries_correlate() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let echo = client
        .create_node("Echo1", "EchoDevice", vec![])
        .await
        .unwrap();

    for i in 1..10 {
        assert_eq!(
            echo.call("Echo", vec![json!(i)]).await.unwrap(),
            json!(i)
        );
    }

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_queries_from_two_clients_are_independent() {
    init_logging();
    let server = start_test_server().await;
    let client_a = connect_client(server.addr).await;
    let client_b = connect_client(server.addr).await;

    let echo_a = client_a
        .create_node("Echo1", "EchoDevice", vec![])
        .await
        .unwrap();
    let echo_b = client_b
        .create_node("Echo1", "EchoDevice", vec![])
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        echo_a.call("Echo", vec![json!("from a")]),
        echo_b.call("Echo", vec![json!("from b")]),
    );
    assert_eq!(a.unwrap(), json!("from a"));
    assert_eq!(b.unwrap(), json!("from b"));

    client_a.shutdown();
    client_b.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_slow_handler_does_not_stall_other_queries() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let slow = client
        .create_node("Slow1", "SlowDevice", vec![])
        .await
        .unwrap();
    let echo = client
        .create_node("Echo1", "EchoDevice", vec![])
        .await
        .unwrap();

    // Start a stalled call, then verify another alias answers promptly.
    let stalled = tokio::spawn(async move { slow.call("Stall", vec![]).await });

    let started = std::time::Instant::now();
    assert_eq!(
        echo.call("Echo", vec![json!("quick")]).await.unwrap(),
        json!("quick")
    );
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "echo query was stalled behind the slow handler"
    );

    assert!(stalled.await.unwrap().is_err());

    client.shutdown();
    server.stop().await;
}
