//! Disconnect and reconnect behavior

mod common;

use common::*;
use objlink::LinkError;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

/// After a simulated server restart, every previously-created proxy
/// re-sends its Init and resumes traffic without caller intervention.
#[tokio::test]
async fn test_reconnect_reregisters_proxies() {
    init_logging();
    let server = start_test_server().await;
    let addr = server.addr;

    let client = connect_client(addr).await;
    let relay = client
        .create_node("Relay1", "RelayInterface", vec![])
        .await
        .unwrap();
    let echo = client
        .create_node("Echo1", "EchoDevice", vec![])
        .await
        .unwrap();
    assert_eq!(relay.get("State").await.unwrap(), json!("Open"));

    // Kill the server; the client observes the drop.
    server.stop().await;
    let mut link = client.connection_watch();
    timeout(Duration::from_secs(5), async {
        while *link.borrow_and_update() {
            link.changed().await.unwrap();
        }
    })
    .await
    .expect("client did not observe disconnect");

    // A fresh server instance on the same port starts with an empty
    // registry; the client must rebuild it on its own.
    let server = start_test_server_at(addr).await;
    timeout(Duration::from_secs(5), client.wait_connected())
        .await
        .expect("client did not reconnect");

    assert!(server.server.nodes().contains("Relay1"));
    assert!(server.server.nodes().contains("Echo1"));

    assert_eq!(relay.get("State").await.unwrap(), json!("Open"));
    assert_eq!(
        echo.call("Echo", vec![json!("back")]).await.unwrap(),
        json!("back")
    );

    client.shutdown();
    server.stop().await;
}

/// A query in flight when the link drops fails fast instead of waiting
/// out its timeout.
#[tokio::test]
async fn test_pending_query_fails_on_disconnect() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let slow = client
        .create_node("Slow1", "SlowDevice", vec![])
        .await
        .unwrap();

    let pending = tokio::spawn(async move { slow.call("Stall", vec![]).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    server.stop().await;

    let err = timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending query did not unblock")
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        LinkError::ConnectionClosed | LinkError::QueryTimeout { .. }
    ));

    client.shutdown();
}

/// Proxies created while the link is down initialize on first connect.
#[tokio::test]
async fn test_offline_created_proxy_initializes_on_connect() {
    init_logging();

    // Reserve an address, then start the client against it while nothing
    // is listening.
    let probe = start_test_server().await;
    let addr = probe.addr;
    probe.stop().await;

    let client = objlink::LinkEngine::connect(
        objlink::LinkConfig::new(addr, SECRET)
            .reconnect_interval(Duration::from_millis(100))
            .query_timeout(Duration::from_secs(2)),
    );
    let relay = client
        .create_node("Relay1", "RelayInterface", vec![])
        .await
        .unwrap();
    assert!(!client.is_connected());

    let server = start_test_server_at(addr).await;
    timeout(Duration::from_secs(5), client.wait_connected())
        .await
        .expect("client did not connect");

    assert!(server.server.nodes().contains("Relay1"));
    assert_eq!(relay.get("State").await.unwrap(), json!("Open"));

    client.shutdown();
    server.stop().await;
}
