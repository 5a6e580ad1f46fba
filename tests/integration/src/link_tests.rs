//! End-to-end link scenarios: init, dispatch, error propagation

mod common;

use common::*;
use objlink::{LinkError, Payload, CODE_CREATE_FAILED, CODE_MISSING_DEVICE};
use serde_json::json;

/// The canonical walkthrough: create a relay proxy, let the server build
/// the wrapper, read a non-invocable attribute through a query ticket.
#[tokio::test]
async fn test_relay_state_scenario() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let relay = client
        .create_node("Relay1", "RelayInterface", vec![])
        .await
        .unwrap();

    let state = relay.get("State").await.unwrap();
    assert_eq!(state, json!("Open"));

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_idempotent_init() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let relay = client
        .create_node("Relay1", "RelayInterface", vec![])
        .await
        .unwrap();

    // A second init for the same alias must ack without creating a second
    // registry entry or breaking routing.
    let mut raw = RawSession::connect_authenticated(server.addr).await;
    raw.send("Relay1~~{\"type\":\"RelayInterface\",\"args\":[]}")
        .await;
    let ack = raw.recv_envelope().await;
    assert!(matches!(ack.payload, Payload::InitAck { .. }));

    assert_eq!(server.server.nodes().len(), 1);
    assert_eq!(relay.get("State").await.unwrap(), json!("Open"));

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_alias_yields_missing_device() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let err = client.query("Ghost", "State", vec![]).await.unwrap_err();
    match err {
        LinkError::Remote { code, .. } => assert_eq!(code.as_deref(), Some(CODE_MISSING_DEVICE)),
        other => panic!("expected remote error, got {}", other),
    }
    assert!(server.server.nodes().is_empty());

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_construction_failure_reports_init_error() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let err = client
        .create_node("F1", "FlakyDevice", vec![])
        .await
        .unwrap_err();
    match err {
        LinkError::Remote {
            property,
            message,
            code,
        } => {
            assert_eq!(property, "init");
            assert!(message.contains("hardware absent"));
            assert_eq!(code.as_deref(), Some(CODE_CREATE_FAILED));
        }
        other => panic!("expected remote init error, got {}", other),
    }

    // The object was never registered; the alias still reads as missing.
    assert!(server.server.nodes().is_empty());
    let err = client.query("F1", "State", vec![]).await.unwrap_err();
    assert_eq!(err.code(), Some(CODE_MISSING_DEVICE));

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_type_reports_init_error() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let err = client
        .create_node("X1", "NoSuchType", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Remote { ref property, .. } if property == "init"));

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_method_invocation_roundtrip() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let relay = client
        .create_node("Relay1", "RelayInterface", vec![])
        .await
        .unwrap();

    let toggled = relay.call("Toggle", vec![]).await.unwrap();
    assert_eq!(toggled, json!("Closed"));
    assert_eq!(relay.get("State").await.unwrap(), json!("Closed"));

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_execution_failure_unblocks_caller() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let echo = client
        .create_node("Echo1", "EchoDevice", vec![])
        .await
        .unwrap();

    let err = echo.call("Fail", vec![]).await.unwrap_err();
    match err {
        LinkError::Remote { message, .. } => assert!(message.contains("deliberate failure")),
        other => panic!("expected remote error, got {}", other),
    }

    // The dispatcher survives and other calls keep working.
    assert_eq!(echo.call("Echo", vec![json!(7)]).await.unwrap(), json!(7));

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_property_is_an_error() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let relay = client
        .create_node("Relay1", "RelayInterface", vec![])
        .await
        .unwrap();

    assert!(matches!(
        relay.get("Voltage").await,
        Err(LinkError::Remote { .. })
    ));

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_update_cache_and_subscription() {
    init_logging();
    let server = start_test_server().await;
    let client = connect_client(server.addr).await;

    let relay = client
        .create_node("Relay1", "RelayInterface", vec![])
        .await
        .unwrap();
    let mut events = relay.subscribe();

    // Toggle pushes an unsolicited State update alongside the reply.
    relay.call("Toggle", vec![]).await.unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
        .await
        .expect("no update within 5s")
        .unwrap();
    match event {
        objlink::NodeEvent::Update {
            property, value, ..
        } => {
            assert_eq!(property, "State");
            assert_eq!(value, json!("Closed"));
        }
        other => panic!("expected update event, got {:?}", other),
    }
    assert_eq!(relay.cached("State"), Some(json!("Closed")));

    client.shutdown();
    server.stop().await;
}
