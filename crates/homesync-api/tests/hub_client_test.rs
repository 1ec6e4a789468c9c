// Integration tests for `HubClient` against an in-process mock hub.

#![allow(clippy::unwrap_used)]

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Map, json};

use homesync_api::{ConnectionState, Error, HubClient};
use support::{MockHub, eventually};

fn states() -> serde_json::Value {
    json!([
        { "entity_id": "input_boolean.tv_on", "state": "on" },
        { "entity_id": "input_number.alarm_time", "state": "6.5" }
    ])
}

async fn connected() -> (MockHub, HubClient) {
    let hub = MockHub::start(states()).await;
    let client = HubClient::new(hub.client_config());
    client.connect().await.unwrap();
    (hub, client)
}

// ── Handshake ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_authenticates_and_subscribes() {
    let (hub, client) = connected().await;

    assert!(client.is_connected());
    assert_eq!(*client.connection_state().borrow(), ConnectionState::Connected);

    let subs = hub.received_of_type("subscribe_events");
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0]["event_type"], "state_changed");

    client.disconnect().await;
}

#[tokio::test]
async fn test_invalid_token_is_authentication_error() {
    let hub = MockHub::start(states()).await;
    let mut config = hub.client_config();
    config.token = "wrong".to_owned().into();
    let client = HubClient::new(config);

    let err = client.connect().await.unwrap_err();
    assert!(err.is_auth(), "unexpected error: {err:?}");
    assert!(!client.is_connected());
    assert_eq!(
        *client.connection_state().borrow(),
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_second_connect_is_rejected() {
    let (hub, client) = connected().await;

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, Error::AlreadyConnected));
    assert_eq!(hub.connection_count(), 1);

    client.disconnect().await;
}

#[tokio::test]
async fn test_connect_to_closed_port_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = format!("ws://{addr}/api/websocket").parse().unwrap();
    let client = HubClient::new(homesync_api::ClientConfig::new(url, "t".to_owned().into()));
    let err = client.connect().await.unwrap_err();
    assert!(err.is_transient(), "unexpected error: {err:?}");
}

// ── Requests ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_states_and_get_state() {
    let (_hub, client) = connected().await;

    let all = client.get_states().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].entity_id, "input_boolean.tv_on");

    let alarm = client.get_state("input_number.alarm_time").await.unwrap();
    assert_eq!(alarm.state, "6.5");

    let err = client.get_state("light.nowhere").await.unwrap_err();
    assert_eq!(err.remote_code(), Some("not_found"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_request_ids_are_unique_and_increasing() {
    let (hub, client) = connected().await;

    let (a, b, c) = tokio::join!(client.get_states(), client.get_states(), client.get_states());
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let ids: Vec<u64> = hub
        .received()
        .iter()
        .map(|frame| frame["id"].as_u64().unwrap())
        .collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), ids.len());
    assert_eq!(client.pending_request_count(), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn test_helper_writes_send_service_calls() {
    let (hub, client) = connected().await;

    client.set_input_boolean("tv_on", false).await.unwrap();
    client.set_input_number("alarm_time", 7.25).await.unwrap();
    client.set_input_text("day_phase", "evening").await.unwrap();

    let calls = hub.received_of_type("call_service");
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0]["domain"], "input_boolean");
    assert_eq!(calls[0]["service"], "turn_off");
    assert_eq!(calls[0]["service_data"], json!({ "entity_id": "input_boolean.tv_on" }));
    assert_eq!(calls[1]["service"], "set_value");
    assert_eq!(
        calls[1]["service_data"],
        json!({ "entity_id": "input_number.alarm_time", "value": 7.25 })
    );
    assert_eq!(
        calls[2]["service_data"],
        json!({ "entity_id": "input_text.day_phase", "value": "evening" })
    );

    client.disconnect().await;
}

#[tokio::test]
async fn test_remote_failure_surfaces_code() {
    let (_hub, client) = connected().await;

    let err = client
        .call_service("script", "explode", Map::new())
        .await
        .unwrap_err();
    assert_eq!(err.remote_code(), Some("service_not_found"));
    assert_eq!(client.pending_request_count(), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn test_unanswered_request_times_out_and_is_forgotten() {
    let hub = MockHub::start(states()).await;
    let mut config = hub.client_config();
    config.request_timeout = Duration::from_millis(150);
    let client = HubClient::new(config);
    client.connect().await.unwrap();

    let err = client
        .call_service("script", "hang", Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "unexpected error: {err:?}");
    assert_eq!(client.pending_request_count(), 0);

    // The connection stays usable and the next request gets its own id.
    let states = client.get_states().await.unwrap();
    assert_eq!(states.len(), 2);
    assert!(client.is_connected());
    assert_eq!(client.pending_request_count(), 0);

    let hung = hub.received_of_type("call_service")[0]["id"].as_u64().unwrap();
    let fresh = hub.received_of_type("get_states")[0]["id"].as_u64().unwrap();
    assert!(fresh > hung, "expected a fresh id after {hung}, got {fresh}");

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_unblocks_in_flight_request() {
    let (_hub, client) = connected().await;

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.call_service("script", "hang", Map::new()).await })
    };
    assert!(eventually(|| client.pending_request_count() == 1).await);

    client.disconnect().await;
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Disconnected), "unexpected error: {err:?}");
    assert_eq!(client.pending_request_count(), 0);
}

// ── Events ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_state_changed_reaches_entity_subscribers() {
    let (hub, client) = connected().await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sub = {
        let seen = Arc::clone(&seen);
        client.subscribe_to_entity("input_boolean.tv_on", move |_, old, new| {
            seen.lock().unwrap().push((
                old.map(|s| s.state.clone()),
                new.map(|s| s.state.clone()),
            ));
        })
    };
    let other = Arc::new(AtomicUsize::new(0));
    let _other_sub = {
        let other = Arc::clone(&other);
        client.subscribe_to_entity("light.kitchen", move |_, _, _| {
            other.fetch_add(1, Ordering::SeqCst);
        })
    };

    hub.push_state_changed("input_boolean.tv_on", Some("on"), Some("off"));
    assert!(eventually(|| seen.lock().unwrap().len() == 1).await);
    assert_eq!(
        seen.lock().unwrap()[0],
        (Some("on".to_owned()), Some("off".to_owned()))
    );
    assert_eq!(other.load(Ordering::SeqCst), 0);

    assert!(sub.unsubscribe());
    hub.push_state_changed("input_boolean.tv_on", Some("off"), Some("on"));
    hub.push_state_changed("light.kitchen", None, Some("on"));
    assert!(eventually(|| other.load(Ordering::SeqCst) == 1).await);
    assert_eq!(seen.lock().unwrap().len(), 1);

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_clears_subscriptions() {
    let (_hub, client) = connected().await;

    let sub = client.subscribe_to_entity("input_boolean.tv_on", |_, _, _| {});
    assert_eq!(client.subscriber_count("input_boolean.tv_on"), 1);

    client.disconnect().await;
    assert_eq!(client.subscriber_count("input_boolean.tv_on"), 0);
    assert!(!sub.unsubscribe());
}

#[tokio::test]
async fn test_disconnect_is_bounded_when_hub_stops_reading() {
    let (hub, client) = connected().await;
    hub.stall();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Enough payload to fill the socket buffers so writes block.
    let blob = "x".repeat(256 * 1024);
    let writers: Vec<_> = (0..64)
        .map(|_| {
            let client = client.clone();
            let mut data = Map::new();
            data.insert("payload".into(), json!(blob));
            tokio::spawn(async move { client.call_service("script", "bulk", data).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(5), client.disconnect())
        .await
        .unwrap();
    assert!(!client.is_connected());

    for writer in writers {
        let outcome = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_err());
    }
    assert_eq!(client.pending_request_count(), 0);
}

// ── Reconnection ────────────────────────────────────────────────────

#[tokio::test]
async fn test_reconnects_after_transport_loss() {
    let (hub, client) = connected().await;
    let mut state = client.connection_state();

    client.subscribe_to_entity("input_boolean.tv_on", |_, _, _| {});
    hub.drop_connections();

    assert!(eventually(|| hub.connection_count() == 2).await);
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(hub.connection_count(), 2);
    assert_eq!(client.subscriber_count("input_boolean.tv_on"), 0);
    assert!(eventually(|| hub.received_of_type("subscribe_events").len() == 2).await);
    assert_eq!(client.get_states().await.unwrap().len(), 2);

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_suppresses_reconnection() {
    let (hub, client) = connected().await;
    client.disconnect().await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hub.connection_count(), 1);
    assert!(!client.is_connected());

    // connect() re-arms the client.
    client.connect().await.unwrap();
    assert_eq!(hub.connection_count(), 2);
    client.disconnect().await;
}
