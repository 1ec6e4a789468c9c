// Minimal in-process hub: serves a mutable entity table, records service
// calls, and can push `state_changed` events or drop its connections.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

use homesync_api::{ClientConfig, HubClient, ReconnectConfig};

const TOKEN: &str = "core-test-token";

#[derive(Debug, Clone)]
enum Control {
    Event(Value),
    Drop,
}

#[derive(Clone, Default)]
struct Shared {
    entities: Arc<Mutex<BTreeMap<String, String>>>,
    calls: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    event_subscriptions: Arc<AtomicUsize>,
    /// Change announced just before the next `get_states` reply, which
    /// still carries the old table.
    staged: Arc<Mutex<Option<(String, String)>>>,
}

pub struct MockHub {
    url: String,
    control: broadcast::Sender<Control>,
    shared: Shared,
}

impl MockHub {
    pub async fn start(entities: &[(&str, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/api/websocket", listener.local_addr().unwrap());
        let (control, _) = broadcast::channel(32);
        let shared = Shared::default();
        {
            let mut table = shared.entities.lock().unwrap();
            for (id, state) in entities {
                table.insert((*id).to_owned(), (*state).to_owned());
            }
        }

        let hub = Self {
            url,
            control: control.clone(),
            shared: shared.clone(),
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, control.subscribe(), shared.clone()));
            }
        });

        hub
    }

    pub async fn connected_client(&self) -> HubClient {
        let mut config = ClientConfig::new(self.url.parse().unwrap(), TOKEN.to_owned().into());
        config.request_timeout = Duration::from_secs(2);
        config.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            max_retries: None,
        };
        let client = HubClient::new(config);
        client.connect().await.unwrap();
        client
    }

    /// Change an entity in the table without notifying anyone.
    pub fn set_entity(&self, entity_id: &str, state: &str) {
        self.shared
            .entities
            .lock()
            .unwrap()
            .insert(entity_id.to_owned(), state.to_owned());
    }

    /// Change an entity and broadcast the matching `state_changed` event.
    pub fn change_entity(&self, entity_id: &str, state: &str) {
        let old = self
            .shared
            .entities
            .lock()
            .unwrap()
            .insert(entity_id.to_owned(), state.to_owned());
        let event = state_changed(entity_id, old.as_deref(), state);
        let _ = self.control.send(Control::Event(event));
    }

    /// Make the next `get_states` reply stale: a `state_changed` for
    /// `entity_id` is sent first, then the snapshot without it.
    pub fn stage_change_before_snapshot(&self, entity_id: &str, state: &str) {
        *self.shared.staged.lock().unwrap() = Some((entity_id.to_owned(), state.to_owned()));
    }

    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::Drop);
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Number of `subscribe_events` requests served, across connections.
    pub fn event_subscription_count(&self) -> usize {
        self.shared.event_subscriptions.load(Ordering::SeqCst)
    }

    pub fn service_calls(&self) -> Vec<Value> {
        self.shared.calls.lock().unwrap().clone()
    }
}

fn state_changed(entity_id: &str, old: Option<&str>, new: &str) -> Value {
    let snapshot = |s: &str| json!({ "entity_id": entity_id, "state": s });
    json!({
        "event_type": "state_changed",
        "data": {
            "entity_id": entity_id,
            "old_state": old.map_or(Value::Null, snapshot),
            "new_state": snapshot(new),
        }
    })
}

pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn serve(stream: TcpStream, mut control: broadcast::Receiver<Control>, shared: Shared) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    let send = |frame: Value| Message::text(frame.to_string());
    sink.send(send(json!({ "type": "auth_required" }))).await.unwrap();
    let Some(Ok(Message::Text(_auth))) = source.next().await else {
        return;
    };
    sink.send(send(json!({ "type": "auth_ok", "ha_version": "test" })))
        .await
        .unwrap();

    let mut event_id = None;
    loop {
        tokio::select! {
            ctl = control.recv() => match ctl {
                Ok(Control::Event(event)) => {
                    if let Some(id) = event_id {
                        let frame = json!({ "id": id, "type": "event", "event": event });
                        if sink.send(send(frame)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Control::Drop) | Err(_) => return,
            },
            frame = source.next() => {
                let Some(Ok(Message::Text(text))) = frame else { return };
                let request: Value = serde_json::from_str(text.as_str()).unwrap();
                let id = request["id"].as_u64().unwrap();
                let result = match request["type"].as_str() {
                    Some("get_states") => {
                        let staged = shared.staged.lock().unwrap().take();
                        if let (Some((entity_id, state)), Some(sub)) = (staged, event_id) {
                            let old = shared.entities.lock().unwrap().get(&entity_id).cloned();
                            let event = state_changed(&entity_id, old.as_deref(), &state);
                            let frame = json!({ "id": sub, "type": "event", "event": event });
                            if sink.send(send(frame)).await.is_err() {
                                return;
                            }
                        }
                        let table = shared.entities.lock().unwrap();
                        Value::Array(
                            table
                                .iter()
                                .map(|(id, state)| json!({ "entity_id": id, "state": state }))
                                .collect(),
                        )
                    }
                    Some("subscribe_events") => {
                        event_id = Some(id);
                        shared.event_subscriptions.fetch_add(1, Ordering::SeqCst);
                        Value::Null
                    }
                    Some("call_service") => {
                        shared.calls.lock().unwrap().push(request.clone());
                        Value::Null
                    }
                    _ => continue,
                };
                let reply = json!({ "id": id, "type": "result", "success": true, "result": result });
                if sink.send(send(reply)).await.is_err() {
                    return;
                }
            }
        }
    }
}
