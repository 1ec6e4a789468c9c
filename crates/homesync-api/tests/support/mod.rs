// Scripted in-process hub speaking the WebSocket protocol.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use homesync_api::{ClientConfig, ReconnectConfig};

pub const TOKEN: &str = "test-token";

#[derive(Debug, Clone)]
enum Control {
    Event(Value),
    Drop,
    Stall,
}

pub struct MockHub {
    url: Url,
    control: broadcast::Sender<Control>,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
}

impl MockHub {
    /// Start a hub that serves `states` from `get_states`.
    pub async fn start(states: Value) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (control, _) = broadcast::channel(16);
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let hub = Self {
            url: Url::parse(&format!("ws://{addr}/api/websocket")).unwrap(),
            control: control.clone(),
            received: Arc::clone(&received),
            connections: Arc::clone(&connections),
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                let control = control.subscribe();
                let received = Arc::clone(&received);
                let states = states.clone();
                tokio::spawn(serve(stream, states, control, received));
            }
        });

        hub
    }

    pub fn url(&self) -> Url {
        self.url.clone()
    }

    /// Client config with fast timeouts and backoff.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.url(), TOKEN.to_owned().into());
        config.request_timeout = Duration::from_secs(2);
        config.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            max_retries: None,
        };
        config
    }

    /// Push a `state_changed` event to every live connection.
    pub fn push_state_changed(&self, entity_id: &str, old: Option<&str>, new: Option<&str>) {
        let as_state = |s: Option<&str>| {
            s.map_or(Value::Null, |s| json!({ "entity_id": entity_id, "state": s }))
        };
        let event = json!({
            "event_type": "state_changed",
            "data": {
                "entity_id": entity_id,
                "old_state": as_state(old),
                "new_state": as_state(new),
            }
        });
        let _ = self.control.send(Control::Event(event));
    }

    /// Abruptly drop every live connection without a close frame.
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::Drop);
    }

    /// Stop reading from every live connection while keeping it open.
    pub fn stall(&self) {
        let _ = self.control.send(Control::Stall);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every request frame received so far, across connections.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_of_type(&self, kind: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn serve(
    stream: tokio::net::TcpStream,
    states: Value,
    mut control: broadcast::Receiver<Control>,
    received: Arc<Mutex<Vec<Value>>>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    let required = json!({ "type": "auth_required", "ha_version": "2026.1.0" });
    sink.send(Message::text(required.to_string())).await.unwrap();

    let Some(Ok(Message::Text(auth))) = source.next().await else {
        return;
    };
    let auth: Value = serde_json::from_str(auth.as_str()).unwrap();
    if auth["access_token"] != TOKEN {
        let invalid = json!({ "type": "auth_invalid", "message": "Invalid access token" });
        let _ = sink.send(Message::text(invalid.to_string())).await;
        let _ = sink.close().await;
        return;
    }
    let ok = json!({ "type": "auth_ok", "ha_version": "2026.1.0" });
    sink.send(Message::text(ok.to_string())).await.unwrap();

    let mut event_subscription: Option<u64> = None;

    loop {
        tokio::select! {
            ctl = control.recv() => match ctl {
                Ok(Control::Event(event)) => {
                    let Some(id) = event_subscription else { continue };
                    let frame = json!({ "id": id, "type": "event", "event": event });
                    if sink.send(Message::text(frame.to_string())).await.is_err() {
                        return;
                    }
                }
                Ok(Control::Drop) | Err(_) => return,
                Ok(Control::Stall) => {
                    // The socket stays open but is never read again.
                    std::future::pending::<()>().await;
                }
            },
            frame = source.next() => {
                let Some(Ok(Message::Text(text))) = frame else { return };
                let request: Value = serde_json::from_str(text.as_str()).unwrap();
                received.lock().unwrap().push(request.clone());

                let id = request["id"].as_u64().unwrap();
                let reply = match request["type"].as_str() {
                    Some("get_states") => Some(result(id, states.clone())),
                    Some("subscribe_events") => {
                        event_subscription = Some(id);
                        Some(result(id, Value::Null))
                    }
                    Some("call_service") => match request["service"].as_str() {
                        Some("hang") => None,
                        Some("explode") => Some(json!({
                            "id": id,
                            "type": "result",
                            "success": false,
                            "error": { "code": "service_not_found", "message": "Service not found" }
                        })),
                        _ => Some(result(id, json!({ "context": { "id": "ctx" } }))),
                    },
                    _ => None,
                };

                if let Some(reply) = reply {
                    if sink.send(Message::text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn result(id: u64, payload: Value) -> Value {
    json!({ "id": id, "type": "result", "success": true, "result": payload })
}
