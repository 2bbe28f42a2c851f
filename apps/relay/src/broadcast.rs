//! Real-time event broadcaster.
//!
//! Fans completion events out to every connected WebSocket subscriber.
//! Delivery is best-effort: no backlog for late subscribers, no retries,
//! and a subscriber that falls behind skips the events it missed.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::config::Environment;
use crate::models::event::{CompletionEvent, ConnectedEvent};

/// Events buffered per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<CompletionEvent>,
    environment: Environment,
}

impl EventBroadcaster {
    pub fn new(environment: Environment) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, environment }
    }

    /// Sends `event` to every current subscriber. Never fails; returns how
    /// many subscribers it reached.
    pub fn publish(&self, event: CompletionEvent) -> usize {
        match self.tx.send(event) {
            Ok(count) => {
                debug!("Broadcast event to {count} subscribers");
                count
            }
            Err(_) => 0, // nobody listening
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.tx.subscribe()
    }

    /// Router for the real-time port. Any path upgrades to a WebSocket.
    pub fn router(self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .fallback(ws_handler)
            .with_state(self)
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broadcaster): State<EventBroadcaster>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_subscriber(socket, broadcaster))
}

async fn serve_subscriber(mut socket: WebSocket, broadcaster: EventBroadcaster) {
    let pid = std::process::id();
    let mut events = broadcaster.subscribe();

    let hello = ConnectedEvent::new(pid, broadcaster.environment);
    let Ok(hello) = serde_json::to_string(&hello) else {
        return;
    };
    if socket.send(Message::Text(hello)).await.is_err() {
        return;
    }
    info!(
        "Real-time subscriber connected ({} total)",
        broadcaster.subscriber_count()
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Real-time subscriber lagged, skipped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => info!("Worker {pid} - Received: {text}"),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("Real-time subscriber disconnected");
}
