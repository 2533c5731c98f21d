//! Per-session notification stream.
//!
//! Bridges handlers (producers) and the transport (consumer): `emit`
//! appends the message to the event store, then broadcasts the stored
//! event to live subscribers. Both steps happen under a per-session
//! order lock, so broadcast order always equals sequence order even with
//! concurrent producers. Lagging subscribers are skipped; a client that
//! fell behind recovers through the store, not the channel.

use crate::store::{EventStore, Result};
use serde_json::Value;
use sluss_types::{event, EventKind, JsonRpcResponse, StreamEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Broadcast buffer per session. A slow SSE consumer beyond this lags
/// and falls back to replaying from the store.
const CHANNEL_CAPACITY: usize = 256;

/// Emits ordered, store-backed events for one session.
#[derive(Clone)]
pub struct SessionNotifier {
    session_id: String,
    store: Arc<dyn EventStore>,
    event_tx: broadcast::Sender<StreamEvent>,
    order: Arc<Mutex<()>>,
}

impl SessionNotifier {
    /// Create a notifier for a session already registered with the store.
    pub fn new(session_id: impl Into<String>, store: Arc<dyn EventStore>) -> Self {
        let (event_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            session_id: session_id.into(),
            store,
            event_tx,
            order: Arc::new(Mutex::new(())),
        }
    }

    /// Subscribe to live events.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.event_tx.subscribe()
    }

    /// Append a message to the store and broadcast it. Returns the
    /// assigned sequence number.
    pub async fn emit(
        &self,
        kind: EventKind,
        related_request_id: Option<Value>,
        payload: Value,
    ) -> Result<u64> {
        let _order = self.order.lock().await;
        let event = self
            .store
            .append(&self.session_id, kind, related_request_id, payload)
            .await?;
        let sequence = event.sequence;
        // No live subscribers is fine; the store has the event.
        let _ = self.event_tx.send(event);
        Ok(sequence)
    }

    /// Emit a `notifications/message` log notification.
    pub async fn log(
        &self,
        related_request_id: Option<Value>,
        level: &str,
        logger: Option<&str>,
        data: impl Into<Value>,
    ) -> Result<u64> {
        self.emit(
            EventKind::Log,
            related_request_id,
            event::log_message(level, logger, data),
        )
        .await
    }

    /// Emit a `notifications/progress` update.
    pub async fn progress(
        &self,
        related_request_id: Option<Value>,
        progress_token: &Value,
        progress: f64,
        total: Option<f64>,
        message: Option<&str>,
    ) -> Result<u64> {
        self.emit(
            EventKind::Progress,
            related_request_id,
            event::progress(progress_token, progress, total, message),
        )
        .await
    }

    /// Emit a `notifications/resources/updated` notification.
    pub async fn resource_updated(
        &self,
        related_request_id: Option<Value>,
        uri: &str,
    ) -> Result<u64> {
        self.emit(
            EventKind::Custom,
            related_request_id,
            event::resource_updated(uri),
        )
        .await
    }

    /// Record and broadcast the terminal response for a request.
    pub async fn response(
        &self,
        related_request_id: Option<Value>,
        response: &JsonRpcResponse,
    ) -> Result<u64> {
        self.emit(
            EventKind::Response,
            related_request_id,
            serde_json::to_value(response).unwrap_or_default(),
        )
        .await
    }
}
