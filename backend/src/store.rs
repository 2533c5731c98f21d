//! Append-only per-session event log with bounded retention.
//!
//! The event store is the source of truth for resumable delivery: every
//! outbound message is appended here before it is broadcast, and a
//! reconnecting client replays from its last seen sequence. Sequence
//! numbers are session-scoped, strictly increasing and gapless, assigned
//! under a per-session lock so concurrent producers can never observe a
//! duplicate or a hole.

use async_trait::async_trait;
use serde_json::Value;
use sluss_types::{EventKind, StreamEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Error type for event store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A finite replay of a session's event log.
#[derive(Debug, Clone)]
pub struct Replay {
    /// Retained events with sequence greater than the requested cursor,
    /// in emission order.
    pub events: Vec<StreamEvent>,
    /// Set when the cursor predates retained history. Carries the oldest
    /// sequence still retained; everything before it is gone and the
    /// client must be told explicitly.
    pub truncated: Option<u64>,
}

/// Capability interface for event persistence.
///
/// The in-memory implementation below is the default; a durable backing
/// store can be substituted without touching the dispatcher or endpoint.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Register a session. Appends to unregistered sessions fail.
    async fn register_session(&self, session_id: &str);

    /// Append an event, assigning the session's next sequence number.
    /// Returns the stored event.
    async fn append(
        &self,
        session_id: &str,
        kind: EventKind,
        related_request_id: Option<Value>,
        payload: Value,
    ) -> Result<StreamEvent>;

    /// Replay retained events with sequence greater than `after_sequence`.
    async fn replay_from(&self, session_id: &str, after_sequence: u64) -> Result<Replay>;

    /// Drop a session's log. Idempotent.
    async fn drop_session(&self, session_id: &str);
}

struct SessionLog {
    /// Next sequence to assign; sequences start at 1.
    next_sequence: u64,
    /// Highest sequence evicted by the retention bound, 0 if none.
    evicted_through: u64,
    events: VecDeque<StreamEvent>,
}

impl SessionLog {
    fn new() -> Self {
        Self {
            next_sequence: 1,
            evicted_through: 0,
            events: VecDeque::new(),
        }
    }
}

/// In-memory event store with a per-session retention bound.
pub struct InMemoryEventStore {
    /// Maximum events retained per session; oldest evicted beyond this.
    retention: usize,
    logs: Mutex<HashMap<String, Arc<Mutex<SessionLog>>>>,
}

impl InMemoryEventStore {
    /// Create a store retaining at most `retention` events per session.
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            logs: Mutex::new(HashMap::new()),
        }
    }

    async fn log_for(&self, session_id: &str) -> Result<Arc<Mutex<SessionLog>>> {
        let logs = self.logs.lock().await;
        logs.get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn register_session(&self, session_id: &str) {
        let mut logs = self.logs.lock().await;
        logs.entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionLog::new())));
    }

    async fn append(
        &self,
        session_id: &str,
        kind: EventKind,
        related_request_id: Option<Value>,
        payload: Value,
    ) -> Result<StreamEvent> {
        let log = self.log_for(session_id).await?;
        let mut log = log.lock().await;

        let event = StreamEvent {
            sequence: log.next_sequence,
            related_request_id,
            kind,
            payload,
        };
        log.next_sequence += 1;
        log.events.push_back(event.clone());

        while log.events.len() > self.retention {
            if let Some(evicted) = log.events.pop_front() {
                log.evicted_through = evicted.sequence;
            }
        }

        debug!(
            "Appended event {} to session {} ({:?})",
            event.sequence, session_id, event.kind
        );
        Ok(event)
    }

    async fn replay_from(&self, session_id: &str, after_sequence: u64) -> Result<Replay> {
        let log = self.log_for(session_id).await?;
        let log = log.lock().await;

        let truncated = if after_sequence < log.evicted_through {
            Some(log.evicted_through + 1)
        } else {
            None
        };

        let events = log
            .events
            .iter()
            .filter(|e| e.sequence > after_sequence)
            .cloned()
            .collect();

        Ok(Replay { events, truncated })
    }

    async fn drop_session(&self, session_id: &str) {
        let mut logs = self.logs.lock().await;
        if logs.remove(session_id).is_some() {
            debug!("Dropped event log for session {}", session_id);
        }
    }
}
