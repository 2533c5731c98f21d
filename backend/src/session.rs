//! Session management.
//!
//! A session groups the interactions of one logical client, starting at
//! the `initialize` handshake. Sessions are identified by
//! cryptographically random UUIDs carried in the `Mcp-Session-Id`
//! header, own their event log and notifier, and serialize dispatch so
//! at most one request is in flight per session at a time.

use crate::notify::SessionNotifier;
use crate::store::EventStore;
use serde_json::Value;
use sluss_types::StreamEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Guard held while a request is dispatched on a session. Dropping it
/// releases the session for the next request.
pub type DispatchPermit = OwnedMutexGuard<()>;

/// Key for the in-flight table; request ids are JSON values, rendered
/// canonically so `1` and `"1"` stay distinct.
fn request_key(id: &Value) -> String {
    id.to_string()
}

struct SessionInner {
    id: String,
    created_at: Instant,
    last_activity: RwLock<Instant>,
    notifier: SessionNotifier,
    dispatch_lock: Arc<Mutex<()>>,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
}

/// An MCP session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    fn new(store: Arc<dyn EventStore>) -> Self {
        let id = Uuid::new_v4().to_string();
        let notifier = SessionNotifier::new(id.clone(), store);
        Self {
            inner: Arc::new(SessionInner {
                id,
                created_at: Instant::now(),
                last_activity: RwLock::new(Instant::now()),
                notifier,
                dispatch_lock: Arc::new(Mutex::new(())),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Unique session identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Session age in seconds.
    pub fn age_secs(&self) -> u64 {
        self.inner.created_at.elapsed().as_secs()
    }

    /// Time since the session last saw a request.
    pub async fn idle(&self) -> Duration {
        self.inner.last_activity.read().await.elapsed()
    }

    /// Record client activity.
    pub async fn touch(&self) {
        *self.inner.last_activity.write().await = Instant::now();
    }

    /// The session's notifier.
    pub fn notifier(&self) -> &SessionNotifier {
        &self.inner.notifier
    }

    /// Subscribe to the session's live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.notifier.subscribe()
    }

    /// Wait for the dispatch permit (queue policy).
    pub async fn begin_dispatch(&self) -> DispatchPermit {
        self.inner.dispatch_lock.clone().lock_owned().await
    }

    /// Take the dispatch permit if free (reject policy).
    pub fn try_begin_dispatch(&self) -> Option<DispatchPermit> {
        self.inner.dispatch_lock.clone().try_lock_owned().ok()
    }

    /// Register a request as in flight and get its cancellation token.
    pub async fn begin_request(&self, request_id: &Value) -> CancellationToken {
        let token = CancellationToken::new();
        let mut in_flight = self.inner.in_flight.lock().await;
        in_flight.insert(request_key(request_id), token.clone());
        token
    }

    /// Remove a finished request from the in-flight table.
    pub async fn finish_request(&self, request_id: &Value) {
        let mut in_flight = self.inner.in_flight.lock().await;
        in_flight.remove(&request_key(request_id));
    }

    /// Cancel an in-flight request. Returns whether it was known.
    pub async fn cancel_request(&self, request_id: &Value) -> bool {
        let in_flight = self.inner.in_flight.lock().await;
        if let Some(token) = in_flight.get(&request_key(request_id)) {
            debug!(
                "Cancelling request {} on session {}",
                request_id,
                self.id()
            );
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Cancel everything in flight (session teardown).
    pub async fn cancel_all(&self) {
        let in_flight = self.inner.in_flight.lock().await;
        for token in in_flight.values() {
            token.cancel();
        }
    }
}

/// Manager for MCP sessions.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    store: Arc<dyn EventStore>,
}

impl SessionManager {
    /// Create a session manager backed by the given event store.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            store,
        }
    }

    /// Create a new session, register its event log, and return it.
    pub async fn create_session(&self) -> Session {
        let session = Session::new(self.store.clone());
        self.store.register_session(session.id()).await;
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id().to_string(), session.clone());
        info!("Created session: {}", session.id());
        session
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Check if a session exists.
    pub async fn session_exists(&self, id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.contains_key(id)
    }

    /// Terminate a session, cancelling in-flight work and dropping its
    /// event log.
    pub async fn terminate(&self, id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(id)
        };
        match removed {
            Some(session) => {
                session.cancel_all().await;
                self.store.drop_session(id).await;
                info!("Terminated session: {} (age: {}s)", id, session.age_secs());
                true
            }
            None => false,
        }
    }

    /// Number of active sessions.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Terminate sessions idle longer than `max_idle`. Returns how many
    /// were reaped.
    pub async fn cleanup_stale(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut stale = Vec::new();
            for (id, session) in sessions.iter() {
                if session.idle().await >= max_idle {
                    stale.push(id.clone());
                }
            }
            stale
        };

        let mut reaped = 0;
        for id in stale {
            info!("Reaping idle session: {}", id);
            if self.terminate(&id).await {
                reaped += 1;
            }
        }
        reaped
    }

    /// Spawn the background reaper loop.
    pub fn spawn_reaper(&self, idle_timeout: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let period = (idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = manager.cleanup_stale(idle_timeout).await;
                if reaped > 0 {
                    debug!("Reaper removed {} idle session(s)", reaped);
                }
            }
        })
    }
}
