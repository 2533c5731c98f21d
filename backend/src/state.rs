//! Application state management.

use crate::config::RuntimeOptions;
use crate::dispatch::{ResourceRegistry, ToolRegistry};
use crate::session::SessionManager;
use crate::store::{EventStore, InMemoryEventStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Request counters exposed through the metrics tool and resource.
#[derive(Default)]
pub struct Metrics {
    requests: AtomicU64,
    errors: AtomicU64,
}

impl Metrics {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Session manager owning all live sessions
    sessions: SessionManager,
    /// Event store backing resumable delivery
    store: Arc<dyn EventStore>,
    /// Tool registration table, immutable after startup
    tools: ToolRegistry,
    /// Resource registration table, immutable after startup
    resources: ResourceRegistry,
    /// Request counters
    metrics: Metrics,
    /// Config-derived runtime options
    options: RuntimeOptions,
}

impl AppState {
    /// Create state with the default in-memory event store.
    pub fn new(tools: ToolRegistry, resources: ResourceRegistry, options: RuntimeOptions) -> Self {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new(options.retention));
        Self::with_store(store, tools, resources, options)
    }

    /// Create state with a custom event store backend.
    pub fn with_store(
        store: Arc<dyn EventStore>,
        tools: ToolRegistry,
        resources: ResourceRegistry,
        options: RuntimeOptions,
    ) -> Self {
        let sessions = SessionManager::new(store.clone());
        Self {
            inner: Arc::new(AppStateInner {
                sessions,
                store,
                tools,
                resources,
                metrics: Metrics::default(),
                options,
            }),
        }
    }

    /// Get the session manager.
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Get the event store.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    /// Get the tool registry.
    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    /// Get the resource registry.
    pub fn resources(&self) -> &ResourceRegistry {
        &self.inner.resources
    }

    /// Get the request counters.
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Get the runtime options.
    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }
}
