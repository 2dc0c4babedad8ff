// Clima Agent -- Application state

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::config::AgentConfig;
use crate::dispatcher::Dispatcher;

/// Shared across all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub dispatcher: Arc<Dispatcher>,
    pub start_time: Instant,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: Arc<AgentConfig>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("Agent marked as READY");
    }

    /// Readiness goes false for the rest of the process lifetime.
    pub fn mark_draining(&self) {
        self.ready.store(false, Ordering::Relaxed);
        tracing::info!("Agent draining, readiness withdrawn");
    }
}
