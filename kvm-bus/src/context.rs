use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::graph::Backend;

/// Called when hardware state can no longer be trusted (stuck teardown,
/// undeliverable control event). Must not return in production.
pub type FatalHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Granularity for waits that poll the native graph
    pub poll_interval: Duration,
    /// Capture/controller teardown bound
    pub stop: Duration,
    /// Encoder teardown bound
    pub encoder_stop: Duration,
    /// Bound for reaching paused/playing after start
    pub startup: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stop: Duration::from_secs(15),
            encoder_stop: Duration::from_secs(30),
            startup: Duration::from_secs(15),
        }
    }
}

/// Shared by every component built against one backend. Hands out the
/// component ids used in log prefixes.
pub struct MediaContext {
    backend: Arc<dyn Backend>,
    next_id: AtomicU64,
    timeouts: Timeouts,
    fatal: FatalHook,
}

impl MediaContext {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            next_id: AtomicU64::new(0),
            timeouts: Timeouts::default(),
            fatal: Arc::new(abort_process),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal = hook;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn fatal(&self, msg: &str) {
        (self.fatal)(msg)
    }
}

fn abort_process(msg: &str) {
    log::error!("fatal: {}", msg);
    std::process::abort();
}
