use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::time;

/// The controller is considered unhealthy when no reconcile has completed for
/// this long.
const STALE_AFTER: time::Duration = time::Duration::from_secs(5 * 60);

/// Process-wide health and readiness state shared by the reconcilers.
#[derive(Debug)]
pub struct Health {
    ready: AtomicBool,
    healthy: AtomicBool,
    /// Unix timestamp, in seconds, of the last successful reconcile.
    last_reconcile: AtomicI64,
}

// === impl Health ===

impl Default for Health {
    fn default() -> Self {
        Self {
            ready: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            last_reconcile: AtomicI64::new(now()),
        }
    }
}

impl Health {
    pub fn set_ready(&self, ready: bool) {
        if self.ready.swap(ready, Ordering::AcqRel) != ready {
            tracing::info!(ready, "Readiness changed");
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        let was = self.healthy.swap(healthy, Ordering::AcqRel);
        if healthy {
            self.last_reconcile.store(now(), Ordering::Release);
        } else if was {
            tracing::info!("Marked unhealthy");
        }
    }

    pub fn record_reconcile(&self) {
        self.last_reconcile.store(now(), Ordering::Release);
        self.healthy.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        if !self.healthy.load(Ordering::Acquire) {
            return false;
        }
        let idle = now().saturating_sub(self.last_reconcile.load(Ordering::Acquire));
        idle <= STALE_AFTER.as_secs() as i64
    }

    #[cfg(test)]
    fn set_last_reconcile(&self, unix_secs: i64) {
        self.last_reconcile.store(unix_secs, Ordering::Release);
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
