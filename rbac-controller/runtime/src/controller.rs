use crate::queue::WorkQueue;
use kubert::lease::Claim;
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::{info_span, Instrument};

/// Reconciles the object identified by a queue key.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &str) -> anyhow::Result<Action>;
}

/// What to do with a key after a successful reconciliation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Done,
    Requeue,
    RequeueAfter(time::Duration),
}

/// Drives a [`Reconcile`] implementation from a [`WorkQueue`] with a fixed
/// pool of workers.
///
/// Only the holder of the lease reconciles. Other replicas put keys back
/// until the lease could have changed hands.
pub struct Controller<R> {
    name: &'static str,
    reconciler: Arc<R>,
    queue: WorkQueue,
    workers: usize,
    leadership: Leadership,
}

#[derive(Clone, Debug)]
pub struct Leadership {
    claims: watch::Receiver<Arc<Claim>>,
    hostname: Arc<str>,
    lease_duration: time::Duration,
}

// === impl Controller ===

impl<R: Reconcile> Controller<R> {
    pub fn new(
        name: &'static str,
        reconciler: R,
        queue: WorkQueue,
        workers: usize,
        leadership: Leadership,
    ) -> Self {
        Self {
            name,
            reconciler: Arc::new(reconciler),
            queue,
            workers: workers.max(1),
            leadership,
        }
    }

    /// Runs workers until `shutdown` is signaled. In-flight reconciliations
    /// complete before this returns.
    pub async fn run(self, shutdown: drain::Watch) {
        let Self {
            name,
            reconciler,
            queue,
            workers,
            leadership,
        } = self;

        tracing::info!(workers, "Starting controller");
        let workers = (0..workers)
            .map(|id| {
                tokio::spawn(
                    work(queue.clone(), reconciler.clone(), leadership.clone())
                        .instrument(info_span!("worker", controller = name, id)),
                )
            })
            .collect::<Vec<_>>();

        let release = shutdown.signaled().await;
        tracing::debug!("Shutting down");
        queue.shut_down();
        for worker in workers {
            if let Err(error) = worker.await {
                tracing::error!(%error, "Worker failed");
            }
        }
        drop(release);
    }
}

async fn work<R: Reconcile>(queue: WorkQueue, reconciler: Arc<R>, leadership: Leadership) {
    while let Some(key) = queue.get().await {
        if !leadership.is_leader() {
            tracing::trace!(%key, "Not the leader; deferring");
            queue.done(&key);
            queue.add_after(key, leadership.lease_duration);
            continue;
        }

        match reconciler.reconcile(&key).await {
            Ok(Action::Done) => queue.forget(&key),
            Ok(Action::Requeue) => {
                queue.forget(&key);
                queue.add(key.clone());
            }
            Ok(Action::RequeueAfter(delay)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            Err(error) => {
                tracing::warn!(%key, error = %format_args!("{error:#}"), "Reconciliation failed");
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
}

// === impl Leadership ===

impl Leadership {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        hostname: impl Into<Arc<str>>,
        lease_duration: time::Duration,
    ) -> Self {
        Self {
            claims,
            hostname: hostname.into(),
            lease_duration,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.hostname)
    }
}
