//! The worker loop that drives a [`Reconciler`] from a [`WorkQueue`]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gargantua_common::metrics::ReconcileTimer;
use gargantua_common::names::split_key;
use gargantua_common::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::queue::WorkQueue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Requeue {
    None,
    After(Duration),
    Backoff,
}

/// What to do with a key after a reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue: Requeue,
}

impl Action {
    /// Done; wait for the next change
    pub fn await_change() -> Self {
        Self {
            requeue: Requeue::None,
        }
    }

    /// Reconcile again after `duration`
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue: Requeue::After(duration),
        }
    }

    /// Reconcile again after the key's rate-limited backoff
    pub fn requeue_with_backoff() -> Self {
        Self {
            requeue: Requeue::Backoff,
        }
    }

    /// Fixed requeue delay, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        match self.requeue {
            Requeue::After(d) => Some(d),
            _ => None,
        }
    }

    /// True for [`Action::requeue_with_backoff`]
    pub fn is_backoff(&self) -> bool {
        self.requeue == Requeue::Backoff
    }
}

/// Level-triggered reconcile logic for one resource kind
///
/// `reconcile` receives only the object name and must re-read everything it
/// needs; it may run any number of times for the same state.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name for logs, metrics and the queue
    fn name(&self) -> &'static str;

    /// Drive the named object toward its desired state
    async fn reconcile(&self, name: &str) -> Result<Action>;

    /// Decide what happens to a key whose pass failed
    fn error_policy(&self, name: &str, error: &Error) -> Action {
        let _ = (name, error);
        Action::requeue_with_backoff()
    }
}

/// One queue, one worker, one reconciler
pub struct Controller<R> {
    reconciler: Arc<R>,
    queue: WorkQueue,
}

impl<R: Reconciler> Controller<R> {
    /// Controller over an existing queue
    pub fn new(reconciler: Arc<R>, queue: WorkQueue) -> Self {
        Self { reconciler, queue }
    }

    /// The queue this controller drains
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Run one queue item; `false` once the queue is shut down
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.process(&key).await;
        self.queue.done(&key);
        true
    }

    #[instrument(skip(self), fields(controller = self.reconciler.name()))]
    async fn process(&self, key: &str) {
        let (_, name) = split_key(key);
        let timer = ReconcileTimer::start(self.reconciler.name());

        match self.reconciler.reconcile(name).await {
            Ok(action) => {
                timer.success();
                match action.requeue {
                    Requeue::None => self.queue.forget(key),
                    Requeue::After(delay) => {
                        self.queue.forget(key);
                        debug!(delay_ms = delay.as_millis(), "requeue");
                        self.queue.add_after(key, delay);
                    }
                    Requeue::Backoff => self.queue.add_rate_limited(key),
                }
            }
            Err(e) => {
                timer.error(e.is_retryable());
                if e.is_conflict() {
                    // Lost a write race; the next pass reads fresh state
                    warn!(error = %e, "reconcile conflicted");
                } else {
                    error!(error = %e, "reconcile failed");
                }
                match self.reconciler.error_policy(name, &e).requeue {
                    Requeue::None => self.queue.forget(key),
                    Requeue::After(delay) => self.queue.add_after(key, delay),
                    Requeue::Backoff => self.queue.add_rate_limited(key),
                }
            }
        }
    }

    /// Drain the queue until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let name = self.reconciler.name();
        info!(controller = name, "starting controller");

        let queue = self.queue.clone();
        let stopper = tokio::spawn(async move {
            shutdown.cancelled().await;
            queue.shutdown();
        });

        while self.process_next().await {}

        stopper.abort();
        info!(controller = name, "controller stopped");
    }
}
