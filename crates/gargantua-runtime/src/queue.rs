//! Deduplicating work queue with delayed and rate-limited re-adds
//!
//! Semantics follow the client-go work queue:
//! - a key waits in the queue at most once, however often it is added
//! - a key handed out by [`WorkQueue::get`] is not handed out again until
//!   [`WorkQueue::done`]; re-adds in the meantime are parked and replayed by
//!   `done`
//! - after [`WorkQueue::shutdown`], `get` returns `None` and adds are ignored

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use gargantua_common::metrics;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::rate_limit::RateLimiter;

/// Re-add delay used by queues without a rate limiter
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    waiting: HashMap<String, Instant>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: Option<RateLimiter>,
}

/// Cloneable handle to a shared work queue of `namespace/name` keys
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Delaying queue: dedup plus timed re-adds
    pub fn delaying(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Rate-limiting queue: a delaying queue plus per-key backoff
    pub fn rate_limited(name: impl Into<String>, limiter: RateLimiter) -> Self {
        Self::build(name.into(), Some(limiter))
    }

    fn build(name: String, limiter: Option<RateLimiter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                limiter,
            }),
        }
    }

    /// Queue name, used in logs and metrics
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue `key` unless it is already waiting
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let depth = {
            let mut state = self.inner.state.lock();
            if state.shutting_down || !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                // Replayed by done()
                return;
            }
            state.queue.push_back(key);
            state.queue.len()
        };
        metrics::record_queue_add(&self.inner.name);
        metrics::set_queue_depth(&self.inner.name, depth);
        self.inner.notify.notify_one();
    }

    /// Enqueue `key` once `delay` has passed
    ///
    /// A key already waiting with an earlier deadline keeps that deadline.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&key) {
                Some(existing) if *existing <= ready_at => return,
                _ => {
                    state.waiting.insert(key.clone(), ready_at);
                }
            }
        }

        trace!(queue = %self.inner.name, key = %key, delay_ms = delay.as_millis(), "delayed add");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            let due = {
                let mut state = queue.inner.state.lock();
                match state.waiting.get(&key) {
                    Some(at) if *at == ready_at => {
                        state.waiting.remove(&key);
                        true
                    }
                    // Superseded by an earlier deadline
                    _ => false,
                }
            };
            if due {
                queue.add(key);
            }
        });
    }

    /// Enqueue `key` after its rate-limited backoff
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = match &self.inner.limiter {
            Some(limiter) => limiter.when(&key),
            None => DEFAULT_RETRY_DELAY,
        };
        self.add_after(key, delay);
    }

    /// Clear the backoff history of `key`
    pub fn forget(&self, key: &str) {
        if let Some(limiter) = &self.inner.limiter {
            limiter.forget(key);
        }
    }

    /// Rate-limited re-adds of `key` since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner
            .limiter
            .as_ref()
            .map(|l| l.retries(key))
            .unwrap_or(0)
    }

    /// Wait for the next key; `None` once the queue is shut down
    ///
    /// The returned key must be handed back through [`WorkQueue::done`].
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    metrics::set_queue_depth(&self.inner.name, state.queue.len());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` finished; replays it if it was re-added while processing
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.notify.notify_waiters();
    }

    /// True after [`WorkQueue::shutdown`]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// True when no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
