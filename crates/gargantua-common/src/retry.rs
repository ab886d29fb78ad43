//! Conflict retries with exponential backoff and jitter.
//!
//! [`retry_on_conflict`] only retries optimistic concurrency conflicts and is
//! wrapped around every compare-and-swap write the controllers make. Other
//! failures go straight back to the caller, whose work queue owns backoff.
//!
//! # Example
//!
//! ```ignore
//! use gargantua_common::retry::{retry_on_conflict, RetryConfig};
//!
//! let vm = retry_on_conflict(&RetryConfig::conflict(), "mark_tainted", || async {
//!     let mut vm = store.get("pool-0a1b2c3d").await?;
//!     vm.status_mut().tainted = true;
//!     store.update_status(&vm).await
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::Result;

/// Backoff settings for a retry loop
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, at least one is always made
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Bounded config for compare-and-swap loops: five quick attempts
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 1.5,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Add jitter: 0.5x to 1.5x of the delay
fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Re-run a read-modify-write operation while it loses resource version races.
///
/// The operation must re-read the object on every call; retrying with a stale
/// copy would conflict forever. Any error other than a conflict is returned
/// immediately. After `max_attempts` conflicts the last conflict is returned.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    "Resource version conflict, retrying"
                );
                tokio::time::sleep(jittered(delay)).await;
                delay = config.next_delay(delay);
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        "Giving up after repeated conflicts"
                    );
                }
                return Err(e);
            }
        }
    }
}
