//! Controller runtime for Gargantua
//!
//! The pieces every reconciler runs on:
//! - [`queue::WorkQueue`]: deduplicating, delaying, rate-limited work queue
//! - [`informer::Informer`]: one watch per kind feeding an indexed cache and
//!   typed event channels
//! - [`controller::Controller`]: the single worker that pulls keys and calls a
//!   [`controller::Reconciler`]
//! - [`dispatch`]: fan-in from informer events to queue keys

#![deny(missing_docs)]

pub mod controller;
pub mod dispatch;
pub mod informer;
pub mod queue;
pub mod rate_limit;

pub use controller::{Action, Controller, Reconciler};
pub use informer::{Cache, CachedStore, Informer, InformerEvent};
pub use queue::WorkQueue;
pub use rate_limit::RateLimiter;
