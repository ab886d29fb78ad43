//! Gargantua operator wiring
//!
//! The binary parses its configuration into an [`OperatorConfig`] and hands
//! it, together with a store provider, to [`controller_runner::run`]. The
//! same entry point runs against `MemoryStore` in the scenario tests.

#![deny(missing_docs)]

pub mod config;
pub mod controller_runner;

pub use config::OperatorConfig;
