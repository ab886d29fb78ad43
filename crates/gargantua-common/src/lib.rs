//! Common types for Gargantua: CRDs, the object store, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod labels;
pub mod metrics;
pub mod names;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace used for all reads and writes when `RELEASE_NAMESPACE` is unset
pub const DEFAULT_NAMESPACE: &str = "hobbyfarm";

/// API group of every Gargantua resource kind
pub const API_GROUP: &str = "hobbyfarm.io";

/// Finalizer the provisioner places on VMs whose Terraform state it owns
pub const PROVISIONER_FINALIZER: &str = "tfp.controllers.hobbyfarm.io";
