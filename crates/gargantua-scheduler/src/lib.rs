//! Scheduling controllers for Gargantua
//!
//! - [`VmSetReconciler`] keeps pre-provisioned pools at their declared size
//! - [`VmClaimReconciler`] binds claims to free pool VMs, or asks for
//!   dynamic ones
//! - [`DynamicBindReconciler`] creates VMs on demand within burst quotas
//! - [`EnvironmentAccountant`] derives per-environment usage from the VM
//!   inventory

#![deny(missing_docs)]

pub mod dynamic_bind;
pub mod environment;
pub mod vmclaim;
pub mod vmset;

#[cfg(test)]
mod fixtures;

pub use dynamic_bind::DynamicBindReconciler;
pub use environment::EnvironmentAccountant;
pub use vmclaim::VmClaimReconciler;
pub use vmset::VmSetReconciler;

/// `spec.attempts` written on new DynamicBindRequests
pub const DEFAULT_DYNAMIC_BIND_ATTEMPTS: i32 = 5;
