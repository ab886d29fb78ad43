//! Terraform provisioning for Gargantua VirtualMachines
//!
//! [`VmProvisioner`] turns a `readyforprovisioning` VM into a Terraform
//! `State` plus the ConfigMap and Secret it reads, waits for the Terraform
//! controller's `Execution` to report addresses, and tears the State down
//! when the VM is deleted.

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod keypair;
pub mod outputs;

pub use controller::{VmProvisioner, DEFAULT_POLL_INTERVAL};
