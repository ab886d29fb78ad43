//! Operator configuration

use std::time::Duration;

use gargantua_common::DEFAULT_NAMESPACE;
use gargantua_provisioner::DEFAULT_POLL_INTERVAL;
use gargantua_scheduler::DEFAULT_DYNAMIC_BIND_ATTEMPTS;

/// Full resync period when none is configured
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(30 * 60);

/// Settings threaded into every informer and reconciler at construction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace for every read and write
    pub namespace: String,
    /// Informer resync period, `None` to disable
    pub resync: Option<Duration>,
    /// `spec.attempts` written on new DynamicBindRequests
    pub dynamic_bind_attempts: i32,
    /// Requeue interval while a VM waits on Terraform
    pub provision_poll_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            resync: Some(DEFAULT_RESYNC),
            dynamic_bind_attempts: DEFAULT_DYNAMIC_BIND_ATTEMPTS,
            provision_poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl OperatorConfig {
    /// Configuration for `namespace` with every other setting defaulted
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }
}
