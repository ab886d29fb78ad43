//! Label keys and conjunctive label selectors
//!
//! Labels are the secondary index every reconciler selects on. Each key here
//! has a single writer; see the reconciler that owns it before adding a new
//! writer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// `"true"` once a VM is tied to a claim
pub const BOUND: &str = "bound";
/// `"true"` once a VM is running and reachable
pub const READY: &str = "ready";
/// Template name a VM was built from
pub const TEMPLATE: &str = "template";
/// Environment a VM (or DynamicBindConfiguration) lives in
pub const ENVIRONMENT: &str = "environment";
/// VirtualMachineSet that owns a pooled VM
pub const VMSET: &str = "vmset";
/// `"true"` for VMs created on demand by a DynamicBindRequest
pub const DYNAMIC: &str = "dynamic";
/// DynamicBindRequest that created a VM
pub const DYNAMIC_BIND_REQUEST: &str = "dynamicbindrequest";
/// DynamicBindConfiguration whose quota a VM counts against
pub const DYNAMIC_BIND_CONFIGURATION: &str = "dynamicbindconfiguration";
/// Restricted-bind tenancy flag
pub const RESTRICTED_BIND: &str = "restrictedbind";
/// Restricted-bind tenancy value
pub const RESTRICTED_BIND_VALUE: &str = "restrictedbindvalue";
/// Marks a VM handled by a third-party provisioner
pub const PROVISIONER: &str = "provisioner";
/// Terraform State name on an Execution
pub const STATE: &str = "state";

/// Environment annotation naming who provisions its VMs
pub const PROVISIONER_ANNOTATION: &str = "provisioner";
/// Value of [`PROVISIONER_ANNOTATION`] that disables the built-in provisioner
pub const EXTERNAL_PROVISIONER: &str = "external";

/// Render a boolean the way label values store it
pub fn bool_value(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

/// Write the restricted-bind label pair for an optional tenancy value
pub fn set_restricted_bind(labels: &mut BTreeMap<String, String>, value: Option<&str>) {
    match value {
        Some(v) => {
            labels.insert(RESTRICTED_BIND.to_string(), bool_value(true));
            labels.insert(RESTRICTED_BIND_VALUE.to_string(), v.to_string());
        }
        None => {
            labels.insert(RESTRICTED_BIND.to_string(), bool_value(false));
            labels.remove(RESTRICTED_BIND_VALUE);
        }
    }
}

/// A conjunction of `key=value` terms
///
/// The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LabelSelector {
    terms: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector that matches every object
    pub fn everything() -> Self {
        Self::default()
    }

    /// Add a `key=value` term
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.insert(key.into(), value.into());
        self
    }

    /// Add a boolean `key=true|false` term
    pub fn with_bool(self, key: impl Into<String>, value: bool) -> Self {
        self.with(key, bool_value(value))
    }

    /// Add the restricted-bind tenancy terms
    ///
    /// A restricted claim only sees objects carrying its value; an
    /// unrestricted claim only sees unrestricted objects.
    pub fn restricted_bind(self, value: Option<&str>) -> Self {
        match value {
            Some(v) => self
                .with_bool(RESTRICTED_BIND, true)
                .with(RESTRICTED_BIND_VALUE, v),
            None => self.with_bool(RESTRICTED_BIND, false),
        }
    }

    /// True when every term is present with an equal value
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    /// Iterate the `(key, value)` terms in key order
    pub fn terms(&self) -> impl Iterator<Item = (&str, &str)> {
        self.terms.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True for the match-everything selector
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.terms {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut selector = Self::default();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = term
                .split_once('=')
                .ok_or_else(|| Error::validation(format!("selector term '{term}' is not key=value")))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::validation(format!("selector term '{term}' has no key")));
            }
            selector = selector.with(key, value.trim());
        }
        Ok(selector)
    }
}
