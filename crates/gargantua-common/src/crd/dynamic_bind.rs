//! DynamicBindRequest and DynamicBindConfiguration: on-demand VM creation

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{restricted_value, CmsStruct, TemplateCounts};

/// Specification for a DynamicBindRequest
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "DynamicBindRequest",
    plural = "dynamicbindrequests",
    shortname = "dbr",
    status = "DynamicBindRequestStatus",
    namespaced,
    printcolumn = r#"{"name":"Claim","type":"string","jsonPath":".spec.vm_claim"}"#,
    printcolumn = r#"{"name":"Attempts","type":"integer","jsonPath":".status.current_attempts"}"#,
    printcolumn = r#"{"name":"Fulfilled","type":"boolean","jsonPath":".status.fulfilled"}"#,
    printcolumn = r#"{"name":"Expired","type":"boolean","jsonPath":".status.expired"}"#
)]
#[serde(default)]
pub struct DynamicBindRequestSpec {
    /// Claim the VMs are created for
    pub vm_claim: String,
    /// Placement attempts before the request expires
    pub attempts: i32,
}

/// Observed state of a DynamicBindRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct DynamicBindRequestStatus {
    /// Placement attempts made so far
    pub current_attempts: i32,
    /// Gave up: attempts exhausted
    pub expired: bool,
    /// VMs were created
    pub fulfilled: bool,
    /// Configuration whose quota the VMs count against
    pub dynamic_bind_configuration_id: String,
    /// Slot name → created VM
    pub virtual_machines_id: BTreeMap<String, String>,
}

impl DynamicBindRequestStatus {
    /// Fulfilled or expired; a terminal request never changes again
    pub fn is_terminal(&self) -> bool {
        self.fulfilled || self.expired
    }
}

impl DynamicBindRequest {
    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut DynamicBindRequestStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// Status or its default
    pub fn observed(&self) -> DynamicBindRequestStatus {
        self.status.clone().unwrap_or_default()
    }
}

/// Specification for a DynamicBindConfiguration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "DynamicBindConfiguration",
    plural = "dynamicbindconfigurations",
    shortname = "dbc",
    namespaced,
    printcolumn = r#"{"name":"Environment","type":"string","jsonPath":".spec.environment"}"#
)]
#[serde(default)]
pub struct DynamicBindConfigurationSpec {
    /// Environment on-demand VMs are created in
    pub environment: String,
    /// Prefix of generated VM names
    pub base_name: String,
    /// Raw quota for VMs created through this configuration
    pub burst_capacity: CmsStruct,
    /// Per-template quota for VMs created through this configuration
    pub burst_count_capacity: TemplateCounts,
    /// Whether only restricted claims may use this configuration
    pub restricted_bind: bool,
    /// Tenant value when `restricted_bind` is set
    pub restricted_bind_value: String,
}

impl DynamicBindConfiguration {
    /// Restricted-bind tenancy value, if any
    pub fn restricted_bind(&self) -> Option<&str> {
        restricted_value(self.spec.restricted_bind, &self.spec.restricted_bind_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let mut status = DynamicBindRequestStatus::default();
        assert!(!status.is_terminal());
        status.expired = true;
        assert!(status.is_terminal());
        status = DynamicBindRequestStatus {
            fulfilled: true,
            ..Default::default()
        };
        assert!(status.is_terminal());
    }

    #[test]
    fn test_request_wire_form() {
        let mut dbr = DynamicBindRequest::new(
            "claim-1-0a1b2c3d",
            DynamicBindRequestSpec {
                vm_claim: "claim-1".into(),
                attempts: 3,
            },
        );
        dbr.status_mut()
            .virtual_machines_id
            .insert("web".into(), "burst-00000001".into());
        let value = serde_json::to_value(&dbr).unwrap();
        assert_eq!(value["spec"]["vm_claim"], "claim-1");
        assert_eq!(value["status"]["virtual_machines_id"]["web"], "burst-00000001");
        assert_eq!(value["status"]["current_attempts"], 0);
    }
}
