//! Environment: a named pool of backing cloud capacity

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CapacityMode, CmsStruct, TemplateCounts};
use crate::labels::{EXTERNAL_PROVISIONER, PROVISIONER_ANNOTATION};

/// Template-mapping key holding the login user for a template's image
pub const SSH_USERNAME_KEY: &str = "ssh_username";

/// Specification for an Environment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "Environment",
    plural = "environments",
    status = "EnvironmentStatus",
    namespaced,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.capacity_mode"}"#,
    printcolumn = r#"{"name":"Burst","type":"boolean","jsonPath":".spec.burst_capable"}"#
)]
#[serde(default)]
pub struct EnvironmentSpec {
    /// Human readable name
    pub display_name: String,
    /// Cloud provider identifier (e.g., "aws", "vsphere")
    pub provider: String,
    /// DNS suffix appended to VM hostnames
    pub dns_suffix: String,
    /// Shell proxy endpoint copied onto every VM in this environment
    pub ws_endpoint: String,
    /// Per-template provisioning settings: template → key → value
    pub template_mapping: BTreeMap<String, BTreeMap<String, String>>,
    /// Settings applied to every VM provisioned here
    pub environment_specifics: BTreeMap<String, String>,
    /// Private /24 prefix → public /24 prefix
    pub ip_translation_map: BTreeMap<String, String>,
    /// How capacity is budgeted
    pub capacity_mode: CapacityMode,
    /// Declared raw capacity
    pub capacity: CmsStruct,
    /// Declared per-template capacity
    pub count_capacity: TemplateCounts,
    /// Whether on-demand VMs may be created here
    pub burst_capable: bool,
    /// Raw capacity reserved for on-demand VMs
    pub burst_capacity: CmsStruct,
    /// Per-template capacity reserved for on-demand VMs
    pub burst_count_capacity: TemplateCounts,
}

/// Derived usage of an Environment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EnvironmentStatus {
    /// Sum of the template resources of every VM attributed here
    pub used: CmsStruct,
    /// Unallocated VMs per template
    pub available_count: TemplateCounts,
}

impl Environment {
    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut EnvironmentStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// True when a third-party provisioner owns VMs created here
    pub fn has_external_provisioner(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PROVISIONER_ANNOTATION))
            .is_some_and(|v| v == EXTERNAL_PROVISIONER)
    }

    /// Provisioning settings for a template, if this environment offers it
    pub fn template_settings(&self, template: &str) -> Option<&BTreeMap<String, String>> {
        self.spec.template_mapping.get(template)
    }

    /// Login user for VMs of `template`, empty when not configured
    pub fn ssh_username(&self, template: &str) -> String {
        self.template_settings(template)
            .and_then(|m| m.get(SSH_USERNAME_KEY))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Environment {
        let mut env = Environment::new(
            "aws-east",
            EnvironmentSpec {
                provider: "aws".into(),
                ws_endpoint: "wss://shell.example".into(),
                template_mapping: BTreeMap::from([(
                    "ubuntu".to_string(),
                    BTreeMap::from([
                        ("ssh_username".to_string(), "ubuntu".to_string()),
                        ("image".to_string(), "ami-123".to_string()),
                    ]),
                )]),
                ..Default::default()
            },
        );
        env.metadata.namespace = Some("hobbyfarm".into());
        env
    }

    #[test]
    fn test_wire_keys_are_snake_case() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["apiVersion"], "hobbyfarm.io/v1");
        assert_eq!(value["kind"], "Environment");
        assert_eq!(value["spec"]["ws_endpoint"], "wss://shell.example");
        assert_eq!(value["spec"]["capacity_mode"], "raw");
        assert!(value["spec"]["burst_count_capacity"].is_object());
    }

    #[test]
    fn test_missing_fields_default() {
        let env: Environment = serde_json::from_value(json!({
            "apiVersion": "hobbyfarm.io/v1",
            "kind": "Environment",
            "metadata": {"name": "e"},
            "spec": {"provider": "vsphere", "capacity_mode": "count"}
        }))
        .unwrap();
        assert_eq!(env.spec.capacity_mode, CapacityMode::Count);
        assert!(env.spec.count_capacity.is_empty());
        assert!(!env.spec.burst_capable);
        assert!(env.status.is_none());
    }

    #[test]
    fn test_external_provisioner_annotation() {
        let mut env = sample();
        assert!(!env.has_external_provisioner());
        env.metadata.annotations = Some(BTreeMap::from([(
            "provisioner".to_string(),
            "external".to_string(),
        )]));
        assert!(env.has_external_provisioner());
    }

    #[test]
    fn test_ssh_username_lookup() {
        let env = sample();
        assert_eq!(env.ssh_username("ubuntu"), "ubuntu");
        assert_eq!(env.ssh_username("centos"), "");
    }
}
