//! VirtualMachineClaim: a user's request for one or more VMs

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{restricted_value, TemplateCounts};

/// Specification for a VirtualMachineClaim
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "VirtualMachineClaim",
    plural = "virtualmachineclaims",
    shortname = "vmc",
    status = "VirtualMachineClaimStatus",
    namespaced,
    printcolumn = r#"{"name":"User","type":"string","jsonPath":".spec.user_id"}"#,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".status.bind_mode"}"#,
    printcolumn = r#"{"name":"Bound","type":"boolean","jsonPath":".status.bound"}"#
)]
#[serde(default)]
pub struct VirtualMachineClaimSpec {
    /// Owning user
    pub user_id: String,
    /// Prefix for names derived from this claim
    pub base_name: String,
    /// Slot name → requested template and bound VM
    pub virtual_machines: BTreeMap<String, VmClaimSlot>,
    /// Whether on-demand VMs may be created when no pool VM is free
    pub dynamic_bind_capable: bool,
    /// Whether only tenant-restricted VMs may be bound
    pub restricted_bind: bool,
    /// Tenant value when `restricted_bind` is set
    pub restricted_bind_value: String,
}

/// One requested VM of a claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct VmClaimSlot {
    /// Requested template
    pub template: String,
    /// Bound VM name, empty until bound
    pub vm_id: String,
}

impl VmClaimSlot {
    /// A slot waiting for a VM of `template`
    pub fn unbound(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            vm_id: String::new(),
        }
    }

    /// True once a VM has been assigned
    pub fn is_bound(&self) -> bool {
        !self.vm_id.is_empty()
    }
}

/// How a claim got (or is getting) its VMs
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// Bound to pre-provisioned pool VMs
    Static,
    /// Waiting on, or bound through, a DynamicBindRequest
    Dynamic,
    /// Nothing bound yet
    #[default]
    Unbound,
}

/// Observed state of a VirtualMachineClaim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct VirtualMachineClaimStatus {
    /// How the claim is being bound
    pub bind_mode: BindMode,
    /// Failed static bind passes
    pub static_bind_attempts: i32,
    /// Pending or fulfilled DynamicBindRequest
    pub dynamic_bind_request_id: String,
    /// Every slot has a VM
    pub bound: bool,
    /// Every bound VM is usable
    pub ready: bool,
    /// Claim is being reaped
    pub tainted: bool,
}

impl VirtualMachineClaim {
    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut VirtualMachineClaimStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// Status or its default
    pub fn observed(&self) -> VirtualMachineClaimStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Restricted-bind tenancy value, if any
    pub fn restricted_bind(&self) -> Option<&str> {
        restricted_value(self.spec.restricted_bind, &self.spec.restricted_bind_value)
    }

    /// Unbound slots in slot-name order as `(slot, template)`
    pub fn unbound_slots(&self) -> Vec<(String, String)> {
        self.spec
            .virtual_machines
            .iter()
            .filter(|(_, slot)| !slot.is_bound())
            .map(|(name, slot)| (name.clone(), slot.template.clone()))
            .collect()
    }

    /// Multiset of templates still needed, by template
    pub fn needed(&self) -> TemplateCounts {
        let mut needed = TemplateCounts::new();
        for (_, template) in self.unbound_slots() {
            *needed.entry(template).or_insert(0) += 1;
        }
        needed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(slots: &[(&str, &str, &str)]) -> VirtualMachineClaim {
        VirtualMachineClaim::new(
            "claim-1",
            VirtualMachineClaimSpec {
                user_id: "u-1".into(),
                virtual_machines: slots
                    .iter()
                    .map(|(slot, t, vm)| {
                        (
                            slot.to_string(),
                            VmClaimSlot {
                                template: t.to_string(),
                                vm_id: vm.to_string(),
                            },
                        )
                    })
                    .collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_needed_counts_only_unbound_slots() {
        let c = claim(&[
            ("web", "ubuntu", ""),
            ("db", "ubuntu", ""),
            ("ctl", "centos", "vm-x"),
            ("lb", "centos", ""),
        ]);
        let needed = c.needed();
        assert_eq!(needed.get("ubuntu"), Some(&2));
        assert_eq!(needed.get("centos"), Some(&1));
        assert_eq!(c.unbound_slots().len(), 3);
        assert_eq!(c.unbound_slots()[0].0, "db");
    }

    #[test]
    fn test_bind_mode_wire_form() {
        let value = serde_json::to_value(VirtualMachineClaimStatus::default()).unwrap();
        assert_eq!(value["bind_mode"], "unbound");
        assert_eq!(
            serde_json::to_string(&BindMode::Dynamic).unwrap(),
            "\"dynamic\""
        );
    }
}
