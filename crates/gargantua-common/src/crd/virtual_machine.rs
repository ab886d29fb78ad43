//! VirtualMachine: the leaf resource every reconciler eventually touches

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::labels;

/// Specification for a VirtualMachine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    status = "VirtualMachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Claim","type":"string","jsonPath":".spec.vm_claim_id"}"#,
    printcolumn = r#"{"name":"Public IP","type":"string","jsonPath":".status.public_ip"}"#,
    printcolumn = r#"{"name":"Environment","type":"string","jsonPath":".status.environment_id"}"#
)]
#[serde(default)]
pub struct VirtualMachineSpec {
    /// Template the VM was built from
    pub template_id: String,
    /// Login user
    pub ssh_username: String,
    /// Secret holding the keypair, set once provisioned
    pub secret_name: String,
    /// Claim the VM is bound to, empty when free
    pub vm_claim_id: String,
    /// User of the bound claim
    pub user_id: String,
    /// Whether the built-in provisioner drives this VM
    pub provision: bool,
    /// Owning pool, empty for on-demand VMs
    pub vm_set_id: String,
}

/// Provisioning phase of a VM
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Waiting for the provisioner
    #[default]
    ReadyForProvisioning,
    /// Terraform State created, waiting for outputs
    Provisioned,
    /// Reachable
    Running,
    /// Being torn down
    Terminating,
}

impl VmStatus {
    /// Wire token
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::ReadyForProvisioning => "readyforprovisioning",
            VmStatus::Provisioned => "provisioned",
            VmStatus::Running => "running",
            VmStatus::Terminating => "terminating",
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of a VirtualMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct VirtualMachineStatus {
    /// Provisioning phase
    pub status: VmStatus,
    /// Reserved for a claim
    pub allocated: bool,
    /// Marked for reaping
    pub tainted: bool,
    /// Public address, published by the provisioner
    pub public_ip: String,
    /// Private address, published by the provisioner
    pub private_ip: String,
    /// Environment the VM lives in
    pub environment_id: String,
    /// Hostname, published by the provisioner
    pub hostname: String,
    /// Terraform State name
    pub tfstate: String,
    /// Shell proxy endpoint
    pub ws_endpoint: String,
}

impl VirtualMachine {
    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut VirtualMachineStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// Status or its default
    pub fn observed(&self) -> VirtualMachineStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Provisioning phase
    pub fn phase(&self) -> VmStatus {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    /// Marked for reaping
    pub fn is_tainted(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.tainted)
    }

    /// Reserved for a claim
    pub fn is_allocated(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.allocated)
    }

    /// Deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Neither tainted nor being deleted
    pub fn is_live(&self) -> bool {
        !self.is_tainted() && !self.is_deleting()
    }

    /// Environment the VM is attributed to
    pub fn environment_id(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.environment_id.as_str())
            .unwrap_or_default()
    }

    /// Terraform State name, empty before provisioning
    pub fn tfstate(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.tfstate.as_str())
            .unwrap_or_default()
    }

    /// Label value, if present
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    /// Free for a static bind: not claimed, not reserved, not on its way out
    pub fn is_free(&self) -> bool {
        self.spec.vm_claim_id.is_empty()
            && !self.is_allocated()
            && self.is_live()
            && self.label(labels::BOUND) != Some("true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(VmStatus::ReadyForProvisioning, "readyforprovisioning")]
    #[case(VmStatus::Provisioned, "provisioned")]
    #[case(VmStatus::Running, "running")]
    #[case(VmStatus::Terminating, "terminating")]
    fn test_status_wire_tokens(#[case] status: VmStatus, #[case] token: &str) {
        assert_eq!(serde_json::to_value(status).unwrap(), token);
        assert_eq!(status.to_string(), token);
        let parsed: VmStatus = serde_json::from_value(serde_json::json!(token)).unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn test_free_vm() {
        let mut vm = VirtualMachine::new("vm-a", VirtualMachineSpec::default());
        assert!(vm.is_free());

        vm.status_mut().allocated = true;
        assert!(!vm.is_free());

        vm.status_mut().allocated = false;
        vm.spec.vm_claim_id = "claim-1".into();
        assert!(!vm.is_free());

        vm.spec.vm_claim_id.clear();
        vm.status_mut().tainted = true;
        assert!(!vm.is_free());
        assert!(!vm.is_live());
    }

    #[test]
    fn test_missing_status_reads_as_defaults() {
        let vm = VirtualMachine::new("vm-a", VirtualMachineSpec::default());
        assert_eq!(vm.phase(), VmStatus::ReadyForProvisioning);
        assert_eq!(vm.tfstate(), "");
        assert_eq!(vm.environment_id(), "");
        assert!(!vm.is_tainted());
    }
}
