//! VirtualMachineSet: a declared pool of pre-provisioned VMs

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::restricted_value;

/// Specification for a VirtualMachineSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "VirtualMachineSet",
    plural = "virtualmachinesets",
    shortname = "vms",
    status = "VirtualMachineSetStatus",
    namespaced,
    printcolumn = r#"{"name":"Count","type":"integer","jsonPath":".spec.count"}"#,
    printcolumn = r#"{"name":"Provisioned","type":"integer","jsonPath":".status.provisioned_count"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.available_count"}"#
)]
#[serde(default)]
pub struct VirtualMachineSetSpec {
    /// Desired number of live VMs
    pub count: i32,
    /// Environment the VMs are provisioned in
    pub environment: String,
    /// Template of every VM in the pool
    pub vm_template: String,
    /// Prefix of generated VM names
    pub base_name: String,
    /// Whether the pool is reserved for one tenant
    pub restricted_bind: bool,
    /// Tenant value when `restricted_bind` is set
    pub restricted_bind_value: String,
}

/// One VM in a pool, as reported on the set's status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct VmProvision {
    /// VM name
    pub vm_name: String,
    /// Terraform State backing the VM, empty until provisioned
    pub tfstate: String,
}

/// Observed state of a VirtualMachineSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct VirtualMachineSetStatus {
    /// VMs currently labeled with this set
    pub machines: Vec<VmProvision>,
    /// Live VMs: neither tainted nor being deleted
    pub available_count: i32,
    /// All VMs labeled with this set
    pub provisioned_count: i32,
}

impl VirtualMachineSet {
    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut VirtualMachineSetStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// Restricted-bind tenancy value, if any
    pub fn restricted_bind(&self) -> Option<&str> {
        restricted_value(self.spec.restricted_bind, &self.spec.restricted_bind_value)
    }
}
