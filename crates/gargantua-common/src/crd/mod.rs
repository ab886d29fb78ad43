//! Custom Resource Definitions for Gargantua
//!
//! This module contains every resource kind the controllers read or write.

mod dynamic_bind;
mod environment;
mod template;
mod terraform;
mod types;
mod virtual_machine;
mod vmclaim;
mod vmset;

pub use dynamic_bind::{
    DynamicBindConfiguration, DynamicBindConfigurationSpec, DynamicBindRequest,
    DynamicBindRequestSpec, DynamicBindRequestStatus,
};
pub use environment::{Environment, EnvironmentSpec, EnvironmentStatus, SSH_USERNAME_KEY};
pub use template::{VirtualMachineTemplate, VirtualMachineTemplateSpec};
pub use terraform::{
    Execution, ExecutionSpec, ExecutionStatus, State, StateSpec, StateStatus, Variables,
};
pub use types::{restricted_value, CapacityMode, CmsStruct, TemplateCounts};
pub use virtual_machine::{VirtualMachine, VirtualMachineSpec, VirtualMachineStatus, VmStatus};
pub use vmclaim::{
    BindMode, VirtualMachineClaim, VirtualMachineClaimSpec, VirtualMachineClaimStatus,
    VmClaimSlot,
};
pub use vmset::{VirtualMachineSet, VirtualMachineSetSpec, VirtualMachineSetStatus, VmProvision};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResourceExt, Resource, ResourceExt};

use crate::{Error, Result};

/// Controller owner reference pointing at `owner`
///
/// The owner must have been read back from the store so that it has a uid.
pub fn owner_reference<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::validation_for(
            owner.name_any(),
            "owner has no uid; it must be read from the store first",
        )
    })
}

/// Every `hobbyfarm.io` CRD, in install order
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        Environment::crd(),
        VirtualMachineTemplate::crd(),
        VirtualMachineSet::crd(),
        VirtualMachineClaim::crd(),
        DynamicBindConfiguration::crd(),
        DynamicBindRequest::crd(),
        VirtualMachine::crd(),
    ]
}
