//! VirtualMachineSet reconciliation
//!
//! A set owns a pool of pooled VMs labelled `vmset=<name>`. Each pass counts
//! the live members, creates the shortfall, taints the excess and writes the
//! pool's status. Tainted VMs are torn down by the provisioner; this
//! controller only recounts them.

use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use gargantua_common::crd::{
    owner_reference, Environment, VirtualMachine, VirtualMachineSet, VirtualMachineSpec,
    VmProvision, VmStatus,
};
use gargantua_common::labels::{self, LabelSelector};
use gargantua_common::store::{
    create_with_generated_name, update_status_with, ObjectStore, StoreProvider,
};
use gargantua_common::{Error, Result};
use gargantua_runtime::{Action, Reconciler};

/// Keeps every VirtualMachineSet at its declared count
pub struct VmSetReconciler {
    vmsets: Arc<dyn ObjectStore<VirtualMachineSet>>,
    vms: Arc<dyn ObjectStore<VirtualMachine>>,
    environments: Arc<dyn ObjectStore<Environment>>,
}

impl VmSetReconciler {
    /// Reconciler reading and writing through `stores`
    pub fn new(stores: &impl StoreProvider) -> Self {
        Self {
            vmsets: stores.store(),
            vms: stores.store(),
            environments: stores.store(),
        }
    }

    async fn members(&self, vmset: &str) -> Result<Vec<VirtualMachine>> {
        self.vms
            .list(&LabelSelector::everything().with(labels::VMSET, vmset))
            .await
    }

    /// Create one pooled VM and fill in its initial status
    async fn create_vm(&self, vmset: &VirtualMachineSet, env: &Environment) -> Result<String> {
        let set_name = vmset.name_any();
        let base_name = if vmset.spec.base_name.is_empty() {
            set_name.as_str()
        } else {
            vmset.spec.base_name.as_str()
        };
        let template = &vmset.spec.vm_template;
        let external = env.has_external_provisioner();

        let mut vm = VirtualMachine::new(
            "",
            VirtualMachineSpec {
                template_id: template.clone(),
                ssh_username: env.ssh_username(template),
                provision: !external,
                vm_set_id: set_name.clone(),
                ..Default::default()
            },
        );
        vm.meta_mut().owner_references = Some(vec![owner_reference(vmset)?]);

        let vm_labels = vm.labels_mut();
        vm_labels.insert(labels::VMSET.into(), set_name.clone());
        vm_labels.insert(labels::TEMPLATE.into(), template.clone());
        vm_labels.insert(labels::ENVIRONMENT.into(), env.name_any());
        vm_labels.insert(labels::DYNAMIC.into(), labels::bool_value(false));
        vm_labels.insert(labels::BOUND.into(), labels::bool_value(false));
        vm_labels.insert(labels::READY.into(), labels::bool_value(false));
        labels::set_restricted_bind(vm_labels, vmset.restricted_bind());
        if external {
            vm_labels.insert(
                labels::PROVISIONER.into(),
                labels::EXTERNAL_PROVISIONER.into(),
            );
        }

        let created = create_with_generated_name(self.vms.as_ref(), &vm, base_name).await?;
        let vm_name = created.name_any();

        let ws_endpoint = env.spec.ws_endpoint.clone();
        let environment_id = env.name_any();
        update_status_with(self.vms.as_ref(), &vm_name, |vm: &mut VirtualMachine| {
            let status = vm.status_mut();
            status.status = VmStatus::ReadyForProvisioning;
            status.allocated = false;
            status.tainted = false;
            status.ws_endpoint = ws_endpoint.clone();
            status.environment_id = environment_id.clone();
        })
        .await?;

        info!(vmset = %set_name, vm = %vm_name, environment = %environment_id, "Created pool VM");
        Ok(vm_name)
    }

    /// Taint the lexicographically-last unallocated live members
    ///
    /// Allocated VMs are never taken from their claims; if too few members
    /// are unallocated the pool stays oversized until claims release VMs.
    async fn taint_excess(&self, live: &[&VirtualMachine], excess: usize) -> Result<()> {
        let mut candidates: Vec<String> = live
            .iter()
            .filter(|vm| !vm.is_allocated())
            .map(|vm| vm.name_any())
            .collect();
        candidates.sort();

        for name in candidates.into_iter().rev().take(excess) {
            update_status_with(self.vms.as_ref(), &name, |vm: &mut VirtualMachine| {
                vm.status_mut().tainted = true;
            })
            .await?;
            info!(vm = %name, "Tainted excess pool VM");
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for VmSetReconciler {
    fn name(&self) -> &'static str {
        "vmset"
    }

    #[instrument(skip(self), fields(vmset = %name))]
    async fn reconcile(&self, name: &str) -> Result<Action> {
        let vmset = match self.vmsets.get(name).await {
            Ok(set) => set,
            Err(e) if e.is_not_found() => {
                debug!("VirtualMachineSet is gone");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e),
        };
        if vmset.meta().deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        let members = self.members(name).await?;
        let live: Vec<&VirtualMachine> = members.iter().filter(|vm| vm.is_live()).collect();
        let desired = usize::try_from(vmset.spec.count).unwrap_or(0);

        if live.len() < desired {
            let env = match self.environments.get(&vmset.spec.environment).await {
                Ok(env) => env,
                Err(e) if e.is_not_found() => {
                    warn!(environment = %vmset.spec.environment, "Environment not found");
                    return Ok(Action::requeue_with_backoff());
                }
                Err(e) => return Err(e),
            };
            let shortfall = desired - live.len();
            info!(live = live.len(), desired, "Scaling pool up");
            for _ in 0..shortfall {
                self.create_vm(&vmset, &env).await?;
            }
        } else if live.len() > desired {
            let excess = live.len() - desired;
            info!(live = live.len(), desired, "Scaling pool down");
            self.taint_excess(&live, excess).await?;
        }

        let members = self.members(name).await?;
        let mut machines: Vec<VmProvision> = members
            .iter()
            .map(|vm| VmProvision {
                vm_name: vm.name_any(),
                tfstate: vm.tfstate().to_string(),
            })
            .collect();
        machines.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
        let available = count_i32(members.iter().filter(|vm| vm.is_live()).count());
        let provisioned = count_i32(members.len());

        update_status_with(self.vmsets.as_ref(), name, |set: &mut VirtualMachineSet| {
            let status = set.status_mut();
            status.machines = machines.clone();
            status.available_count = available;
            status.provisioned_count = provisioned;
        })
        .await?;

        Ok(Action::await_change())
    }

    /// Conflicts retry with backoff; anything else waits for the next change
    /// or resync
    fn error_policy(&self, _name: &str, error: &Error) -> Action {
        if error.is_conflict() {
            Action::requeue_with_backoff()
        } else {
            Action::await_change()
        }
    }
}

fn count_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
