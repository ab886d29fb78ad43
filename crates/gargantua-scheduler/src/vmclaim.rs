//! VirtualMachineClaim reconciliation
//!
//! A claim names one VM slot per template it needs. The reconciler first
//! tries a static bind: find one environment holding enough free, ready pool
//! VMs for every template, then allocate them slot by slot. Each allocation
//! is a compare-and-swap on the VM, so two claims racing for the same VM
//! cannot both win; the loser re-queries the free set and picks again.
//!
//! When no environment fits and the claim is dynamic-bind capable, a
//! DynamicBindRequest is created instead and the claim waits for it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use gargantua_common::crd::{
    owner_reference, BindMode, DynamicBindRequest, DynamicBindRequestSpec, Environment,
    VirtualMachine, VirtualMachineClaim,
};
use gargantua_common::labels::{self, LabelSelector};
use gargantua_common::metrics;
use gargantua_common::names::generate_name;
use gargantua_common::store::{update_status_with, update_with, ObjectStore, StoreProvider};
use gargantua_common::{Error, Result};
use gargantua_runtime::{Action, Reconciler};

use crate::DEFAULT_DYNAMIC_BIND_ATTEMPTS;

/// Allocation attempts per slot before the pass gives up and backs off
const MAX_SLOT_ATTEMPTS: usize = 5;

/// Binds claims to VMs, statically or through a DynamicBindRequest
pub struct VmClaimReconciler {
    claims: Arc<dyn ObjectStore<VirtualMachineClaim>>,
    vms: Arc<dyn ObjectStore<VirtualMachine>>,
    environments: Arc<dyn ObjectStore<Environment>>,
    requests: Arc<dyn ObjectStore<DynamicBindRequest>>,
    dynamic_bind_attempts: i32,
}

/// Result of trying to allocate one VM
enum Allocation {
    Won,
    /// Someone else got there first; pick another candidate
    Lost,
}

impl VmClaimReconciler {
    /// Reconciler reading and writing through `stores`
    pub fn new(stores: &impl StoreProvider) -> Self {
        Self {
            claims: stores.store(),
            vms: stores.store(),
            environments: stores.store(),
            requests: stores.store(),
            dynamic_bind_attempts: DEFAULT_DYNAMIC_BIND_ATTEMPTS,
        }
    }

    /// Attempts granted to every DynamicBindRequest this reconciler creates
    pub fn with_dynamic_bind_attempts(mut self, attempts: i32) -> Self {
        self.dynamic_bind_attempts = attempts;
        self
    }

    /// Free, ready VMs of `template` in `environment` the claim may use
    ///
    /// Always a fresh query; callers racing other claims must not reuse an
    /// older result.
    async fn free_vms(
        &self,
        environment: &str,
        template: &str,
        restricted: Option<&str>,
    ) -> Result<Vec<VirtualMachine>> {
        let selector = LabelSelector::everything()
            .with_bool(labels::BOUND, false)
            .with_bool(labels::READY, true)
            .with(labels::ENVIRONMENT, environment)
            .with(labels::TEMPLATE, template)
            .restricted_bind(restricted);
        let mut free = self.vms.list(&selector).await?;
        free.retain(VirtualMachine::is_free);
        Ok(free)
    }

    /// First environment, in list order, with enough free VMs for every
    /// template the claim still needs
    async fn select_environment(&self, claim: &VirtualMachineClaim) -> Result<Option<String>> {
        let needed = claim.needed();
        let restricted = claim.restricted_bind();

        for env in self.environments.list(&LabelSelector::everything()).await? {
            if env.meta().deletion_timestamp.is_some() {
                continue;
            }
            let env_name = env.name_any();
            let mut fits = true;
            for (template, count) in &needed {
                let free = self.free_vms(&env_name, template, restricted).await?.len();
                if i32::try_from(free).unwrap_or(i32::MAX) < *count {
                    fits = false;
                    break;
                }
            }
            if fits {
                return Ok(Some(env_name));
            }
        }
        Ok(None)
    }

    /// Claim `vm_name` for `claim` unless it has been taken meanwhile
    ///
    /// Spec and labels are written first so the VM leaves the free set, then
    /// `status.allocated`. A failed status write rolls the spec back.
    async fn allocate(&self, vm_name: &str, claim: &VirtualMachineClaim) -> Result<Allocation> {
        let current = self.vms.get(vm_name).await?;
        if !current.is_free() {
            return Ok(Allocation::Lost);
        }

        let mut desired = current;
        desired.spec.vm_claim_id = claim.name_any();
        desired.spec.user_id = claim.spec.user_id.clone();
        desired
            .labels_mut()
            .insert(labels::BOUND.into(), labels::bool_value(true));
        match self.vms.update(&desired).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() || e.is_not_found() => return Ok(Allocation::Lost),
            Err(e) => return Err(e),
        }

        let allocated = update_status_with(self.vms.as_ref(), vm_name, |vm: &mut VirtualMachine| {
            vm.status_mut().allocated = true;
        })
        .await;
        if let Err(e) = allocated {
            self.release(vm_name, claim).await;
            return Err(e);
        }
        Ok(Allocation::Won)
    }

    /// Undo a half-finished allocation; failures are logged
    async fn release(&self, vm_name: &str, claim: &VirtualMachineClaim) {
        let claim_name = claim.name_any();
        let result = update_with(self.vms.as_ref(), vm_name, |vm: &mut VirtualMachine| {
            if vm.spec.vm_claim_id == claim_name {
                vm.spec.vm_claim_id.clear();
                vm.spec.user_id.clear();
                vm.labels_mut()
                    .insert(labels::BOUND.into(), labels::bool_value(false));
            }
        })
        .await;
        if let Err(e) = result {
            warn!(vm = %vm_name, error = %e, "Failed to roll back VM allocation");
            return;
        }
        let result = update_status_with(self.vms.as_ref(), vm_name, |vm: &mut VirtualMachine| {
            vm.status_mut().allocated = false;
        })
        .await;
        if let Err(e) = result {
            warn!(vm = %vm_name, error = %e, "Failed to clear VM allocation");
        }
    }

    /// Allocate a VM for one slot and record it on the claim
    ///
    /// Returns false when the free set ran dry.
    async fn bind_slot(
        &self,
        claim: &VirtualMachineClaim,
        slot: &str,
        template: &str,
        environment: &str,
    ) -> Result<bool> {
        let claim_name = claim.name_any();

        for _ in 0..MAX_SLOT_ATTEMPTS {
            let free = self
                .free_vms(environment, template, claim.restricted_bind())
                .await?;
            let Some(candidate) = free.first() else {
                return Ok(false);
            };
            let vm_name = candidate.name_any();

            match self.allocate(&vm_name, claim).await? {
                Allocation::Lost => {
                    debug!(vm = %vm_name, "Lost allocation race, re-querying");
                    continue;
                }
                Allocation::Won => {}
            }

            let recorded = update_with(
                self.claims.as_ref(),
                &claim_name,
                |c: &mut VirtualMachineClaim| {
                    if let Some(entry) = c.spec.virtual_machines.get_mut(slot) {
                        if entry.vm_id.is_empty() {
                            entry.vm_id = vm_name.clone();
                        }
                    }
                },
            )
            .await;
            match recorded {
                Ok(updated) => {
                    let holder = updated
                        .spec
                        .virtual_machines
                        .get(slot)
                        .map(|s| s.vm_id.as_str());
                    if holder != Some(vm_name.as_str()) {
                        // Slot was filled or removed under us
                        self.release(&vm_name, claim).await;
                    }
                    debug!(slot, vm = %vm_name, "Bound slot");
                    return Ok(true);
                }
                Err(e) => {
                    self.release(&vm_name, claim).await;
                    return Err(e);
                }
            }
        }

        Err(Error::conflict("VirtualMachine", format!("{claim_name}/{slot}")))
    }

    async fn bind_static(&self, claim: &VirtualMachineClaim, environment: &str) -> Result<Action> {
        let claim_name = claim.name_any();
        let mut bound = 0u64;

        for (slot, template) in claim.unbound_slots() {
            if !self.bind_slot(claim, &slot, &template, environment).await? {
                info!(environment, template = %template, "Free VMs ran out while binding");
                metrics::record_binds(metrics::BindMode::Static, bound);
                return Ok(Action::requeue_with_backoff());
            }
            bound += 1;
        }
        metrics::record_binds(metrics::BindMode::Static, bound);

        let current = self.claims.get(&claim_name).await?;
        if current.unbound_slots().is_empty() {
            self.mark_bound(&claim_name, Some(BindMode::Static)).await?;
            info!(environment, vms = bound, "Claim bound statically");
        }
        Ok(Action::await_change())
    }

    /// An open request for this claim left over from an interrupted pass
    async fn open_request(&self, claim: &str) -> Result<Option<String>> {
        let requests = self.requests.list(&LabelSelector::everything()).await?;
        Ok(requests
            .into_iter()
            .find(|r| r.spec.vm_claim == claim && !r.observed().is_terminal())
            .map(|r| r.name_any()))
    }

    async fn request_dynamic(&self, claim: &VirtualMachineClaim) -> Result<Action> {
        let claim_name = claim.name_any();

        let request_name = match self.open_request(&claim_name).await? {
            Some(existing) => existing,
            None => {
                let mut request = DynamicBindRequest::new(
                    &generate_name(&claim_name),
                    DynamicBindRequestSpec {
                        vm_claim: claim_name.clone(),
                        attempts: self.dynamic_bind_attempts,
                    },
                );
                request.meta_mut().owner_references = Some(vec![owner_reference(claim)?]);
                self.requests.create(&request).await?.name_any()
            }
        };

        update_status_with(
            self.claims.as_ref(),
            &claim_name,
            |c: &mut VirtualMachineClaim| {
                let status = c.status_mut();
                status.bind_mode = BindMode::Dynamic;
                status.dynamic_bind_request_id = request_name.clone();
            },
        )
        .await?;
        info!(request = %request_name, "No environment fits, requested dynamic bind");
        Ok(Action::await_change())
    }

    async fn follow_dynamic(
        &self,
        claim: &VirtualMachineClaim,
        request_name: &str,
    ) -> Result<Action> {
        let claim_name = claim.name_any();
        let request = match self.requests.get(request_name).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => {
                warn!(request = %request_name, "DynamicBindRequest vanished, starting over");
                update_status_with(
                    self.claims.as_ref(),
                    &claim_name,
                    |c: &mut VirtualMachineClaim| {
                        let status = c.status_mut();
                        status.bind_mode = BindMode::Unbound;
                        status.dynamic_bind_request_id.clear();
                    },
                )
                .await?;
                return Ok(Action::requeue_with_backoff());
            }
            Err(e) => return Err(e),
        };

        let status = request.observed();
        if status.fulfilled {
            return self
                .adopt_dynamic(&claim_name, &status.virtual_machines_id)
                .await;
        }
        if status.expired {
            debug!("DynamicBindRequest expired, retrying static bind");
            return self.bind_or_fall_back(claim, false).await;
        }
        Ok(Action::await_change())
    }

    /// Copy the VMs a fulfilled request created into the claim's slots
    async fn adopt_dynamic(
        &self,
        claim_name: &str,
        vms: &BTreeMap<String, String>,
    ) -> Result<Action> {
        let updated = update_with(
            self.claims.as_ref(),
            claim_name,
            |c: &mut VirtualMachineClaim| {
                for (slot, vm) in vms {
                    if let Some(entry) = c.spec.virtual_machines.get_mut(slot) {
                        if entry.vm_id.is_empty() {
                            entry.vm_id = vm.clone();
                        }
                    }
                }
            },
        )
        .await?;

        if !updated.unbound_slots().is_empty() {
            warn!("Fulfilled DynamicBindRequest left slots unbound");
            return Ok(Action::requeue_with_backoff());
        }
        self.mark_bound(claim_name, Some(BindMode::Dynamic)).await?;
        metrics::record_binds(metrics::BindMode::Dynamic, vms.len() as u64);
        info!(vms = vms.len(), "Claim bound dynamically");
        Ok(Action::await_change())
    }

    async fn bind_or_fall_back(
        &self,
        claim: &VirtualMachineClaim,
        allow_dynamic: bool,
    ) -> Result<Action> {
        match self.select_environment(claim).await? {
            Some(environment) => self.bind_static(claim, &environment).await,
            None if allow_dynamic => self.request_dynamic(claim).await,
            None => {
                let claim_name = claim.name_any();
                let updated = update_status_with(
                    self.claims.as_ref(),
                    &claim_name,
                    |c: &mut VirtualMachineClaim| {
                        c.status_mut().static_bind_attempts += 1;
                    },
                )
                .await?;
                debug!(
                    attempts = updated.observed().static_bind_attempts,
                    "No environment has free VMs for the claim"
                );
                Ok(Action::requeue_with_backoff())
            }
        }
    }

    async fn mark_bound(&self, claim_name: &str, mode: Option<BindMode>) -> Result<()> {
        update_status_with(
            self.claims.as_ref(),
            claim_name,
            |c: &mut VirtualMachineClaim| {
                let status = c.status_mut();
                status.bound = true;
                status.ready = true;
                if let Some(mode) = mode {
                    status.bind_mode = mode;
                }
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for VmClaimReconciler {
    fn name(&self) -> &'static str {
        "vmclaim"
    }

    #[instrument(skip(self), fields(claim = %name))]
    async fn reconcile(&self, name: &str) -> Result<Action> {
        let claim = match self.claims.get(name).await {
            Ok(c) => c,
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e),
        };
        let status = claim.observed();
        if claim.meta().deletion_timestamp.is_some() || status.tainted || status.bound {
            return Ok(Action::await_change());
        }
        if claim.unbound_slots().is_empty() {
            self.mark_bound(name, None).await?;
            return Ok(Action::await_change());
        }

        if status.bind_mode == BindMode::Dynamic && !status.dynamic_bind_request_id.is_empty() {
            return self
                .follow_dynamic(&claim, &status.dynamic_bind_request_id)
                .await;
        }
        self.bind_or_fall_back(&claim, claim.spec.dynamic_bind_capable)
            .await
    }
}
