//! DynamicBindRequest reconciliation
//!
//! Each pass first spends one attempt, then looks for a
//! DynamicBindConfiguration whose environment can still absorb every VM the
//! claim needs. On success it creates the VMs, already bound to the claim and
//! owned by the request, and marks the request fulfilled. When the attempts
//! run out the request expires and the claim falls back to static binding.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use gargantua_common::crd::{
    owner_reference, CapacityMode, CmsStruct, DynamicBindConfiguration, DynamicBindRequest,
    Environment, TemplateCounts, VirtualMachine, VirtualMachineClaim, VirtualMachineSpec,
    VirtualMachineTemplate, VmStatus,
};
use gargantua_common::labels::{self, LabelSelector};
use gargantua_common::metrics::{self, DynamicBindOutcome};
use gargantua_common::store::{
    create_with_generated_name, update_status_with, DeleteOptions, ObjectStore, StoreProvider,
};
use gargantua_common::Result;
use gargantua_runtime::{Action, Reconciler};

/// Creates VMs on demand for claims no pool could satisfy
pub struct DynamicBindReconciler {
    requests: Arc<dyn ObjectStore<DynamicBindRequest>>,
    claims: Arc<dyn ObjectStore<VirtualMachineClaim>>,
    configurations: Arc<dyn ObjectStore<DynamicBindConfiguration>>,
    environments: Arc<dyn ObjectStore<Environment>>,
    templates: Arc<dyn ObjectStore<VirtualMachineTemplate>>,
    vms: Arc<dyn ObjectStore<VirtualMachine>>,
}

impl DynamicBindReconciler {
    /// Reconciler reading and writing through `stores`
    pub fn new(stores: &impl StoreProvider) -> Self {
        Self {
            requests: stores.store(),
            claims: stores.store(),
            configurations: stores.store(),
            environments: stores.store(),
            templates: stores.store(),
            vms: stores.store(),
        }
    }

    async fn dynamic_vms(&self, environment: &str) -> Result<Vec<VirtualMachine>> {
        self.vms
            .list(
                &LabelSelector::everything()
                    .with_bool(labels::DYNAMIC, true)
                    .with(labels::ENVIRONMENT, environment),
            )
            .await
    }

    async fn resources(
        &self,
        template: &str,
        seen: &mut BTreeMap<String, CmsStruct>,
    ) -> Result<CmsStruct> {
        if let Some(r) = seen.get(template) {
            return Ok(*r);
        }
        let resources = self.templates.get(template).await?.spec.resources;
        seen.insert(template.to_string(), resources);
        Ok(resources)
    }

    /// Whether `env` and `dbc` can still hold `needed` on top of the dynamic
    /// VMs already running there
    async fn has_capacity(
        &self,
        env: &Environment,
        dbc: &DynamicBindConfiguration,
        needed: &TemplateCounts,
    ) -> Result<bool> {
        let existing = self.dynamic_vms(&env.name_any()).await?;

        match env.spec.capacity_mode {
            CapacityMode::Raw => {
                let mut seen = BTreeMap::new();
                let mut used = CmsStruct::default();
                for vm in &existing {
                    used = used.plus(self.resources(&vm.spec.template_id, &mut seen).await?);
                }
                let mut demand = CmsStruct::default();
                for (template, count) in needed {
                    demand = demand.plus(self.resources(template, &mut seen).await?.times(*count));
                }
                let remaining = env.spec.burst_capacity.minus(used);
                debug!(?remaining, ?demand, "Raw burst headroom");
                Ok(remaining.fits(demand) >= 1)
            }
            CapacityMode::Count => {
                let dbc_name = dbc.name_any();
                for (template, count) in needed {
                    let of_template: Vec<&VirtualMachine> = existing
                        .iter()
                        .filter(|vm| vm.label(labels::TEMPLATE) == Some(template.as_str()))
                        .collect();
                    let through_dbc = of_template
                        .iter()
                        .filter(|vm| {
                            vm.label(labels::DYNAMIC_BIND_CONFIGURATION) == Some(dbc_name.as_str())
                        })
                        .count();

                    let env_left = quota(&env.spec.burst_count_capacity, template)
                        - to_i32(of_template.len());
                    let dbc_left =
                        quota(&dbc.spec.burst_count_capacity, template) - to_i32(through_dbc);
                    if env_left < *count || dbc_left < *count {
                        debug!(template = %template, env_left, dbc_left, "Burst quota exhausted");
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Remove VMs a previous, interrupted pass created for this request
    async fn discard_leftovers(&self, request: &str) -> Result<()> {
        let leftovers = self
            .vms
            .list(&LabelSelector::everything().with(labels::DYNAMIC_BIND_REQUEST, request))
            .await?;
        for vm in leftovers {
            let name = vm.name_any();
            match self.vms.delete(&name, &DeleteOptions::default()).await {
                Ok(()) => warn!(vm = %name, "Deleted VM left by an unfinished dynamic bind"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn create_vm(
        &self,
        request: &DynamicBindRequest,
        claim: &VirtualMachineClaim,
        dbc: &DynamicBindConfiguration,
        env: &Environment,
        template: &str,
    ) -> Result<String> {
        let env_name = env.name_any();
        let dbc_name = dbc.name_any();
        let base_name = if dbc.spec.base_name.is_empty() {
            dbc_name.as_str()
        } else {
            dbc.spec.base_name.as_str()
        };
        let mut vm = VirtualMachine::new(
            "",
            VirtualMachineSpec {
                template_id: template.to_string(),
                ssh_username: env.ssh_username(template),
                vm_claim_id: claim.name_any(),
                user_id: claim.spec.user_id.clone(),
                provision: true,
                ..Default::default()
            },
        );
        vm.meta_mut().owner_references = Some(vec![owner_reference(request)?]);

        let vm_labels = vm.labels_mut();
        vm_labels.insert(labels::DYNAMIC.into(), labels::bool_value(true));
        vm_labels.insert(labels::DYNAMIC_BIND_REQUEST.into(), request.name_any());
        vm_labels.insert(labels::DYNAMIC_BIND_CONFIGURATION.into(), dbc_name.clone());
        vm_labels.insert(labels::TEMPLATE.into(), template.to_string());
        vm_labels.insert(labels::ENVIRONMENT.into(), env_name.clone());
        vm_labels.insert(labels::BOUND.into(), labels::bool_value(true));
        vm_labels.insert(labels::READY.into(), labels::bool_value(false));
        labels::set_restricted_bind(vm_labels, claim.restricted_bind());

        let vm_name = create_with_generated_name(self.vms.as_ref(), &vm, base_name)
            .await?
            .name_any();

        let ws_endpoint = env.spec.ws_endpoint.clone();
        update_status_with(self.vms.as_ref(), &vm_name, |vm: &mut VirtualMachine| {
            let status = vm.status_mut();
            status.status = VmStatus::ReadyForProvisioning;
            status.allocated = true;
            status.ws_endpoint = ws_endpoint.clone();
            status.environment_id = env_name.clone();
        })
        .await?;
        Ok(vm_name)
    }

    /// Create one VM per unbound slot and fulfil the request
    async fn fulfil(
        &self,
        request: &DynamicBindRequest,
        claim: &VirtualMachineClaim,
        dbc: &DynamicBindConfiguration,
        env: &Environment,
    ) -> Result<Action> {
        let request_name = request.name_any();
        let mut created = BTreeMap::new();

        for (slot, template) in claim.unbound_slots() {
            match self.create_vm(request, claim, dbc, env, &template).await {
                Ok(vm) => {
                    created.insert(slot, vm);
                }
                Err(e) => {
                    warn!(error = %e, "Creating dynamic VM failed, discarding partial set");
                    self.discard_leftovers(&request_name).await?;
                    return Err(e);
                }
            }
        }

        let dbc_name = dbc.name_any();
        update_status_with(
            self.requests.as_ref(),
            &request_name,
            |r: &mut DynamicBindRequest| {
                let status = r.status_mut();
                if !status.is_terminal() {
                    status.fulfilled = true;
                    status.dynamic_bind_configuration_id = dbc_name.clone();
                    status.virtual_machines_id = created.clone();
                }
            },
        )
        .await?;

        metrics::record_dynamic_bind(DynamicBindOutcome::Fulfilled);
        info!(
            configuration = %dbc_name,
            environment = %env.name_any(),
            vms = created.len(),
            "Fulfilled dynamic bind"
        );
        Ok(Action::await_change())
    }

    async fn expire(&self, name: &str) -> Result<Action> {
        update_status_with(self.requests.as_ref(), name, |r: &mut DynamicBindRequest| {
            let status = r.status_mut();
            if !status.is_terminal() {
                status.expired = true;
            }
        })
        .await?;
        metrics::record_dynamic_bind(DynamicBindOutcome::Expired);
        info!("Dynamic bind attempts exhausted");
        Ok(Action::await_change())
    }
}

fn quota(counts: &TemplateCounts, template: &str) -> i32 {
    counts.get(template).copied().unwrap_or(0)
}

fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[async_trait]
impl Reconciler for DynamicBindReconciler {
    fn name(&self) -> &'static str {
        "dynamicbind"
    }

    #[instrument(skip(self), fields(request = %name))]
    async fn reconcile(&self, name: &str) -> Result<Action> {
        let request = match self.requests.get(name).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e),
        };
        if request.meta().deletion_timestamp.is_some() || request.observed().is_terminal() {
            return Ok(Action::await_change());
        }

        // Spend the attempt before doing anything that can fail
        let request = update_status_with(
            self.requests.as_ref(),
            name,
            |r: &mut DynamicBindRequest| {
                let status = r.status_mut();
                if !status.is_terminal() {
                    status.current_attempts += 1;
                }
            },
        )
        .await?;
        let attempts = request.observed().current_attempts;

        let claim = match self.claims.get(&request.spec.vm_claim).await {
            Ok(c) => c,
            Err(e) if e.is_not_found() => {
                warn!(claim = %request.spec.vm_claim, "Claim is gone");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e),
        };
        let needed = claim.needed();

        self.discard_leftovers(name).await?;

        let candidates = self
            .configurations
            .list(&LabelSelector::everything().restricted_bind(claim.restricted_bind()))
            .await?;
        for dbc in &candidates {
            let env = match self.environments.get(&dbc.spec.environment).await {
                Ok(env) => env,
                Err(e) if e.is_not_found() => {
                    debug!(configuration = %dbc.name_any(), "Environment not found");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !env.spec.burst_capable {
                continue;
            }
            if self.has_capacity(&env, dbc, &needed).await? {
                return self.fulfil(&request, &claim, dbc, &env).await;
            }
        }

        if attempts > request.spec.attempts {
            return self.expire(name).await;
        }
        debug!(attempts, limit = request.spec.attempts, "No configuration has room");
        Ok(Action::requeue_with_backoff())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{burst_environment, claim, dbc, dynamic_vm, seed, template, Fixture};
    use gargantua_common::crd::DynamicBindRequestSpec;

    fn request(name: &str, claim: &str, attempts: i32) -> DynamicBindRequest {
        DynamicBindRequest::new(
            name,
            DynamicBindRequestSpec {
                vm_claim: claim.into(),
                attempts,
            },
        )
    }

    async fn dynamic_vms_in(fx: &Fixture, env: &str) -> Vec<VirtualMachine> {
        fx.vms()
            .list(
                &LabelSelector::everything()
                    .with_bool(labels::DYNAMIC, true)
                    .with(labels::ENVIRONMENT, env),
            )
            .await
            .unwrap()
    }

    mod count_mode {
        use super::*;

        /// Story: a request within both quotas creates one VM per slot,
        /// already bound to the claim
        #[tokio::test]
        async fn story_request_within_quota_is_fulfilled() {
            let fx = Fixture::new();
            let mut env = burst_environment("env-e", &[("ubuntu", 2)]);
            env.spec.ws_endpoint = "wss://shell.example".into();
            seed(&fx.store, &env);
            seed(&fx.store, &dbc("dbc-1", "env-e", &[("ubuntu", 2)]));
            seed(&fx.store, &claim("claim-c", &[("web", "ubuntu"), ("db", "ubuntu")]));
            seed(&fx.store, &request("dbr-1", "claim-c", 3));

            let action = DynamicBindReconciler::new(&fx.store)
                .reconcile("dbr-1")
                .await
                .unwrap();
            assert_eq!(action, Action::await_change());

            let status = fx.dbrs().get("dbr-1").await.unwrap().observed();
            assert!(status.fulfilled);
            assert!(!status.expired);
            assert_eq!(status.current_attempts, 1);
            assert_eq!(status.dynamic_bind_configuration_id, "dbc-1");
            assert_eq!(status.virtual_machines_id.len(), 2);

            for vm_name in status.virtual_machines_id.values() {
                let vm = fx.vms().get(vm_name).await.unwrap();
                assert!(vm_name.starts_with("env-e-burst-"));
                assert_eq!(vm.spec.vm_claim_id, "claim-c");
                assert_eq!(vm.spec.user_id, "user-1");
                assert!(vm.spec.provision);
                assert_eq!(vm.label(labels::BOUND), Some("true"));
                assert_eq!(vm.label(labels::READY), Some("false"));
                assert_eq!(vm.label(labels::DYNAMIC_BIND_REQUEST), Some("dbr-1"));
                assert_eq!(vm.owner_references()[0].name, "dbr-1");
                let vm_status = vm.observed();
                assert_eq!(vm_status.status, VmStatus::ReadyForProvisioning);
                assert!(vm_status.allocated);
                assert_eq!(vm_status.environment_id, "env-e");
                assert_eq!(vm_status.ws_endpoint, "wss://shell.example");
            }
        }

        /// Story: a configuration without a base name still yields VMs with a
        /// recognizable prefix, its own name
        #[tokio::test]
        async fn story_unnamed_configuration_prefixes_with_its_own_name() {
            let fx = Fixture::new();
            seed(&fx.store, &burst_environment("env-e", &[("ubuntu", 2)]));
            let mut configuration = dbc("dbc-1", "env-e", &[("ubuntu", 2)]);
            configuration.spec.base_name.clear();
            seed(&fx.store, &configuration);
            seed(&fx.store, &claim("claim-c", &[("web", "ubuntu"), ("db", "ubuntu")]));
            seed(&fx.store, &request("dbr-1", "claim-c", 3));

            DynamicBindReconciler::new(&fx.store)
                .reconcile("dbr-1")
                .await
                .unwrap();

            let status = fx.dbrs().get("dbr-1").await.unwrap().observed();
            assert!(status.fulfilled);
            assert_eq!(status.virtual_machines_id.len(), 2);
            for vm_name in status.virtual_machines_id.values() {
                assert!(vm_name.starts_with("dbc-1-"), "{vm_name}");
                assert!(fx.vms().get(vm_name).await.is_ok());
            }
        }

        /// Story: with zero quota the request burns its attempts and expires
        /// on the pass after the last one
        #[tokio::test]
        async fn story_exhausted_request_expires() {
            let fx = Fixture::new();
            seed(&fx.store, &burst_environment("env-e", &[]));
            seed(&fx.store, &dbc("dbc-1", "env-e", &[]));
            seed(&fx.store, &claim("claim-c", &[("web", "ubuntu")]));
            seed(&fx.store, &request("dbr-1", "claim-c", 3));
            let reconciler = DynamicBindReconciler::new(&fx.store);

            for pass in 1..=3 {
                let action = reconciler.reconcile("dbr-1").await.unwrap();
                assert!(action.is_backoff(), "pass {pass}");
                let status = fx.dbrs().get("dbr-1").await.unwrap().observed();
                assert_eq!(status.current_attempts, pass);
                assert!(!status.is_terminal());
            }

            reconciler.reconcile("dbr-1").await.unwrap();
            let status = fx.dbrs().get("dbr-1").await.unwrap().observed();
            assert!(status.expired);
            assert!(!status.fulfilled);
            assert_eq!(status.current_attempts, 4);

            // Terminal requests never change again
            let revision = fx.store.revision();
            reconciler.reconcile("dbr-1").await.unwrap();
            assert_eq!(fx.store.revision(), revision);
        }

        /// Story: dynamic VMs already in the environment count against its
        /// quota, so the request cannot overshoot it
        #[tokio::test]
        async fn story_environment_quota_counts_existing_vms() {
            let fx = Fixture::new();
            seed(&fx.store, &burst_environment("env-e", &[("ubuntu", 2)]));
            seed(&fx.store, &dbc("dbc-1", "env-e", &[("ubuntu", 5)]));
            seed(&fx.store, &dynamic_vm("old-1", "env-e", "ubuntu", "dbc-other"));
            seed(&fx.store, &claim("claim-c", &[("web", "ubuntu"), ("db", "ubuntu")]));
            seed(&fx.store, &request("dbr-1", "claim-c", 3));

            let action = DynamicBindReconciler::new(&fx.store)
                .reconcile("dbr-1")
                .await
                .unwrap();
            assert!(action.is_backoff());
            assert_eq!(dynamic_vms_in(&fx, "env-e").await.len(), 1);
        }

        #[tokio::test]
        async fn test_configuration_quota_is_checked_too() {
            let fx = Fixture::new();
            seed(&fx.store, &burst_environment("env-e", &[("ubuntu", 5)]));
            seed(&fx.store, &dbc("dbc-1", "env-e", &[("ubuntu", 1)]));
            seed(&fx.store, &dynamic_vm("old-1", "env-e", "ubuntu", "dbc-1"));
            seed(&fx.store, &claim("claim-c", &[("web", "ubuntu")]));
            seed(&fx.store, &request("dbr-1", "claim-c", 3));

            let action = DynamicBindReconciler::new(&fx.store)
                .reconcile("dbr-1")
                .await
                .unwrap();
            assert!(action.is_backoff());
        }

        #[tokio::test]
        async fn test_second_configuration_is_tried() {
            let fx = Fixture::new();
            let mut plain = burst_environment("env-a", &[("ubuntu", 5)]);
            plain.spec.burst_capable = false;
            seed(&fx.store, &plain);
            seed(&fx.store, &burst_environment("env-b", &[("ubuntu", 5)]));
            seed(&fx.store, &dbc("dbc-a", "env-a", &[("ubuntu", 5)]));
            seed(&fx.store, &dbc("dbc-b", "env-b", &[("ubuntu", 5)]));
            seed(&fx.store, &claim("claim-c", &[("web", "ubuntu")]));
            seed(&fx.store, &request("dbr-1", "claim-c", 3));

            DynamicBindReconciler::new(&fx.store)
                .reconcile("dbr-1")
                .await
                .unwrap();

            let status = fx.dbrs().get("dbr-1").await.unwrap().observed();
            assert_eq!(status.dynamic_bind_configuration_id, "dbc-b");
            assert!(dynamic_vms_in(&fx, "env-a").await.is_empty());
        }

        #[tokio::test]
        async fn test_restricted_configuration_is_hidden_from_open_claims() {
            let fx = Fixture::new();
            seed(&fx.store, &burst_environment("env-e", &[("ubuntu", 5)]));
            let mut tenant = dbc("dbc-acme", "env-e", &[("ubuntu", 5)]);
            tenant.spec.restricted_bind = true;
            tenant.spec.restricted_bind_value = "acme".into();
            labels::set_restricted_bind(tenant.labels_mut(), Some("acme"));
            seed(&fx.store, &tenant);
            seed(&fx.store, &claim("claim-c", &[("web", "ubuntu")]));
            seed(&fx.store, &request("dbr-1", "claim-c", 3));

            let action = DynamicBindReconciler::new(&fx.store)
                .reconcile("dbr-1")
                .await
                .unwrap();
            assert!(action.is_backoff());
        }
    }

    mod raw_mode {
        use super::*;

        fn raw_environment(name: &str, burst: CmsStruct) -> Environment {
            let mut env = burst_environment(name, &[]);
            env.spec.capacity_mode = CapacityMode::Raw;
            env.spec.burst_capacity = burst;
            env
        }

        /// Story: raw headroom is the burst capacity minus the template
        /// resources of every dynamic VM already in the environment
        #[tokio::test]
        async fn story_raw_headroom_limits_demand() {
            let fx = Fixture::new();
            seed(
                &fx.store,
                &raw_environment("env-e", CmsStruct::new(4, 8192, 100000)),
            );
            seed(&fx.store, &template("ubuntu", CmsStruct::new(2, 4096, 10000)));
            seed(&fx.store, &dbc("dbc-1", "env-e", &[]));
            seed(&fx.store, &dynamic_vm("old-1", "env-e", "ubuntu", "dbc-1"));

            seed(&fx.store, &claim("claim-big", &[("a", "ubuntu"), ("b", "ubuntu")]));
            seed(&fx.store, &request("dbr-big", "claim-big", 3));
            seed(&fx.store, &claim("claim-small", &[("a", "ubuntu")]));
            seed(&fx.store, &request("dbr-small", "claim-small", 3));
            let reconciler = DynamicBindReconciler::new(&fx.store);

            let action = reconciler.reconcile("dbr-big").await.unwrap();
            assert!(action.is_backoff());

            reconciler.reconcile("dbr-small").await.unwrap();
            let status = fx.dbrs().get("dbr-small").await.unwrap().observed();
            assert!(status.fulfilled);
            assert_eq!(dynamic_vms_in(&fx, "env-e").await.len(), 2);
        }

        #[tokio::test]
        async fn test_missing_template_is_an_error() {
            let fx = Fixture::new();
            seed(
                &fx.store,
                &raw_environment("env-e", CmsStruct::new(4, 8192, 100000)),
            );
            seed(&fx.store, &dbc("dbc-1", "env-e", &[]));
            seed(&fx.store, &claim("claim-c", &[("a", "ubuntu")]));
            seed(&fx.store, &request("dbr-1", "claim-c", 3));

            let err = DynamicBindReconciler::new(&fx.store)
                .reconcile("dbr-1")
                .await
                .unwrap_err();
            assert!(err.is_not_found());
        }
    }

    #[tokio::test]
    async fn test_fulfilled_request_is_left_alone() {
        let fx = Fixture::new();
        let mut done = request("dbr-1", "claim-c", 3);
        done.status_mut().fulfilled = true;
        done.status_mut().current_attempts = 1;
        seed(&fx.store, &done);

        let revision = fx.store.revision();
        DynamicBindReconciler::new(&fx.store)
            .reconcile("dbr-1")
            .await
            .unwrap();
        assert_eq!(fx.store.revision(), revision);
    }

    #[tokio::test]
    async fn test_leftovers_from_an_interrupted_pass_are_removed() {
        let fx = Fixture::new();
        seed(&fx.store, &burst_environment("env-e", &[("ubuntu", 1)]));
        seed(&fx.store, &dbc("dbc-1", "env-e", &[("ubuntu", 1)]));
        seed(&fx.store, &claim("claim-c", &[("web", "ubuntu")]));
        seed(&fx.store, &request("dbr-1", "claim-c", 3));
        let mut leftover = dynamic_vm("stray", "env-e", "ubuntu", "dbc-1");
        leftover
            .labels_mut()
            .insert(labels::DYNAMIC_BIND_REQUEST.into(), "dbr-1".into());
        seed(&fx.store, &leftover);

        DynamicBindReconciler::new(&fx.store)
            .reconcile("dbr-1")
            .await
            .unwrap();

        assert!(fx.vms().get("stray").await.unwrap_err().is_not_found());
        let status = fx.dbrs().get("dbr-1").await.unwrap().observed();
        assert!(status.fulfilled);
        assert_eq!(dynamic_vms_in(&fx, "env-e").await.len(), 1);
    }
}
