//! VirtualMachine provisioning through the Terraform controller
//!
//! ```text
//! readyforprovisioning ──(Secret, ConfigMap, State)──► provisioned
//! provisioned ──(Execution outputs)──► running
//! ```
//!
//! The provisioner is the only writer of [`PROVISIONER_FINALIZER`]. It is
//! added before the State is created and removed once the State is gone.
//! Spec and label writes are repeated on later passes, so a write that fails
//! after the status moved on is repaired by the next reconcile.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use gargantua_common::crd::{
    owner_reference, Environment, Execution, State, StateSpec, Variables, VirtualMachine,
    VirtualMachineTemplate, VmStatus,
};
use gargantua_common::labels::{self, LabelSelector};
use gargantua_common::metrics;
use gargantua_common::names::{config_map_name, secret_name, state_name};
use gargantua_common::store::{
    create_or_get, remove_finalizer, update_status_with, update_with, DeleteOptions, ObjectStore,
    StoreProvider,
};
use gargantua_common::{Error, Result, PROVISIONER_FINALIZER};
use gargantua_runtime::{Action, Reconciler};

use crate::config;
use crate::keypair::{self, Credentials};
use crate::outputs;

/// Requeue interval while waiting on the Terraform controller
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Drives VMs with `spec.provision` from creation to running and back
pub struct VmProvisioner {
    vms: Arc<dyn ObjectStore<VirtualMachine>>,
    environments: Arc<dyn ObjectStore<Environment>>,
    templates: Arc<dyn ObjectStore<VirtualMachineTemplate>>,
    config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    secrets: Arc<dyn ObjectStore<Secret>>,
    states: Arc<dyn ObjectStore<State>>,
    executions: Arc<dyn ObjectStore<Execution>>,
    poll_interval: Duration,
}

impl VmProvisioner {
    /// Provisioner reading and writing through `stores`
    pub fn new(stores: &impl StoreProvider) -> Self {
        Self {
            vms: stores.store(),
            environments: stores.store(),
            templates: stores.store(),
            config_maps: stores.store(),
            secrets: stores.store(),
            states: stores.store(),
            executions: stores.store(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How long to wait between Terraform progress checks
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Read Executions from `executions` instead, typically a cached store
    pub fn with_executions(mut self, executions: Arc<dyn ObjectStore<Execution>>) -> Self {
        self.executions = executions;
        self
    }

    /// Tear down the State, then release the VM
    async fn finalize(&self, vm: &VirtualMachine) -> Result<Action> {
        let name = vm.name_any();
        if !vm.finalizers().iter().any(|f| f == PROVISIONER_FINALIZER) {
            return Ok(Action::await_change());
        }

        let tfstate = vm.tfstate();
        if !tfstate.is_empty() {
            match self.states.get(tfstate).await {
                Ok(state) => {
                    if state.meta().deletion_timestamp.is_none() {
                        match self.states.delete(tfstate, &DeleteOptions::default()).await {
                            Ok(()) => info!(state = %tfstate, "Deleting Terraform state"),
                            Err(e) if e.is_not_found() => {}
                            Err(e) => return Err(e),
                        }
                    }
                    return Ok(Action::requeue(self.poll_interval));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        remove_finalizer(self.vms.as_ref(), &name, PROVISIONER_FINALIZER).await?;
        metrics::record_vm_transition("deleted");
        info!("Released VM");
        Ok(Action::await_change())
    }

    async fn reap_tainted(&self, name: &str) -> Result<Action> {
        update_with(self.vms.as_ref(), name, |vm: &mut VirtualMachine| {
            vm.labels_mut()
                .insert(labels::READY.into(), labels::bool_value(false));
        })
        .await?;
        match self.vms.delete(name, &DeleteOptions::default()).await {
            Ok(()) => info!("Deleting tainted VM"),
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e),
        }
        Ok(Action::requeue(self.poll_interval))
    }

    /// Public key from the VM's Secret, creating the Secret on first use
    async fn ensure_credentials(&self, vm: &VirtualMachine) -> Result<String> {
        let name = secret_name(&vm.name_any());
        let secret = match self.secrets.get(&name).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => {
                let credentials = Credentials::generate()?;
                let mut secret = Secret {
                    data: Some(BTreeMap::from([
                        (keypair::PRIVATE_KEY.to_string(), bytes(&credentials.private_key)),
                        (keypair::PUBLIC_KEY.to_string(), bytes(&credentials.public_key)),
                        (keypair::PASSWORD.to_string(), bytes(&credentials.password)),
                    ])),
                    ..Default::default()
                };
                secret.meta_mut().name = Some(name.clone());
                secret.meta_mut().owner_references = Some(vec![owner_reference(vm)?]);
                create_or_get(self.secrets.as_ref(), &secret).await?
            }
            Err(e) => return Err(e),
        };

        secret
            .data
            .as_ref()
            .and_then(|d| d.get(keypair::PUBLIC_KEY))
            .map(|b| String::from_utf8_lossy(&b.0).into_owned())
            .ok_or_else(|| Error::validation_for_field(name, keypair::PUBLIC_KEY, "missing key"))
    }

    async fn provision(&self, vm: &VirtualMachine) -> Result<Action> {
        let name = vm.name_any();
        let env = match self.environments.get(vm.environment_id()).await {
            Ok(env) => env,
            Err(e) if e.is_not_found() => {
                warn!(environment = %vm.environment_id(), "Environment not found");
                return Ok(Action::requeue_with_backoff());
            }
            Err(e) => return Err(e),
        };
        let template = match self.templates.get(&vm.spec.template_id).await {
            Ok(t) => t,
            Err(e) if e.is_not_found() => {
                warn!(template = %vm.spec.template_id, "Template not found");
                return Ok(Action::requeue_with_backoff());
            }
            Err(e) => return Err(e),
        };

        let public_key = self.ensure_credentials(vm).await?;
        let plan = config::assemble(vm, &env, &template, &public_key)?;
        let owner = owner_reference(vm)?;

        let mut config_map = ConfigMap {
            data: Some(plan.variables),
            ..Default::default()
        };
        config_map.meta_mut().name = Some(config_map_name(&name));
        config_map.meta_mut().owner_references = Some(vec![owner.clone()]);
        let config_map = create_or_get(self.config_maps.as_ref(), &config_map).await?;

        let mut state = State::new(
            &state_name(&name),
            StateSpec {
                variables: Variables {
                    config_names: vec![config_map.name_any()],
                    secret_names: plan.cred_secret.into_iter().collect(),
                    ..Default::default()
                },
                image: plan.executor_image,
                module_name: plan.module,
                auto_confirm: true,
                destroy_on_delete: true,
            },
        );
        state.meta_mut().owner_references = Some(vec![owner]);
        self.claim_for_teardown(&name).await?;
        let tfstate = create_or_get(self.states.as_ref(), &state).await?.name_any();

        update_status_with(self.vms.as_ref(), &name, |vm: &mut VirtualMachine| {
            let status = vm.status_mut();
            status.tfstate = tfstate.clone();
            status.status = VmStatus::Provisioned;
        })
        .await?;

        metrics::record_vm_transition(VmStatus::Provisioned.as_str());
        info!(state = %tfstate, "Created Terraform state");
        Ok(Action::requeue(self.poll_interval))
    }

    /// Link the Secret, hold the VM with the finalizer and keep it out of
    /// the ready pool
    ///
    /// Runs before the State exists and again on every provisioned pass, so
    /// a failed write is repaired by the next reconcile. Writes nothing once
    /// everything is in place.
    async fn claim_for_teardown(&self, name: &str) -> Result<()> {
        let secret = secret_name(name);
        update_with(self.vms.as_ref(), name, |vm: &mut VirtualMachine| {
            vm.spec.secret_name = secret.clone();
            if !vm.finalizers().iter().any(|f| f == PROVISIONER_FINALIZER) {
                vm.finalizers_mut().push(PROVISIONER_FINALIZER.to_string());
            }
            vm.labels_mut()
                .insert(labels::READY.into(), labels::bool_value(false));
        })
        .await?;
        Ok(())
    }

    /// Open a running VM to static binds; a no-op once labelled
    async fn mark_ready(&self, name: &str) -> Result<()> {
        update_with(self.vms.as_ref(), name, |vm: &mut VirtualMachine| {
            vm.labels_mut()
                .insert(labels::READY.into(), labels::bool_value(true));
        })
        .await?;
        Ok(())
    }

    /// Newest Execution of the State, by creation time
    async fn latest_execution(&self, tfstate: &str) -> Result<Option<Execution>> {
        let executions = self
            .executions
            .list(&LabelSelector::everything().with(labels::STATE, tfstate))
            .await?;
        let created = |e: &Execution| {
            (
                e.meta().creation_timestamp.as_ref().map(|t| t.0),
                e.name_any(),
            )
        };
        Ok(executions
            .into_iter()
            .max_by(|a, b| created(a).cmp(&created(b))))
    }

    async fn collect_outputs(&self, vm: &VirtualMachine) -> Result<Action> {
        let name = vm.name_any();
        let tfstate = vm.tfstate();
        if tfstate.is_empty() {
            warn!("Provisioned VM has no Terraform state");
            return Ok(Action::requeue_with_backoff());
        }
        self.claim_for_teardown(&name).await?;

        let Some(execution) = self.latest_execution(tfstate).await? else {
            debug!(state = %tfstate, "No execution yet");
            return Ok(Action::requeue(self.poll_interval));
        };
        if execution.outputs().is_empty() {
            debug!(execution = %execution.name_any(), "Execution has no outputs yet");
            return Ok(Action::requeue(self.poll_interval));
        }
        let outputs = outputs::parse(&execution.name_any(), execution.outputs())?;

        let public_ip = match outputs.public_ip {
            Some(ip) => ip,
            None => match self.environments.get(vm.environment_id()).await {
                Ok(env) => outputs::translate_ip(&env.spec.ip_translation_map, &outputs.private_ip),
                Err(e) if e.is_not_found() => String::new(),
                Err(e) => return Err(e),
            },
        };

        update_status_with(self.vms.as_ref(), &name, |vm: &mut VirtualMachine| {
            let status = vm.status_mut();
            status.private_ip = outputs.private_ip.clone();
            status.public_ip = public_ip.clone();
            status.hostname = outputs.hostname.clone();
            status.status = VmStatus::Running;
        })
        .await?;
        self.mark_ready(&name).await?;

        metrics::record_vm_transition(VmStatus::Running.as_str());
        info!(private_ip = %outputs.private_ip, public_ip = %public_ip, "VM is running");
        Ok(Action::await_change())
    }
}

fn bytes(s: &str) -> ByteString {
    ByteString(s.as_bytes().to_vec())
}

#[async_trait]
impl Reconciler for VmProvisioner {
    fn name(&self) -> &'static str {
        "provisioner"
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn reconcile(&self, name: &str) -> Result<Action> {
        let vm = match self.vms.get(name).await {
            Ok(vm) => vm,
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e),
        };

        if vm.is_deleting() {
            return self.finalize(&vm).await;
        }
        if vm.is_tainted() {
            return self.reap_tainted(name).await;
        }
        if !vm.spec.provision {
            if vm.label(labels::PROVISIONER) == Some(labels::EXTERNAL_PROVISIONER) {
                debug!("VM is handled by an external provisioner");
            }
            return Ok(Action::await_change());
        }

        match vm.phase() {
            VmStatus::ReadyForProvisioning => self.provision(&vm).await,
            VmStatus::Provisioned => self.collect_outputs(&vm).await,
            VmStatus::Running => {
                self.mark_ready(name).await?;
                Ok(Action::await_change())
            }
            VmStatus::Terminating => Ok(Action::await_change()),
        }
    }
}
