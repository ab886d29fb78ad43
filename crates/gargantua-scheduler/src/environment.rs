//! Environment usage accounting
//!
//! `status.used` and `status.available_count` are derived purely from the
//! VMs attributed to the environment through `status.environment_id`. The
//! inventory can be served from an informer cache with
//! [`EnvironmentAccountant::with_inventory`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use gargantua_common::crd::{
    CmsStruct, Environment, TemplateCounts, VirtualMachine, VirtualMachineTemplate,
};
use gargantua_common::labels::LabelSelector;
use gargantua_common::store::{update_status_with, ObjectStore, StoreProvider};
use gargantua_common::Result;
use gargantua_runtime::{Action, Reconciler};

/// Keeps each Environment's usage in step with its VMs
pub struct EnvironmentAccountant {
    environments: Arc<dyn ObjectStore<Environment>>,
    templates: Arc<dyn ObjectStore<VirtualMachineTemplate>>,
    vms: Arc<dyn ObjectStore<VirtualMachine>>,
}

impl EnvironmentAccountant {
    /// Accountant reading and writing through `stores`
    pub fn new(stores: &impl StoreProvider) -> Self {
        Self {
            environments: stores.store(),
            templates: stores.store(),
            vms: stores.store(),
        }
    }

    /// Read the VM inventory from `vms` instead, typically a cached store
    pub fn with_inventory(mut self, vms: Arc<dyn ObjectStore<VirtualMachine>>) -> Self {
        self.vms = vms;
        self
    }
}

#[async_trait]
impl Reconciler for EnvironmentAccountant {
    fn name(&self) -> &'static str {
        "environment"
    }

    #[instrument(skip(self), fields(environment = %name))]
    async fn reconcile(&self, name: &str) -> Result<Action> {
        match self.environments.get(name).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e),
        }

        let inventory: Vec<VirtualMachine> = self
            .vms
            .list(&LabelSelector::everything())
            .await?
            .into_iter()
            .filter(|vm| vm.environment_id() == name)
            .collect();

        let mut resources: BTreeMap<String, Option<CmsStruct>> = BTreeMap::new();
        let mut used = CmsStruct::default();
        let mut available = TemplateCounts::new();
        let mut missing = false;

        for vm in &inventory {
            let template = &vm.spec.template_id;
            if !resources.contains_key(template) {
                let found = match self.templates.get(template).await {
                    Ok(t) => Some(t.spec.resources),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                };
                resources.insert(template.clone(), found);
            }
            match resources.get(template).copied().flatten() {
                Some(r) => used = used.plus(r),
                None => missing = true,
            }
            if !vm.is_allocated() {
                *available.entry(template.clone()).or_insert(0) += 1;
            }
        }

        update_status_with(
            self.environments.as_ref(),
            name,
            |env: &mut Environment| {
                let status = env.status_mut();
                status.used = used;
                status.available_count = available.clone();
            },
        )
        .await?;
        debug!(vms = inventory.len(), ?used, "Accounted environment usage");

        if missing {
            warn!("Some VMs reference unknown templates; usage is understated");
            return Ok(Action::requeue_with_backoff());
        }
        Ok(Action::await_change())
    }
}
