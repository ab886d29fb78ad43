//! Controller runner - wires informers, queues and the five controllers
//!
//! Every watched kind gets one shared [`Informer`]. Dispatch loops fan its
//! events out to the queues of the controllers that care, and each
//! controller runs a single worker over its own queue. The `build_*`
//! functions return boxed futures so the caller decides how to compose them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use gargantua_common::crd::{
    DynamicBindRequest, Environment, Execution, VirtualMachine, VirtualMachineClaim,
    VirtualMachineSet,
};
use gargantua_common::labels;
use gargantua_common::store::StoreProvider;
use gargantua_provisioner::VmProvisioner;
use gargantua_runtime::dispatch::{dispatch, enqueue_self, key_for, related_keys};
use gargantua_runtime::{
    Cache, Controller, Informer, InformerEvent, RateLimiter, Reconciler, WorkQueue,
};
use gargantua_scheduler::{
    DynamicBindReconciler, EnvironmentAccountant, VmClaimReconciler, VmSetReconciler,
};

use crate::config::OperatorConfig;

/// A long-running task of the operator
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One shared informer per watched kind
pub struct Informers {
    /// VirtualMachineSets
    pub vmsets: Arc<Informer<VirtualMachineSet>>,
    /// VirtualMachines
    pub vms: Arc<Informer<VirtualMachine>>,
    /// VirtualMachineClaims
    pub claims: Arc<Informer<VirtualMachineClaim>>,
    /// DynamicBindRequests
    pub requests: Arc<Informer<DynamicBindRequest>>,
    /// Environments
    pub environments: Arc<Informer<Environment>>,
    /// Terraform Executions
    pub executions: Arc<Informer<Execution>>,
}

impl Informers {
    /// Informers over the stores of `stores`
    pub fn new<P: StoreProvider>(stores: &P, resync: Option<Duration>) -> Self {
        let namespace = stores.namespace();
        Self {
            vmsets: Arc::new(Informer::new(namespace, stores.store(), resync)),
            vms: Arc::new(Informer::new(namespace, stores.store(), resync)),
            claims: Arc::new(Informer::new(namespace, stores.store(), resync)),
            requests: Arc::new(Informer::new(namespace, stores.store(), resync)),
            environments: Arc::new(Informer::new(namespace, stores.store(), resync)),
            executions: Arc::new(Informer::new(namespace, stores.store(), resync)),
        }
    }

    /// Watch futures, one per kind
    pub fn run(&self, shutdown: CancellationToken) -> Vec<ControllerFuture> {
        vec![
            Box::pin(self.vmsets.clone().run(shutdown.clone())),
            Box::pin(self.vms.clone().run(shutdown.clone())),
            Box::pin(self.claims.clone().run(shutdown.clone())),
            Box::pin(self.requests.clone().run(shutdown.clone())),
            Box::pin(self.environments.clone().run(shutdown.clone())),
            Box::pin(self.executions.clone().run(shutdown)),
        ]
    }

    /// Resolves once every informer has cached its first snapshot
    pub fn synced(&self) -> impl Future<Output = ()> + Send + 'static {
        let vmsets = self.vmsets.clone();
        let vms = self.vms.clone();
        let claims = self.claims.clone();
        let requests = self.requests.clone();
        let environments = self.environments.clone();
        let executions = self.executions.clone();
        async move {
            tokio::join!(
                vmsets.wait_for_sync(),
                vms.wait_for_sync(),
                claims.wait_for_sync(),
                requests.wait_for_sync(),
                environments.wait_for_sync(),
                executions.wait_for_sync(),
            );
        }
    }
}

/// One work queue per controller
#[derive(Clone)]
pub struct Queues {
    /// VMSet controller
    pub vmset: WorkQueue,
    /// VMClaim controller
    pub vmclaim: WorkQueue,
    /// DynamicBindRequest controller
    pub dynamic_bind: WorkQueue,
    /// VM provisioner
    pub provisioner: WorkQueue,
    /// Environment accountant
    pub environment: WorkQueue,
}

impl Default for Queues {
    fn default() -> Self {
        Self {
            vmset: WorkQueue::delaying("vmset"),
            vmclaim: WorkQueue::rate_limited("vmclaim", RateLimiter::default()),
            dynamic_bind: WorkQueue::rate_limited("dynamicbind", RateLimiter::default()),
            provisioner: WorkQueue::rate_limited("provisioner", RateLimiter::default()),
            environment: WorkQueue::delaying("environment"),
        }
    }
}

/// Keys of the VMs whose Terraform State produced an Execution
pub fn execution_owners(
    vms: &Cache<VirtualMachine>,
    event: &InformerEvent<Execution>,
) -> Vec<String> {
    let execution = event.object();
    let Some(state) = execution.labels().get(labels::STATE) else {
        return Vec::new();
    };
    vms.find(|vm| vm.tfstate() == state)
        .iter()
        .map(|vm| key_for(vm.as_ref(), &vm.name_any()))
        .collect()
}

/// Fan-in loops from informer events to controller queues
pub fn build_dispatchers(informers: &Informers, queues: &Queues) -> Vec<ControllerFuture> {
    let vm_cache = informers.vms.cache();
    vec![
        // VMSet queue
        Box::pin(dispatch(
            informers.vmsets.subscribe(),
            queues.vmset.clone(),
            enqueue_self,
        )),
        Box::pin(dispatch(
            informers.vms.subscribe(),
            queues.vmset.clone(),
            |event: &InformerEvent<VirtualMachine>| {
                related_keys(event, |vm| vm.label(labels::VMSET).map(String::from))
            },
        )),
        // VMClaim queue
        Box::pin(dispatch(
            informers.claims.subscribe(),
            queues.vmclaim.clone(),
            enqueue_self,
        )),
        Box::pin(dispatch(
            informers.vms.subscribe(),
            queues.vmclaim.clone(),
            |event: &InformerEvent<VirtualMachine>| {
                related_keys(event, |vm| Some(vm.spec.vm_claim_id.clone()))
            },
        )),
        Box::pin(dispatch(
            informers.requests.subscribe(),
            queues.vmclaim.clone(),
            |event: &InformerEvent<DynamicBindRequest>| {
                related_keys(event, |request| Some(request.spec.vm_claim.clone()))
            },
        )),
        // DynamicBindRequest queue
        Box::pin(dispatch(
            informers.requests.subscribe(),
            queues.dynamic_bind.clone(),
            enqueue_self,
        )),
        // Provisioner queue
        Box::pin(dispatch(
            informers.vms.subscribe(),
            queues.provisioner.clone(),
            enqueue_self,
        )),
        Box::pin(dispatch(
            informers.executions.subscribe(),
            queues.provisioner.clone(),
            move |event: &InformerEvent<Execution>| execution_owners(&vm_cache, event),
        )),
        // Environment queue
        Box::pin(dispatch(
            informers.environments.subscribe(),
            queues.environment.clone(),
            enqueue_self,
        )),
        Box::pin(dispatch(
            informers.vms.subscribe(),
            queues.environment.clone(),
            |event: &InformerEvent<VirtualMachine>| {
                related_keys(event, |vm| Some(vm.environment_id().to_string()))
            },
        )),
    ]
}

fn controller<R: Reconciler>(
    reconciler: R,
    queue: &WorkQueue,
    shutdown: &CancellationToken,
) -> ControllerFuture {
    Box::pin(Controller::new(Arc::new(reconciler), queue.clone()).run(shutdown.clone()))
}

/// Build the five controller futures
///
/// Reconcilers read and write through `stores`, except for the high-volume
/// inventory and Execution lookups, which are served from informer caches.
pub fn build_controllers<P: StoreProvider>(
    stores: &P,
    config: &OperatorConfig,
    informers: &Informers,
    queues: &Queues,
    shutdown: &CancellationToken,
) -> Vec<ControllerFuture> {
    tracing::info!("- VirtualMachineSet controller");
    let vmset = controller(VmSetReconciler::new(stores), &queues.vmset, shutdown);

    tracing::info!("- VirtualMachineClaim controller");
    let vmclaim = controller(
        VmClaimReconciler::new(stores).with_dynamic_bind_attempts(config.dynamic_bind_attempts),
        &queues.vmclaim,
        shutdown,
    );

    tracing::info!("- DynamicBindRequest controller");
    let dynamic_bind = controller(
        DynamicBindReconciler::new(stores),
        &queues.dynamic_bind,
        shutdown,
    );

    tracing::info!("- VirtualMachine provisioner");
    let provisioner = controller(
        VmProvisioner::new(stores)
            .with_poll_interval(config.provision_poll_interval)
            .with_executions(Arc::new(informers.executions.cached_store())),
        &queues.provisioner,
        shutdown,
    );

    tracing::info!("- Environment accountant");
    let environment = controller(
        EnvironmentAccountant::new(stores).with_inventory(Arc::new(informers.vms.cached_store())),
        &queues.environment,
        shutdown,
    );

    vec![vmset, vmclaim, dynamic_bind, provisioner, environment]
}

/// Run the operator until `shutdown` fires
///
/// Informers and dispatch loops start first. Controllers start once every
/// cache holds its first snapshot, so no reconcile sees a partial view.
pub async fn run<P: StoreProvider>(
    stores: &P,
    config: &OperatorConfig,
    shutdown: CancellationToken,
) {
    let informers = Informers::new(stores, config.resync);
    let queues = Queues::default();

    let mut tasks = informers.run(shutdown.clone());
    tasks.extend(build_dispatchers(&informers, &queues));

    info!(namespace = %stores.namespace(), "Starting controllers");
    let controllers = build_controllers(stores, config, &informers, &queues, &shutdown);
    let synced = informers.synced();
    tasks.push(Box::pin(async move {
        tokio::select! {
            _ = synced => {}
            _ = shutdown.cancelled() => return,
        }
        info!("Caches synced");
        join_all(controllers).await;
    }));

    join_all(tasks).await;
    info!("Controllers stopped");
}
