//! Operator harness and catalog builders shared by the scenarios

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use gargantua_common::crd::{
    CapacityMode, CmsStruct, DynamicBindConfiguration, DynamicBindConfigurationSpec,
    Environment, EnvironmentSpec, Execution, ExecutionSpec, ExecutionStatus, VirtualMachine,
    VirtualMachineClaim, VirtualMachineClaimSpec, VirtualMachineSet, VirtualMachineSetSpec,
    VirtualMachineTemplate, VirtualMachineTemplateSpec, VmClaimSlot,
};
use gargantua_common::labels::{self, LabelSelector};
use gargantua_common::store::{MemoryStore, ObjectStore, StoreObject, StoreProvider};
use gargantua_operator::{controller_runner, OperatorConfig};

pub const NAMESPACE: &str = "hobbyfarm";

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);

/// A running operator over a shared in-memory store
pub struct Operator {
    pub store: MemoryStore,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Operator {
    pub fn start() -> Self {
        let store = MemoryStore::new(NAMESPACE);
        let config = OperatorConfig {
            provision_poll_interval: Duration::from_millis(50),
            ..OperatorConfig::for_namespace(NAMESPACE)
        };
        let shutdown = CancellationToken::new();

        let stores = store.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            controller_runner::run(&stores, &config, token).await;
        });
        Self {
            store,
            shutdown,
            handle,
        }
    }

    /// Cancel and wait for every controller to exit
    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(CONVERGE_TIMEOUT, self.handle)
            .await
            .expect("operator stops in time")
            .expect("operator task does not panic");
    }

    pub fn seed<K: StoreObject>(&self, obj: &K) -> K {
        self.store.api::<K>().insert(obj).unwrap()
    }

    pub fn typed<K: StoreObject>(&self) -> Arc<dyn ObjectStore<K>> {
        self.store.store()
    }

    pub async fn vms(&self, selector: &LabelSelector) -> Vec<VirtualMachine> {
        self.typed::<VirtualMachine>().list(selector).await.unwrap()
    }

    pub async fn claim(&self, name: &str) -> VirtualMachineClaim {
        self.typed::<VirtualMachineClaim>().get(name).await.unwrap()
    }

    /// Act as the Terraform controller: report a finished run for `vm`
    pub fn finish_terraform_run(&self, vm: &VirtualMachine, private_ip: &str) {
        let mut execution =
            Execution::new(&format!("{}-run", vm.name_any()), ExecutionSpec::default());
        execution
            .labels_mut()
            .insert(labels::STATE.into(), vm.tfstate().to_string());
        execution.status = Some(ExecutionStatus {
            job_name: "job".into(),
            outputs: format!(
                r#"{{"private_ip":{{"value":"{private_ip}"}},"hostname":{{"value":"{}"}}}}"#,
                vm.name_any()
            ),
        });
        self.seed(&execution);
    }
}

/// Poll `check` until it holds, panicking after the convergence timeout
pub async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("timed out waiting for {what}");
}

fn pairs(items: &[(&str, &str)]) -> BTreeMap<String, String> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Environment with a complete Terraform configuration
pub fn environment(name: &str) -> Environment {
    Environment::new(
        name,
        EnvironmentSpec {
            display_name: name.to_uppercase(),
            ws_endpoint: format!("wss://{name}.example.com/shell"),
            environment_specifics: pairs(&[
                ("module", "vm-module"),
                ("executor_image", "terraform-executor:v1"),
            ]),
            ip_translation_map: pairs(&[("10.0.1", "192.0.2")]),
            ..Default::default()
        },
    )
}

/// Environment that may create VMs on demand, counted per template
pub fn burst_environment(name: &str, template: &str, count: i32) -> Environment {
    let mut env = environment(name);
    env.spec.burst_capable = true;
    env.spec.capacity_mode = CapacityMode::Count;
    env.spec.burst_count_capacity = BTreeMap::from([(template.to_string(), count)]);
    env
}

pub fn template(name: &str) -> VirtualMachineTemplate {
    VirtualMachineTemplate::new(
        name,
        VirtualMachineTemplateSpec {
            name: name.into(),
            image: format!("{name}-image"),
            resources: CmsStruct::new(2, 4096, 20000),
            config_map: BTreeMap::new(),
        },
    )
}

pub fn vmset(name: &str, env: &str, template: &str, count: i32) -> VirtualMachineSet {
    VirtualMachineSet::new(
        name,
        VirtualMachineSetSpec {
            count,
            environment: env.into(),
            vm_template: template.into(),
            base_name: name.into(),
            ..Default::default()
        },
    )
}

pub fn claim(name: &str, template: &str, dynamic: bool) -> VirtualMachineClaim {
    VirtualMachineClaim::new(
        name,
        VirtualMachineClaimSpec {
            user_id: "user-1".into(),
            base_name: name.into(),
            virtual_machines: BTreeMap::from([(
                "node".to_string(),
                VmClaimSlot::unbound(template),
            )]),
            dynamic_bind_capable: dynamic,
            ..Default::default()
        },
    )
}

pub fn dbc(name: &str, env: &str, template: &str, count: i32) -> DynamicBindConfiguration {
    let mut dbc = DynamicBindConfiguration::new(
        name,
        DynamicBindConfigurationSpec {
            environment: env.into(),
            base_name: format!("{env}-burst"),
            burst_count_capacity: BTreeMap::from([(template.to_string(), count)]),
            ..Default::default()
        },
    );
    let l = dbc.labels_mut();
    l.insert(labels::ENVIRONMENT.into(), env.into());
    labels::set_restricted_bind(l, None);
    dbc
}
