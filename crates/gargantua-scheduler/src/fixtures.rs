//! Shared builders for reconciler tests

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;

use gargantua_common::crd::{
    CmsStruct, DynamicBindConfiguration, DynamicBindConfigurationSpec, DynamicBindRequest,
    Environment, EnvironmentSpec, VirtualMachine, VirtualMachineClaim, VirtualMachineClaimSpec,
    VirtualMachineSet, VirtualMachineSetSpec, VirtualMachineSpec, VirtualMachineTemplate,
    VirtualMachineTemplateSpec, VmClaimSlot, VmStatus,
};
use gargantua_common::labels;
use gargantua_common::store::{MemoryStore, ObjectStore, StoreObject, StoreProvider};

pub const NAMESPACE: &str = "hobbyfarm";

pub struct Fixture {
    pub store: MemoryStore,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(NAMESPACE),
        }
    }

    pub fn vms(&self) -> Arc<dyn ObjectStore<VirtualMachine>> {
        self.store.store()
    }

    pub fn vmsets(&self) -> Arc<dyn ObjectStore<VirtualMachineSet>> {
        self.store.store()
    }

    pub fn claims(&self) -> Arc<dyn ObjectStore<VirtualMachineClaim>> {
        self.store.store()
    }

    pub fn dbrs(&self) -> Arc<dyn ObjectStore<DynamicBindRequest>> {
        self.store.store()
    }

    pub fn environments(&self) -> Arc<dyn ObjectStore<Environment>> {
        self.store.store()
    }
}

/// Store `obj` with its status, returning the stored copy
pub fn seed<K: StoreObject>(store: &MemoryStore, obj: &K) -> K {
    store.api::<K>().insert(obj).unwrap()
}

pub fn environment(name: &str) -> Environment {
    Environment::new(name, EnvironmentSpec::default())
}

pub fn burst_environment(name: &str, counts: &[(&str, i32)]) -> Environment {
    let mut env = environment(name);
    env.spec.burst_capable = true;
    env.spec.capacity_mode = gargantua_common::crd::CapacityMode::Count;
    env.spec.burst_count_capacity = counts
        .iter()
        .map(|(t, n)| (t.to_string(), *n))
        .collect();
    env
}

pub fn template(name: &str, resources: CmsStruct) -> VirtualMachineTemplate {
    VirtualMachineTemplate::new(
        name,
        VirtualMachineTemplateSpec {
            name: name.into(),
            image: format!("{name}-image"),
            resources,
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

/// A ready, unbound pool VM
pub fn free_vm(name: &str, env: &str, template: &str) -> VirtualMachine {
    let mut vm = VirtualMachine::new(
        name,
        VirtualMachineSpec {
            template_id: template.into(),
            provision: true,
            ..Default::default()
        },
    );
    let l = vm.labels_mut();
    l.insert(labels::BOUND.into(), labels::bool_value(false));
    l.insert(labels::READY.into(), labels::bool_value(true));
    l.insert(labels::TEMPLATE.into(), template.into());
    l.insert(labels::ENVIRONMENT.into(), env.into());
    l.insert(labels::DYNAMIC.into(), labels::bool_value(false));
    labels::set_restricted_bind(l, None);

    let status = vm.status_mut();
    status.status = VmStatus::Running;
    status.environment_id = env.into();
    vm
}

/// A VM created on demand in `env`
pub fn dynamic_vm(name: &str, env: &str, template: &str, dbc: &str) -> VirtualMachine {
    let mut vm = free_vm(name, env, template);
    let l = vm.labels_mut();
    l.insert(labels::DYNAMIC.into(), labels::bool_value(true));
    l.insert(labels::BOUND.into(), labels::bool_value(true));
    l.insert(labels::DYNAMIC_BIND_CONFIGURATION.into(), dbc.into());
    vm.spec.vm_claim_id = "someone-else".into();
    vm.status_mut().allocated = true;
    vm
}

pub fn claim(name: &str, slots: &[(&str, &str)]) -> VirtualMachineClaim {
    VirtualMachineClaim::new(
        name,
        VirtualMachineClaimSpec {
            user_id: "user-1".into(),
            base_name: name.into(),
            virtual_machines: slots
                .iter()
                .map(|(slot, template)| (slot.to_string(), VmClaimSlot::unbound(*template)))
                .collect(),
            ..Default::default()
        },
    )
}

pub fn dbc(name: &str, env: &str, counts: &[(&str, i32)]) -> DynamicBindConfiguration {
    let mut dbc = DynamicBindConfiguration::new(
        name,
        DynamicBindConfigurationSpec {
            environment: env.into(),
            base_name: format!("{env}-burst"),
            burst_count_capacity: counts
                .iter()
                .map(|(t, n)| (t.to_string(), *n))
                .collect(),
            ..Default::default()
        },
    );
    let l = dbc.labels_mut();
    l.insert(labels::ENVIRONMENT.into(), env.into());
    labels::set_restricted_bind(l, None);
    dbc
}
