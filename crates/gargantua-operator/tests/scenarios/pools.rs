//! Stories about pre-provisioned pools: scale-up, provisioning, static
//! binds and scale-down

use kube::ResourceExt;

use gargantua_common::crd::{
    BindMode, CmsStruct, Environment, State, VirtualMachine, VirtualMachineSet, VmStatus,
};
use gargantua_common::labels::{self, LabelSelector};
use gargantua_common::store::update_with;
use gargantua_common::PROVISIONER_FINALIZER;

use crate::harness::{claim, environment, eventually, template, vmset, Operator};

fn pool(name: &str) -> LabelSelector {
    LabelSelector::everything().with(labels::VMSET, name)
}

/// Declare a two-VM pool and drive it through Terraform to ready
///
/// The pool controller creates the VMs, the provisioner hands each one to
/// Terraform, and once the runs finish the VMs come up ready.
async fn provisioned_pool(op: &Operator) -> Vec<String> {
    op.seed(&environment("aws-east"));
    op.seed(&template("ubuntu"));
    op.seed(&vmset("pool", "aws-east", "ubuntu", 2));

    eventually("two pool VMs waiting on Terraform", || async move {
        let vms = op.vms(&pool("pool")).await;
        vms.len() == 2
            && vms
                .iter()
                .all(|vm| vm.phase() == VmStatus::Provisioned && !vm.tfstate().is_empty())
    })
    .await;

    let vms = op.vms(&pool("pool")).await;
    for (i, vm) in vms.iter().enumerate() {
        op.finish_terraform_run(vm, &format!("10.0.1.{}", 10 + i));
    }

    eventually("pool VMs running and ready", || async move {
        op.vms(&pool("pool").with_bool(labels::READY, true))
            .await
            .iter()
            .filter(|vm| vm.phase() == VmStatus::Running)
            .count()
            == 2
    })
    .await;

    vms.iter().map(|vm| vm.name_any()).collect()
}

/// Story: a declared pool comes up with translated public addresses and is
/// reflected in both the pool's and the environment's status
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_pool_comes_up_and_is_accounted() {
    let operator = Operator::start();
    let op = &operator;
    provisioned_pool(op).await;

    for vm in op.vms(&pool("pool")).await {
        let status = vm.observed();
        assert!(status.private_ip.starts_with("10.0.1."));
        assert!(status.public_ip.starts_with("192.0.2."));
        assert_eq!(status.hostname, vm.name_any());
        assert_eq!(status.ws_endpoint, "wss://aws-east.example.com/shell");
        assert!(vm.finalizers().iter().any(|f| f == PROVISIONER_FINALIZER));
    }

    eventually("pool status lists both machines", || async move {
        let set = op.typed::<VirtualMachineSet>().get("pool").await.unwrap();
        set.status.is_some_and(|s| {
            s.available_count == 2
                && s.machines.len() == 2
                && s.machines.iter().all(|m| !m.tfstate.is_empty())
        })
    })
    .await;

    eventually("environment usage covers the pool", || async move {
        let env = op.typed::<Environment>().get("aws-east").await.unwrap();
        env.status.is_some_and(|s| {
            s.used == CmsStruct::new(4, 8192, 40000) && s.available_count.get("ubuntu") == Some(&2)
        })
    })
    .await;

    operator.stop().await;
}

/// Story: a learner's claim is bound to one of the ready pool VMs, which
/// then leaves the free set
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_claim_binds_to_pool_vm() {
    let operator = Operator::start();
    let op = &operator;
    let pooled = provisioned_pool(op).await;

    op.seed(&claim("alice", "ubuntu", false));
    eventually("claim bound", || async move {
        op.claim("alice").await.observed().bound
    })
    .await;

    let claim = op.claim("alice").await;
    assert_eq!(claim.observed().bind_mode, BindMode::Static);
    let vm_id = claim.spec.virtual_machines["node"].vm_id.clone();
    assert!(pooled.contains(&vm_id));

    let vm = op.typed::<VirtualMachine>().get(&vm_id).await.unwrap();
    assert_eq!(vm.spec.vm_claim_id, "alice");
    assert_eq!(vm.spec.user_id, "user-1");
    assert_eq!(vm.label(labels::BOUND), Some("true"));
    assert!(vm.is_allocated());

    let free = op
        .vms(&pool("pool").with_bool(labels::BOUND, false))
        .await;
    assert_eq!(free.len(), 1);
    assert_ne!(free[0].name_any(), vm_id);

    operator.stop().await;
}

/// Story: shrinking a pool to zero taints its VMs, the provisioner tears
/// down their Terraform states, and the VMs disappear once released
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_pool_scales_down_to_nothing() {
    let operator = Operator::start();
    let op = &operator;
    provisioned_pool(op).await;

    update_with(
        op.typed::<VirtualMachineSet>().as_ref(),
        "pool",
        |set: &mut VirtualMachineSet| set.spec.count = 0,
    )
    .await
    .unwrap();

    eventually("pool VMs gone", || async move {
        op.vms(&pool("pool")).await.is_empty()
    })
    .await;
    eventually("Terraform states gone", || async move {
        op.typed::<State>()
            .list(&LabelSelector::everything())
            .await
            .unwrap()
            .is_empty()
    })
    .await;
    eventually("environment usage released", || async move {
        let env = op.typed::<Environment>().get("aws-east").await.unwrap();
        env.status.is_some_and(|s| s.used == CmsStruct::default())
    })
    .await;

    operator.stop().await;
}
