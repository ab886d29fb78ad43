//! Stories about claims served by on-demand VMs

use kube::ResourceExt;

use gargantua_common::crd::{BindMode, DynamicBindRequest, VirtualMachine, VmStatus};
use gargantua_common::labels::{self, LabelSelector};

use crate::harness::{burst_environment, claim, dbc, eventually, template, Operator};

/// Story: with no pool to draw from, a dynamic-capable claim asks for a VM,
/// the burst configuration creates one for it, and the VM is provisioned
/// like any other
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_claim_falls_back_to_dynamic_bind() {
    let operator = Operator::start();
    let op = &operator;
    op.seed(&burst_environment("gcp-west", "ubuntu", 3));
    op.seed(&template("ubuntu"));
    op.seed(&dbc("gcp-burst", "gcp-west", "ubuntu", 3));
    op.seed(&claim("bob", "ubuntu", true));

    eventually("claim bound dynamically", || async move {
        op.claim("bob").await.observed().bound
    })
    .await;

    let claim = op.claim("bob").await;
    let status = claim.observed();
    assert_eq!(status.bind_mode, BindMode::Dynamic);
    assert!(!status.dynamic_bind_request_id.is_empty());

    let request = op
        .typed::<DynamicBindRequest>()
        .get(&status.dynamic_bind_request_id)
        .await
        .unwrap();
    let observed = request.observed();
    assert!(observed.fulfilled);
    assert_eq!(observed.dynamic_bind_configuration_id, "gcp-burst");

    let vm_id = claim.spec.virtual_machines["node"].vm_id.clone();
    assert_eq!(observed.virtual_machines_id.get("node"), Some(&vm_id));
    let vm = op.typed::<VirtualMachine>().get(&vm_id).await.unwrap();
    assert_eq!(vm.spec.vm_claim_id, "bob");
    assert_eq!(vm.label(labels::DYNAMIC), Some("true"));
    assert_eq!(vm.environment_id(), "gcp-west");
    assert!(vm.is_allocated());
    assert!(vm
        .owner_references()
        .iter()
        .any(|o| o.name == request.name_any()));

    eventually("dynamic VM handed to Terraform", || {
        let vm_id = vm_id.clone();
        async move {
            let vm = op.typed::<VirtualMachine>().get(&vm_id).await.unwrap();
            vm.phase() == VmStatus::Provisioned
        }
    })
    .await;
    let vm = op.typed::<VirtualMachine>().get(&vm_id).await.unwrap();
    op.finish_terraform_run(&vm, "10.0.1.99");
    eventually("dynamic VM running", || {
        let vm_id = vm_id.clone();
        async move {
            let vm = op.typed::<VirtualMachine>().get(&vm_id).await.unwrap();
            vm.phase() == VmStatus::Running && vm.label(labels::READY) == Some("true")
        }
    })
    .await;

    operator.stop().await;
}

/// Story: when no burst configuration has room, the request runs out of
/// attempts and the claim stays unbound without any VM being created
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_exhausted_request_expires() {
    let operator = Operator::start();
    let op = &operator;
    op.seed(&burst_environment("gcp-west", "ubuntu", 0));
    op.seed(&template("ubuntu"));
    op.seed(&dbc("gcp-burst", "gcp-west", "ubuntu", 0));
    op.seed(&claim("carol", "ubuntu", true));

    eventually("request expired", || async move {
        op.typed::<DynamicBindRequest>()
            .list(&LabelSelector::everything())
            .await
            .unwrap()
            .iter()
            .any(|r| r.spec.vm_claim == "carol" && r.observed().expired)
    })
    .await;

    let requests: Vec<DynamicBindRequest> = op
        .typed::<DynamicBindRequest>()
        .list(&LabelSelector::everything())
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.spec.vm_claim == "carol")
        .collect();
    assert_eq!(requests.len(), 1);
    let observed = requests[0].observed();
    assert!(!observed.fulfilled);
    assert!(observed.current_attempts > requests[0].spec.attempts);

    assert!(op.vms(&LabelSelector::everything()).await.is_empty());
    assert!(!op.claim("carol").await.observed().bound);

    operator.stop().await;
}
