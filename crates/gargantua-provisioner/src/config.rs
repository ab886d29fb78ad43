//! Terraform variable assembly
//!
//! Variables are layered: environment-wide settings first, then the
//! template's own config map, then the environment's mapping for the
//! template. The VM's identity, public key and sizing are injected last.

use std::collections::BTreeMap;

use kube::ResourceExt;

use gargantua_common::crd::{Environment, VirtualMachine, VirtualMachineTemplate};
use gargantua_common::{Error, Result};

/// Executor image key
pub const EXECUTOR_IMAGE: &str = "executor_image";
/// Terraform module key
pub const MODULE: &str = "module";
/// VM image key
pub const IMAGE: &str = "image";
/// Optional cloud credentials Secret key
pub const CRED_SECRET: &str = "cred_secret";

/// Everything needed to create a VM's ConfigMap and State
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionPlan {
    /// ConfigMap data handed to Terraform as variables
    pub variables: BTreeMap<String, String>,
    /// Terraform module
    pub module: String,
    /// Executor image the State runs with
    pub executor_image: String,
    /// Cloud credentials Secret attached to the State
    pub cred_secret: Option<String>,
}

/// Build the provisioning plan for `vm`
pub fn assemble(
    vm: &VirtualMachine,
    env: &Environment,
    template: &VirtualMachineTemplate,
    public_key: &str,
) -> Result<ProvisionPlan> {
    let vm_name = vm.name_any();
    let mut variables = env.spec.environment_specifics.clone();
    variables.extend(template.spec.config_map.clone());
    if let Some(mapping) = env.template_settings(&template.name_any()) {
        variables.extend(mapping.clone());
    }

    let image = variables
        .get(IMAGE)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| template.spec.image.clone());
    let resources = template.spec.resources;
    variables.insert("name".into(), vm_name.clone());
    variables.insert("public_key".into(), public_key.to_string());
    variables.insert("cpu".into(), resources.cpu.to_string());
    variables.insert("memory".into(), resources.memory.to_string());
    variables.insert("disk".into(), resources.storage.to_string());
    variables.insert(IMAGE.into(), image);

    let required = |key: &str| -> Result<String> {
        variables
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| {
                Error::validation_for_field(
                    &vm_name,
                    format!("config.{key}"),
                    "required setting is empty",
                )
            })
    };
    required(IMAGE)?;
    let module = required(MODULE)?;
    let executor_image = required(EXECUTOR_IMAGE)?;
    let cred_secret = variables.get(CRED_SECRET).filter(|v| !v.is_empty()).cloned();

    Ok(ProvisionPlan {
        variables,
        module,
        executor_image,
        cred_secret,
    })
}
