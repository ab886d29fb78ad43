//! Terraform controller collaborator kinds
//!
//! Gargantua creates and deletes `State` objects and reads the outputs of the
//! `Execution` objects the Terraform controller produces for them. The wire
//! form follows that controller, so keys are camelCase here.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Terraform State
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "terraformcontroller.cattle.io",
    version = "v1",
    kind = "State",
    plural = "states",
    status = "StateStatus",
    namespaced
)]
#[serde(default, rename_all = "camelCase")]
pub struct StateSpec {
    /// Variable sources
    pub variables: Variables,
    /// Executor image
    pub image: String,
    /// Terraform module to apply
    pub module_name: String,
    /// Apply without a manual plan confirmation
    pub auto_confirm: bool,
    /// Run `destroy` when the State is deleted
    pub destroy_on_delete: bool,
}

/// Where a State's Terraform variables come from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Variables {
    /// ConfigMaps whose data become variables
    pub config_names: Vec<String>,
    /// Secrets whose data become variables
    pub secret_names: Vec<String>,
    /// ConfigMaps exported as environment variables
    pub env_config_names: Vec<String>,
    /// Secrets exported as environment variables
    pub env_secret_names: Vec<String>,
}

/// Observed state of a Terraform State
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct StateStatus {
    /// Hash of the last applied run
    pub last_run_hash: String,
    /// Latest Execution
    pub execution_name: String,
}

/// Specification for a Terraform Execution
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "terraformcontroller.cattle.io",
    version = "v1",
    kind = "Execution",
    plural = "executions",
    status = "ExecutionStatus",
    namespaced
)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionSpec {
    /// Name of the run
    pub execution_name: String,
    /// Apply without a manual plan confirmation
    pub auto_confirm: bool,
    /// Hash identifying the run inputs
    pub run_hash: String,
}

/// Observed state of a Terraform Execution
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionStatus {
    /// Job running the executor
    pub job_name: String,
    /// Terraform outputs as a JSON document: `{field: {value: string}}`
    pub outputs: String,
}

impl Execution {
    /// Outputs document, empty until the run finished
    pub fn outputs(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.outputs.as_str())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_keys_are_camel_case() {
        let state = State::new(
            "vm-1-tfs",
            StateSpec {
                variables: Variables {
                    config_names: vec!["vm-1-cm".into()],
                    secret_names: vec!["aws-creds".into()],
                    ..Default::default()
                },
                image: "terraform-executor:v1".into(),
                module_name: "aws-vm".into(),
                auto_confirm: true,
                destroy_on_delete: true,
            },
        );
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["apiVersion"], "terraformcontroller.cattle.io/v1");
        assert_eq!(value["spec"]["variables"]["configNames"][0], "vm-1-cm");
        assert_eq!(value["spec"]["variables"]["secretNames"][0], "aws-creds");
        assert_eq!(value["spec"]["moduleName"], "aws-vm");
        assert_eq!(value["spec"]["autoConfirm"], true);
        assert_eq!(value["spec"]["destroyOnDelete"], true);
    }
}
