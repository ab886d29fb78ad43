//! VirtualMachineTemplate: an immutable VM recipe

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::CmsStruct;

/// Specification for a VirtualMachineTemplate
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "VirtualMachineTemplate",
    plural = "virtualmachinetemplates",
    shortname = "vmt",
    namespaced,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#
)]
#[serde(default)]
pub struct VirtualMachineTemplateSpec {
    /// Display name
    pub name: String,
    /// Default image; an environment's template mapping may override it
    pub image: String,
    /// Resources every VM of this template requests
    pub resources: CmsStruct,
    /// Extra provisioner settings
    pub config_map: BTreeMap<String, String>,
}
