//! Terraform Execution outputs and IP translation

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use gargantua_common::{Error, Result};

/// Addresses a finished Terraform run reported for a VM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmOutputs {
    /// Address inside the environment's network
    pub private_ip: String,
    /// Routable address, when the module reports one
    pub public_ip: Option<String>,
    /// Host name
    pub hostname: String,
}

#[derive(Deserialize)]
struct Output {
    #[serde(default)]
    value: Value,
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse an Execution's `status.outputs` document, `{field: {value: ...}}`
pub fn parse(execution: &str, raw: &str) -> Result<VmOutputs> {
    let doc: BTreeMap<String, Output> = serde_json::from_str(raw)
        .map_err(|e| Error::serialization_for_kind("Execution", e.to_string()))?;
    let field = |key: &str| doc.get(key).and_then(|o| text(&o.value));

    let required = |key: &str| {
        field(key).ok_or_else(|| {
            Error::validation_for_field(execution, format!("outputs.{key}"), "missing output")
        })
    };
    Ok(VmOutputs {
        private_ip: required("private_ip")?,
        public_ip: field("public_ip"),
        hostname: required("hostname")?,
    })
}

/// Public address for `private_ip` through a /24 translation map
///
/// Map keys are the first three octets of the private network, either bare
/// (`10.0.1`) or in CIDR form (`10.0.1.0/24`); values use the same forms for
/// the public network. Unknown prefixes translate to the empty string.
pub fn translate_ip(map: &BTreeMap<String, String>, private_ip: &str) -> String {
    let Some((prefix, host)) = private_ip.rsplit_once('.') else {
        return String::new();
    };
    let target = map
        .get(prefix)
        .or_else(|| map.get(&format!("{prefix}.0/24")));
    match target {
        Some(target) => {
            let target = target.strip_suffix(".0/24").unwrap_or(target);
            format!("{target}.{host}")
        }
        None => String::new(),
    }
}
