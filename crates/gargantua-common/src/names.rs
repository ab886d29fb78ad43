//! Object naming helpers

use rand::Rng;

/// Eight random lowercase hex digits
pub fn random_suffix() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

/// `base_name-xxxxxxxx`, the name shape of every generated VM and request
pub fn generate_name(base_name: &str) -> String {
    format!("{}-{}", base_name, random_suffix())
}

/// ConfigMap holding a VM's Terraform variables
pub fn config_map_name(vm: &str) -> String {
    format!("{vm}-cm")
}

/// Secret holding a VM's keypair and password
pub fn secret_name(vm: &str) -> String {
    format!("{vm}-secret")
}

/// Terraform State driving a VM
pub fn state_name(vm: &str) -> String {
    format!("{vm}-tfs")
}

/// Work queue key for a namespaced object
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Split a work queue key back into `(namespace, name)`
///
/// A key without a slash is treated as a bare name.
pub fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}
