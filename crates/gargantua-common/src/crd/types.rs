//! Value types shared by several resource kinds

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CPU, memory and storage triple
///
/// CPU is in cores, memory and storage in megabytes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct CmsStruct {
    /// CPU cores
    pub cpu: i32,
    /// Memory in MB
    pub memory: i32,
    /// Storage in MB
    pub storage: i32,
}

impl CmsStruct {
    /// Construct a triple
    pub fn new(cpu: i32, memory: i32, storage: i32) -> Self {
        Self {
            cpu,
            memory,
            storage,
        }
    }

    /// Component-wise sum
    ///
    /// All three operations saturate at the `i32` bounds, so an oversized
    /// demand stays too big to fit instead of wrapping negative.
    pub fn plus(self, other: CmsStruct) -> Self {
        Self {
            cpu: self.cpu.saturating_add(other.cpu),
            memory: self.memory.saturating_add(other.memory),
            storage: self.storage.saturating_add(other.storage),
        }
    }

    /// Component-wise difference
    pub fn minus(self, other: CmsStruct) -> Self {
        Self {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
            storage: self.storage.saturating_sub(other.storage),
        }
    }

    /// Scale every component by `n`
    pub fn times(self, n: i32) -> Self {
        Self {
            cpu: self.cpu.saturating_mul(n),
            memory: self.memory.saturating_mul(n),
            storage: self.storage.saturating_mul(n),
        }
    }

    /// How many copies of `demand` fit into `self`
    ///
    /// Components the demand does not use are ignored. A demand of all zeros
    /// fits without limit and returns `i32::MAX`. Negative headroom fits zero.
    pub fn fits(self, demand: CmsStruct) -> i32 {
        [
            (self.cpu, demand.cpu),
            (self.memory, demand.memory),
            (self.storage, demand.storage),
        ]
        .into_iter()
        .filter(|(_, need)| *need > 0)
        .map(|(have, need)| (have / need).max(0))
        .min()
        .unwrap_or(i32::MAX)
    }
}

/// How an environment budgets its capacity
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CapacityMode {
    /// Totals of CPU, memory and storage
    #[default]
    Raw,
    /// Per-template VM counts
    Count,
}

/// Read the wire pair `restricted_bind` / `restricted_bind_value` as an option
pub fn restricted_value(restricted_bind: bool, value: &str) -> Option<&str> {
    restricted_bind.then_some(value)
}

/// Count entries per template
pub type TemplateCounts = BTreeMap<String, i32>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(CmsStruct::new(8, 16384, 100000), CmsStruct::new(2, 4096, 10000), 4)]
    #[case(CmsStruct::new(8, 2048, 100000), CmsStruct::new(2, 4096, 10000), 0)]
    #[case(CmsStruct::new(8, 16384, 0), CmsStruct::new(2, 4096, 0), 4)]
    #[case(CmsStruct::new(-2, 16384, 0), CmsStruct::new(2, 4096, 0), 0)]
    #[case(CmsStruct::new(1, 1, 1), CmsStruct::default(), i32::MAX)]
    fn test_fits(#[case] have: CmsStruct, #[case] demand: CmsStruct, #[case] expected: i32) {
        assert_eq!(have.fits(demand), expected);
    }

    #[test]
    fn test_arithmetic() {
        let a = CmsStruct::new(2, 4096, 10000);
        assert_eq!(a.plus(a), a.times(2));
        assert_eq!(a.times(3).minus(a), a.times(2));
    }

    /// Story: a template asking for absurd memory, claimed many times over,
    /// must still be refused instead of wrapping into a negative demand
    #[test]
    fn story_oversized_demand_never_fits() {
        let template = CmsStruct::new(1, i32::MAX / 2, 0);
        let demand = template.times(3);
        assert_eq!(demand.memory, i32::MAX);
        assert_eq!(demand.plus(template).memory, i32::MAX);

        let burst = CmsStruct::new(64, 262144, 0);
        assert_eq!(burst.fits(demand), 0);

        let overdrawn = CmsStruct::new(i32::MIN, 0, 0).minus(CmsStruct::new(1, 0, 0));
        assert_eq!(overdrawn.cpu, i32::MIN);
    }

    #[test]
    fn test_capacity_mode_wire_form() {
        assert_eq!(serde_json::to_string(&CapacityMode::Count).unwrap(), "\"count\"");
        assert_eq!(
            serde_json::from_str::<CapacityMode>("\"raw\"").unwrap(),
            CapacityMode::Raw
        );
    }

    #[test]
    fn test_restricted_value() {
        assert_eq!(restricted_value(true, "acme"), Some("acme"));
        assert_eq!(restricted_value(false, "acme"), None);
    }
}
