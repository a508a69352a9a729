use std::collections::BTreeMap;

use serde::Serialize;

pub const CURRENT_ENERGY: &str = "CURRENT ENERGY";
pub const NUCLEAR_REPULSION_ENERGY: &str = "NUCLEAR REPULSION ENERGY";
pub const ONE_ELECTRON_ENERGY: &str = "ONE-ELECTRON ENERGY";
pub const TWO_ELECTRON_ENERGY: &str = "TWO-ELECTRON ENERGY";
pub const SCF_TOTAL_ENERGY: &str = "SCF TOTAL ENERGY";
pub const SCF_ITERATION_ENERGY: &str = "SCF ITERATION ENERGY";
pub const DCFT_TOTAL_ENERGY: &str = "DCFT TOTAL ENERGY";
pub const DCFT_SCF_ENERGY: &str = "DCFT SCF ENERGY";
pub const DCFT_LAMBDA_ENERGY: &str = "DCFT LAMBDA ENERGY";

/// Named scalar results shared between solvers, keyed by their conventional names.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Globals {
    values: BTreeMap<String, f64>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, &v)| (k.as_str(), v))
    }
}
