//! JSON run settings for an inversion.

use crate::forward::{LinearMassBalance, ShallowIceModel};
use crate::types::{InversionError, Lambdas, SolverOptions};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Settings for one inversion run.  Every section has defaults, so a
/// config file only needs what differs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InversionConfig {
    /// Forward-run duration (a).
    pub years_to_run: f64,
    /// Grid spacing (m).
    pub dx: f64,
    pub lambdas: Lambdas,
    pub mass_balance: LinearMassBalance,
    pub ice_flow: ShallowIceModel,
    pub solver: SolverOptions,
    /// Attach a [`crate::DataLogger`] in [`crate::CostFunction::from_config`].
    pub log_iterations: bool,
}

impl Default for InversionConfig {
    fn default() -> Self {
        Self {
            years_to_run: 200.0,
            dx: 100.0,
            lambdas: Lambdas::zeros(),
            mass_balance: LinearMassBalance::default(),
            ice_flow: ShallowIceModel::default(),
            solver: SolverOptions::default(),
            log_iterations: false,
        }
    }
}

impl InversionConfig {
    pub fn from_json(data: &str) -> Result<Self, InversionError> {
        let config: Self =
            serde_json::from_str(data).map_err(|e| InversionError::Config(e.to_string()))?;
        config.lambdas.validate()?;
        Ok(config)
    }
}

pub fn load_config(path: &Path) -> Result<InversionConfig, InversionError> {
    let data = fs::read_to_string(path)
        .map_err(|e| InversionError::Config(format!("failed to read config {}: {e}", path.display())))?;
    InversionConfig::from_json(&data)
        .map_err(|e| InversionError::Config(format!("failed to parse config {}: {e}", path.display())))
}
