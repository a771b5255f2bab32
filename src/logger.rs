//! Append-only record of every cost evaluation in an inversion run.
//!
//! The logger is owned by whoever runs the inversion; it lives exactly
//! as long as the caller keeps it.  Entries are plain copies, never
//! references into a tape.

use crate::types::{CostBreakdown, InversionError};
use ndarray::Array2;
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DataLogger {
    /// Per-term breakdown of each evaluation.
    pub c_terms: Vec<CostBreakdown>,
    pub costs: Vec<f64>,
    pub grads: Vec<Vec<f64>>,
    pub beds: Vec<Array2<f64>>,
    pub surfs: Vec<Array2<f64>>,
}

impl DataLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded evaluations.
    pub fn len(&self) -> usize {
        self.costs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.costs.is_empty()
    }

    /// Append one evaluation.  All five sequences grow together.
    pub fn record(
        &mut self,
        breakdown: CostBreakdown,
        cost: f64,
        gradient: Vec<f64>,
        bed: Array2<f64>,
        surface: Array2<f64>,
    ) {
        self.c_terms.push(breakdown);
        self.costs.push(cost);
        self.grads.push(gradient);
        self.beds.push(bed);
        self.surfs.push(surface);
    }

    /// Index of the evaluation with the smallest cost.
    pub fn best(&self) -> Option<usize> {
        self.costs
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_finite())
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
    }

    pub fn to_json(&self) -> Result<String, InversionError> {
        serde_json::to_string(self).map_err(|e| InversionError::Io(e.to_string()))
    }

    pub fn save_json(&self, path: &Path) -> Result<(), InversionError> {
        let data = self.to_json()?;
        fs::write(path, data)
            .map_err(|e| InversionError::Io(format!("failed to write {}: {e}", path.display())))
    }
}
