//! Local mean squared difference with a hand-written backward rule.
//!
//! Forward:  `Σ (model_surf − surface_to_match)² / Σ ice_region`
//!
//! Backward: `∂/∂model_surf = (model_surf − surface_to_match) · ice_mask`
//! (times the upstream scalar), nothing for the other four inputs.
//! The rule is intentionally not the analytic derivative of the forward
//! value (no factor 2, no normaliser).  `ice_region` normalises,
//! `ice_mask` gates the gradient; callers may pass different masks.

use crate::tape::{CustomFunction, Tape, Var};
use ndarray::Array2;

/// Input slots, in the order they are passed to the tape.
const MODEL_SURF: usize = 0;
const SURFACE_TO_MATCH: usize = 1;
const ICE_REGION: usize = 2;
const ICE_MASK: usize = 3;
/// model_surf, surface_to_match, ice_region, ice_mask, bed
const NUM_INPUTS: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMeanSquaredDifference;

impl CustomFunction for LocalMeanSquaredDifference {
    fn name(&self) -> &'static str {
        "local_mean_squared_difference"
    }

    fn forward(&self, inputs: &[&Array2<f64>]) -> Array2<f64> {
        let diff = inputs[MODEL_SURF] - inputs[SURFACE_TO_MATCH];
        let msd = diff.mapv(|d| d * d).sum() / inputs[ICE_REGION].sum();
        Array2::from_elem((1, 1), msd)
    }

    fn backward(
        &self,
        grad_output: &Array2<f64>,
        inputs: &[&Array2<f64>],
    ) -> Vec<Option<Array2<f64>>> {
        let upstream = grad_output[[0, 0]];
        let grad_model_surf =
            (inputs[MODEL_SURF] - inputs[SURFACE_TO_MATCH]) * inputs[ICE_MASK] * upstream;

        // surface_to_match, ice_region, ice_mask and bed get nothing.
        let mut grads = vec![None; NUM_INPUTS];
        grads[MODEL_SURF] = Some(grad_model_surf);
        grads
    }
}

/// Record the term on `tape` and return its (unweighted) scalar.
pub fn local_mean_squared_difference(
    tape: &mut Tape,
    modelled_surf: Var,
    surface_to_match: Var,
    ice_region: Var,
    ice_mask: Var,
    bed: Var,
) -> Var {
    tape.apply_custom(
        LocalMeanSquaredDifference,
        &[modelled_surf, surface_to_match, ice_region, ice_mask, bed],
    )
}
