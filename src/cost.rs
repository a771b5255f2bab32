//! Cost function: forward run, regularised objective, bed gradient.
//!
//! [`CostFunction::new`] precomputes the reference state once;
//! [`CostFunction::evaluate`] is the optimiser-facing call
//! `flat bed → (cost, gradient)`.  Each call records a fresh tape and
//! drops it before returning.

use crate::config::InversionConfig;
use crate::forward::{run_forward, ForwardModel, MassBalanceModel};
use crate::logger::DataLogger;
use crate::masks;
use crate::tape::{Tape, Var};
use crate::terms::{get_costs, TermContext};
use crate::types::{
    check_shape, CostBreakdown, CostInformation, Evaluation, InversionError, Lambdas,
    ReferenceInputs, RegularizationTerm,
};
use log::debug;
use ndarray::Array2;

// ─────────────────────────────────────────────────────────────
//  Reference state  (immutable after construction)
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReferenceState {
    pub spinup_surf: Array2<f64>,
    pub ref_surf: Array2<f64>,
    pub ref_ice_mask: Array2<f64>,
    pub ref_inner_mask: Array2<f64>,
    /// Grid spacing (m).
    pub dx: f64,
    /// Forward-run duration (a).
    pub years_to_run: f64,
}

impl ReferenceState {
    pub fn new(inputs: ReferenceInputs, years_to_run: f64, dx: f64) -> Result<Self, InversionError> {
        let shape = inputs.ref_surf.dim();
        if shape.0 < 3 || shape.1 < 3 {
            return Err(InversionError::Shape(format!(
                "grid must be at least 3×3, got {shape:?}"
            )));
        }
        check_shape("spinup surface", &inputs.spinup_surf, shape)?;
        check_shape("reference ice mask", &inputs.ref_ice_mask, shape)?;
        for (name, field) in [("spinup surface", &inputs.spinup_surf), ("reference surface", &inputs.ref_surf)] {
            if field.iter().any(|v| !v.is_finite()) {
                return Err(InversionError::NonFinite(name.into()));
            }
        }
        if let Some(v) = inputs.ref_ice_mask.iter().find(|&&v| v != 0.0 && v != 1.0) {
            return Err(InversionError::InvalidMask(format!(
                "reference ice mask must be 0 or 1, found {v}"
            )));
        }
        if !(dx.is_finite() && dx > 0.0) {
            return Err(InversionError::Config(format!("grid spacing must be positive, got {dx}")));
        }
        if !(years_to_run.is_finite() && years_to_run >= 0.0) {
            return Err(InversionError::Config(format!(
                "forward-run duration must be non-negative, got {years_to_run}"
            )));
        }
        if masks::count(&inputs.ref_ice_mask) <= 0.0 {
            return Err(InversionError::EmptyNormalization(
                "reference ice mask has no ice cells".into(),
            ));
        }

        let ref_inner_mask = masks::inner_mask(&inputs.ref_ice_mask);
        Ok(Self {
            spinup_surf: inputs.spinup_surf,
            ref_surf: inputs.ref_surf,
            ref_ice_mask: inputs.ref_ice_mask,
            ref_inner_mask,
            dx,
            years_to_run,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.ref_surf.dim()
    }

    pub fn num_cells(&self) -> usize {
        self.ref_surf.len()
    }
}

// ─────────────────────────────────────────────────────────────
//  Cost function
// ─────────────────────────────────────────────────────────────

/// Regularised cost over a guessed bed, with its gradient.
#[derive(Debug)]
pub struct CostFunction {
    reference: ReferenceState,
    lambdas: Lambdas,
    mass_balance: Box<dyn MassBalanceModel>,
    forward: Box<dyn ForwardModel>,
    logger: Option<DataLogger>,
}

/// Values extracted from one tape before it is dropped.
struct RawEvaluation {
    cost: f64,
    gradient: Vec<f64>,
    breakdown: CostBreakdown,
    bed: Array2<f64>,
    model_surf: Array2<f64>,
    model_ice_mask: Array2<f64>,
    model_inner_mask: Array2<f64>,
}

impl CostFunction {
    /// Precompute the reference state and validate the weights.
    pub fn new(
        inputs: ReferenceInputs,
        lambdas: Lambdas,
        years_to_run: f64,
        dx: f64,
        mass_balance: impl MassBalanceModel + 'static,
        forward: impl ForwardModel + 'static,
        logger: Option<DataLogger>,
    ) -> Result<Self, InversionError> {
        lambdas.validate()?;
        let reference = ReferenceState::new(inputs, years_to_run, dx)?;

        let ice_free = reference.num_cells() as f64 - masks::count(&reference.ref_ice_mask);
        for term in [RegularizationTerm::IceOutsideGlacier, RegularizationTerm::BedOutsideGlacier] {
            if lambdas.is_enabled(term) && ice_free <= 0.0 {
                return Err(InversionError::EmptyNormalization(format!(
                    "{term} is enabled but the reference has no ice-free cells"
                )));
            }
        }

        debug!(
            "cost function on {:?} grid, dx = {dx} m, {years_to_run} a, weights {:?}",
            reference.shape(),
            lambdas.to_vec()
        );

        Ok(Self {
            reference,
            lambdas,
            mass_balance: Box::new(mass_balance),
            forward: Box::new(forward),
            logger,
        })
    }

    /// Cost function with the shallow-ice model and linear mass balance
    /// from `config`.  A logger is attached when `log_iterations` is set.
    pub fn from_config(inputs: ReferenceInputs, config: &InversionConfig) -> Result<Self, InversionError> {
        let logger = config.log_iterations.then(DataLogger::new);
        Self::new(
            inputs,
            config.lambdas,
            config.years_to_run,
            config.dx,
            config.mass_balance,
            config.ice_flow,
            logger,
        )
    }

    pub fn reference(&self) -> &ReferenceState {
        &self.reference
    }

    pub fn lambdas(&self) -> &Lambdas {
        &self.lambdas
    }

    pub fn logger(&self) -> Option<&DataLogger> {
        self.logger.as_ref()
    }

    /// Detach the logger, leaving none attached.
    pub fn take_logger(&mut self) -> Option<DataLogger> {
        self.logger.take()
    }

    /// Cost and gradient for a flattened (row-major) bed.
    pub fn evaluate(&mut self, flat_bed: &[f64]) -> Result<(f64, Vec<f64>), InversionError> {
        let raw = self.compute(flat_bed)?;
        self.log(&raw);
        Ok((raw.cost, raw.gradient))
    }

    /// Like [`CostFunction::evaluate`], also returning the per-term
    /// breakdown and a snapshot of the fields involved.
    pub fn evaluate_detailed(&mut self, flat_bed: &[f64]) -> Result<Evaluation, InversionError> {
        let raw = self.compute(flat_bed)?;
        self.log(&raw);
        let info = CostInformation {
            ref_surf: self.reference.ref_surf.clone(),
            ref_ice_mask: self.reference.ref_ice_mask.clone(),
            ref_inner_mask: self.reference.ref_inner_mask.clone(),
            guessed_bed: raw.bed,
            model_surf: raw.model_surf,
            model_ice_mask: raw.model_ice_mask,
            model_inner_mask: raw.model_inner_mask,
        };
        Ok(Evaluation {
            cost: raw.cost,
            gradient: raw.gradient,
            breakdown: raw.breakdown,
            info,
        })
    }

    fn log(&mut self, raw: &RawEvaluation) {
        if let Some(logger) = self.logger.as_mut() {
            logger.record(
                raw.breakdown,
                raw.cost,
                raw.gradient.clone(),
                raw.bed.clone(),
                raw.model_surf.clone(),
            );
        }
    }

    fn compute(&self, flat_bed: &[f64]) -> Result<RawEvaluation, InversionError> {
        let shape = self.reference.shape();
        if flat_bed.len() != self.reference.num_cells() {
            return Err(InversionError::Shape(format!(
                "bed vector has {} entries, grid {shape:?} needs {}",
                flat_bed.len(),
                self.reference.num_cells()
            )));
        }
        let bed_field = Array2::from_shape_vec(shape, flat_bed.to_vec())
            .map_err(|e| InversionError::Shape(e.to_string()))?;

        // 1. Fresh tape, bed is the differentiation target
        let mut tape = Tape::new();
        let bed = tape.leaf(bed_field);
        let spinup = tape.constant(self.reference.spinup_surf.clone());
        let ref_surf = tape.constant(self.reference.ref_surf.clone());

        // 2. Forward run
        let model = run_forward(
            &mut tape,
            self.forward.as_ref(),
            self.reference.years_to_run,
            bed,
            self.reference.dx,
            self.mass_balance.as_ref(),
            spinup,
        )?;

        // 3. All terms
        let ctx = TermContext {
            bed,
            model_surf: model.surface,
            ref_surf,
            ref_ice_mask: &self.reference.ref_ice_mask,
            model_inner_mask: &model.inner_mask,
            dx: self.reference.dx,
        };
        let vars = get_costs(&mut tape, &self.lambdas, &ctx)?;

        // 4. Sum in slot order, misfit last
        let mut breakdown = CostBreakdown::default();
        let mut total: Option<Var> = None;
        let slots = vars
            .terms
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i, v)))
            .chain(std::iter::once((CostBreakdown::MISFIT_SLOT, vars.misfit)));
        for (slot, v) in slots {
            breakdown.terms[slot] = tape.scalar(v);
            total = Some(match total {
                Some(acc) => tape.add(acc, v)?,
                None => v,
            });
        }
        let total = total.unwrap_or(vars.misfit);
        let cost = tape.scalar(total);
        if !cost.is_finite() {
            return Err(InversionError::NonFinite(format!("cost (breakdown {:?})", breakdown.terms)));
        }

        // 5–6. Reverse pass and bed gradient in the input layout
        let grads = tape.backward(total)?;
        let gradient: Vec<f64> = grads.wrt(&tape, bed).iter().copied().collect();

        debug!("cost = {cost:.6e}, misfit = {:.6e}", breakdown.misfit());

        Ok(RawEvaluation {
            cost,
            gradient,
            breakdown,
            bed: tape.value(bed).clone(),
            model_surf: tape.value(model.surface).clone(),
            model_ice_mask: model.ice_mask,
            model_inner_mask: model.inner_mask,
        })
    }
}
