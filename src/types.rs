use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public API returns `Result<T, InversionError>`
/// instead of panicking.  Nothing is retried or recovered locally: the
/// caller (usually the optimiser) decides whether to abort.
#[derive(Debug, Error)]
pub enum InversionError {
    /// A field disagrees with the established grid shape.
    #[error("shape error: {0}")]
    Shape(String),
    /// Fewer regularisation weights than terms.
    #[error("expected at least {expected} regularisation weights, got {actual}")]
    LambdaCount { expected: usize, actual: usize },
    /// Negative or non-finite regularisation weight.
    #[error("invalid weight {value} for term {term}")]
    InvalidLambda { term: RegularizationTerm, value: f64 },
    /// A normaliser that depends only on reference data is zero.
    #[error("empty normalisation region: {0}")]
    EmptyNormalization(String),
    /// A mask holds values other than 0 and 1.
    #[error("invalid mask: {0}")]
    InvalidMask(String),
    /// An input field or the forward model holds NaN or infinite values.
    #[error("non-finite values in {0}")]
    NonFinite(String),
    /// Reverse pass could not be completed.
    #[error("gradient propagation failed: {0}")]
    Propagation(String),
    /// Argmin solver returned an error.
    #[error("solver error: {0}")]
    Solver(String),
    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
    /// Run records could not be serialised or written.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<argmin::core::Error> for InversionError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Solver(e.to_string())
    }
}

/// Fail with [`InversionError::Shape`] unless `field` has `shape`.
pub fn check_shape(name: &str, field: &Array2<f64>, shape: (usize, usize)) -> Result<(), InversionError> {
    if field.dim() != shape {
        return Err(InversionError::Shape(format!(
            "{name} has shape {:?}, expected {:?}",
            field.dim(),
            shape
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Regularisation terms  (named, ordered)
// ─────────────────────────────────────────────────────────────

/// The nine switchable cost terms, in breakdown order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegularizationTerm {
    /// Steep ice-thickness gradients inside the glacier.
    IceThicknessGradient,
    /// Steep bed gradients inside the glacier.
    BedGradient,
    /// Modelled ice where the reference has none.
    IceOutsideGlacier,
    /// Bed deviating from the known bare-ground surface.
    BedOutsideGlacier,
    IceThicknessCurvature,
    BedCurvature,
    /// Bed curvature on the ring between reference ice and model interior.
    BedBoundaryCurvature,
    SurfaceCurvature,
    /// Hand-differentiated surface misfit, see [`crate::lmsd`].
    LocalMeanSquaredDifference,
}

impl RegularizationTerm {
    pub const COUNT: usize = 9;

    pub const ALL: [RegularizationTerm; Self::COUNT] = [
        Self::IceThicknessGradient,
        Self::BedGradient,
        Self::IceOutsideGlacier,
        Self::BedOutsideGlacier,
        Self::IceThicknessCurvature,
        Self::BedCurvature,
        Self::BedBoundaryCurvature,
        Self::SurfaceCurvature,
        Self::LocalMeanSquaredDifference,
    ];

    /// Slot of this term in a [`CostBreakdown`] / positional lambda slice.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::IceThicknessGradient => "ice_thickness_gradient",
            Self::BedGradient => "bed_gradient",
            Self::IceOutsideGlacier => "ice_outside_glacier",
            Self::BedOutsideGlacier => "bed_outside_glacier",
            Self::IceThicknessCurvature => "ice_thickness_curvature",
            Self::BedCurvature => "bed_curvature",
            Self::BedBoundaryCurvature => "bed_boundary_curvature",
            Self::SurfaceCurvature => "surface_curvature",
            Self::LocalMeanSquaredDifference => "local_mean_squared_difference",
        }
    }
}

impl fmt::Display for RegularizationTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─────────────────────────────────────────────────────────────
//  Lambdas  (regularisation weights)
// ─────────────────────────────────────────────────────────────

/// One non-negative weight per [`RegularizationTerm`].
///
/// A weight of exactly `0.0` skips the term: it is not computed at all.
/// Deserialises from a JSON object keyed by term name; missing terms
/// default to 0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Lambdas {
    pub ice_thickness_gradient: f64,
    pub bed_gradient: f64,
    pub ice_outside_glacier: f64,
    pub bed_outside_glacier: f64,
    pub ice_thickness_curvature: f64,
    pub bed_curvature: f64,
    pub bed_boundary_curvature: f64,
    pub surface_curvature: f64,
    pub local_mean_squared_difference: f64,
}

impl Lambdas {
    /// All terms disabled: only the surface misfit remains.
    pub fn zeros() -> Self {
        Self::default()
    }

    /// Build from a positional slice (term order of [`RegularizationTerm::ALL`]).
    /// Extra trailing entries are ignored.
    pub fn from_slice(values: &[f64]) -> Result<Self, InversionError> {
        if values.len() < RegularizationTerm::COUNT {
            return Err(InversionError::LambdaCount {
                expected: RegularizationTerm::COUNT,
                actual: values.len(),
            });
        }
        let mut lambdas = Self::zeros();
        for term in RegularizationTerm::ALL {
            lambdas.set(term, values[term.index()]);
        }
        lambdas.validate()?;
        Ok(lambdas)
    }

    pub fn get(&self, term: RegularizationTerm) -> f64 {
        match term {
            RegularizationTerm::IceThicknessGradient => self.ice_thickness_gradient,
            RegularizationTerm::BedGradient => self.bed_gradient,
            RegularizationTerm::IceOutsideGlacier => self.ice_outside_glacier,
            RegularizationTerm::BedOutsideGlacier => self.bed_outside_glacier,
            RegularizationTerm::IceThicknessCurvature => self.ice_thickness_curvature,
            RegularizationTerm::BedCurvature => self.bed_curvature,
            RegularizationTerm::BedBoundaryCurvature => self.bed_boundary_curvature,
            RegularizationTerm::SurfaceCurvature => self.surface_curvature,
            RegularizationTerm::LocalMeanSquaredDifference => self.local_mean_squared_difference,
        }
    }

    pub fn set(&mut self, term: RegularizationTerm, weight: f64) {
        let slot = match term {
            RegularizationTerm::IceThicknessGradient => &mut self.ice_thickness_gradient,
            RegularizationTerm::BedGradient => &mut self.bed_gradient,
            RegularizationTerm::IceOutsideGlacier => &mut self.ice_outside_glacier,
            RegularizationTerm::BedOutsideGlacier => &mut self.bed_outside_glacier,
            RegularizationTerm::IceThicknessCurvature => &mut self.ice_thickness_curvature,
            RegularizationTerm::BedCurvature => &mut self.bed_curvature,
            RegularizationTerm::BedBoundaryCurvature => &mut self.bed_boundary_curvature,
            RegularizationTerm::SurfaceCurvature => &mut self.surface_curvature,
            RegularizationTerm::LocalMeanSquaredDifference => &mut self.local_mean_squared_difference,
        };
        *slot = weight;
    }

    /// Builder-style [`Lambdas::set`].
    pub fn with(mut self, term: RegularizationTerm, weight: f64) -> Self {
        self.set(term, weight);
        self
    }

    pub fn is_enabled(&self, term: RegularizationTerm) -> bool {
        self.get(term) != 0.0
    }

    /// Reject negative or non-finite weights.
    pub fn validate(&self) -> Result<(), InversionError> {
        for term in RegularizationTerm::ALL {
            let value = self.get(term);
            if !value.is_finite() || value < 0.0 {
                return Err(InversionError::InvalidLambda { term, value });
            }
        }
        Ok(())
    }

    /// Positional view, term order of [`RegularizationTerm::ALL`].
    pub fn to_vec(&self) -> Vec<f64> {
        RegularizationTerm::ALL.iter().map(|&t| self.get(t)).collect()
    }
}

// ─────────────────────────────────────────────────────────────
//  Cost breakdown
// ─────────────────────────────────────────────────────────────

/// Weighted contribution of each term; the surface misfit sits in the
/// last slot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub terms: [f64; RegularizationTerm::COUNT + 1],
}

impl CostBreakdown {
    pub const MISFIT_SLOT: usize = RegularizationTerm::COUNT;

    pub fn term(&self, term: RegularizationTerm) -> f64 {
        self.terms[term.index()]
    }

    pub fn misfit(&self) -> f64 {
        self.terms[Self::MISFIT_SLOT]
    }

    /// Sum in slot order.
    pub fn total(&self) -> f64 {
        self.terms.iter().sum()
    }
}

// ─────────────────────────────────────────────────────────────
//  Reference inputs / snapshots
// ─────────────────────────────────────────────────────────────

/// Fields a glacier case supplies to the cost-function factory.
/// Loading them from rasters is the caller's business.
#[derive(Debug, Clone)]
pub struct ReferenceInputs {
    /// Surface at the start of the forward run (m).
    pub spinup_surf: Array2<f64>,
    /// Observed surface the forward run should reproduce (m).
    pub ref_surf: Array2<f64>,
    /// 1 on (and including the border of) the reference glacier, else 0.
    pub ref_ice_mask: Array2<f64>,
}

/// Immutable snapshot of one evaluation, for reporting/debugging.
#[derive(Debug, Clone)]
pub struct CostInformation {
    pub ref_surf: Array2<f64>,
    pub ref_ice_mask: Array2<f64>,
    pub ref_inner_mask: Array2<f64>,
    pub guessed_bed: Array2<f64>,
    pub model_surf: Array2<f64>,
    pub model_ice_mask: Array2<f64>,
    pub model_inner_mask: Array2<f64>,
}

/// Everything produced by one detailed evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub cost: f64,
    pub gradient: Vec<f64>,
    pub breakdown: CostBreakdown,
    pub info: CostInformation,
}

// ─────────────────────────────────────────────────────────────
//  Solver options / result
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Number of L-BFGS correction pairs.
    pub memory: usize,
    pub gradient_tolerance: f64,
    pub cost_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            memory: 10,
            gradient_tolerance: 1e-8,
            cost_tolerance: 1e-12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InversionResult {
    pub bed: Array2<f64>,
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
}
