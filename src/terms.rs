//! Regularisation term library: nine switchable penalties plus the
//! always-on surface misfit.
//!
//! Every penalty has the shape `λ · (Σ masked-derivative²) / normaliser`.
//! Terms whose weight is exactly 0 are not recorded on the tape at all.
//! A term whose model-dependent normaliser is empty (no interior ice, no
//! boundary ring) contributes 0 and logs a warning.

use crate::lmsd::local_mean_squared_difference;
use crate::masks;
use crate::operators::{central_difference, first_derivative, second_derivative, squared_norm_both_axes};
use crate::tape::{Tape, Var};
use crate::types::{InversionError, Lambdas, RegularizationTerm};
use log::warn;
use ndarray::Array2;

// ─────────────────────────────────────────────────────────────
//  Inputs shared by all terms
// ─────────────────────────────────────────────────────────────

/// Reference and model state one evaluation's terms are computed from.
pub struct TermContext<'a> {
    /// Differentiation target.
    pub bed: Var,
    pub model_surf: Var,
    /// Reference surface, recorded as a constant.
    pub ref_surf: Var,
    pub ref_ice_mask: &'a Array2<f64>,
    pub model_inner_mask: &'a Array2<f64>,
    pub dx: f64,
}

impl TermContext<'_> {
    fn n_inner(&self) -> f64 {
        masks::count(self.model_inner_mask)
    }

    fn n_ref_ice(&self) -> f64 {
        masks::count(self.ref_ice_mask)
    }

    fn n_grid(&self) -> f64 {
        self.ref_ice_mask.len() as f64
    }

    fn outside_glacier(&self) -> Array2<f64> {
        self.ref_ice_mask.mapv(|m| 1.0 - m)
    }
}

/// Recorded cost terms of one evaluation (slot order of `CostBreakdown`).
#[derive(Debug, Clone, Copy)]
pub struct TermVars {
    /// Weighted switchable terms; `None` when skipped.
    pub terms: [Option<Var>; RegularizationTerm::COUNT],
    pub misfit: Var,
}

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn normalise(tape: &mut Tape, term: RegularizationTerm, numerator: Var, denominator: f64) -> Option<Var> {
    if denominator <= 0.0 {
        warn!("{term}: normalisation region is empty, term skipped");
        return None;
    }
    Some(tape.scale(numerator, 1.0 / denominator))
}

fn thickness(tape: &mut Tape, ctx: &TermContext) -> Result<Var, InversionError> {
    tape.sub(ctx.model_surf, ctx.bed)
}

fn gradient_norm(tape: &mut Tape, f: Var, mask: &Array2<f64>, dx: f64) -> Result<Var, InversionError> {
    squared_norm_both_axes(tape, f, mask, |t, f, m, a| first_derivative(t, f, m, a, dx))
}

fn curvature_norm(tape: &mut Tape, f: Var, mask: &Array2<f64>, dx: f64) -> Result<Var, InversionError> {
    squared_norm_both_axes(tape, f, mask, |t, f, m, a| second_derivative(t, f, m, a, dx))
}

// ─────────────────────────────────────────────────────────────
//  Individual terms  (unweighted)
// ─────────────────────────────────────────────────────────────

/// Σ (∇H)² inside the model interior / n_inner.
fn ice_thickness_gradient(tape: &mut Tape, ctx: &TermContext) -> Result<Option<Var>, InversionError> {
    let it = thickness(tape, ctx)?;
    let num = gradient_norm(tape, it, ctx.model_inner_mask, ctx.dx)?;
    Ok(normalise(tape, RegularizationTerm::IceThicknessGradient, num, ctx.n_inner()))
}

/// Bed differences span one `dx` here, not `2·dx`.
fn bed_gradient(tape: &mut Tape, ctx: &TermContext) -> Result<Option<Var>, InversionError> {
    let dx = ctx.dx;
    let num = squared_norm_both_axes(tape, ctx.bed, ctx.model_inner_mask, |t, f, m, a| {
        central_difference(t, f, m, a, dx)
    })?;
    Ok(normalise(tape, RegularizationTerm::BedGradient, num, ctx.n_inner()))
}

/// Modelled ice where the reference glacier has none.
fn ice_outside_glacier(tape: &mut Tape, ctx: &TermContext) -> Result<Option<Var>, InversionError> {
    let it = thickness(tape, ctx)?;
    let outside = tape.mul_const(it, ctx.outside_glacier())?;
    let num = tape.sum_squares(outside);
    let denom = ctx.n_grid() - ctx.n_ref_ice();
    Ok(normalise(tape, RegularizationTerm::IceOutsideGlacier, num, denom))
}

/// Outside the glacier the bed is the observed ground surface.
fn bed_outside_glacier(tape: &mut Tape, ctx: &TermContext) -> Result<Option<Var>, InversionError> {
    let diff = tape.sub(ctx.ref_surf, ctx.bed)?;
    let outside = tape.mul_const(diff, ctx.outside_glacier())?;
    let num = tape.sum_squares(outside);
    let denom = ctx.n_grid() - ctx.n_ref_ice();
    Ok(normalise(tape, RegularizationTerm::BedOutsideGlacier, num, denom))
}

fn ice_thickness_curvature(tape: &mut Tape, ctx: &TermContext) -> Result<Option<Var>, InversionError> {
    let it = thickness(tape, ctx)?;
    let num = curvature_norm(tape, it, ctx.model_inner_mask, ctx.dx)?;
    Ok(normalise(tape, RegularizationTerm::IceThicknessCurvature, num, ctx.n_inner()))
}

/// Normalised by `2·n_inner`, unlike the thickness curvature.
fn bed_curvature(tape: &mut Tape, ctx: &TermContext) -> Result<Option<Var>, InversionError> {
    let num = curvature_norm(tape, ctx.bed, ctx.model_inner_mask, ctx.dx)?;
    Ok(normalise(tape, RegularizationTerm::BedCurvature, num, 2.0 * ctx.n_inner()))
}

/// Bed curvature on the ring `ref_ice − model_inner`.
///
/// The ring is signed: cells where the model interior reaches past the
/// reference ice are −1, and they weight the curvature as much as ring
/// cells do.  The normaliser is the signed interior sum, not a cell
/// count, so a model interior larger than the reference glacier drives
/// it to 0 or below and the term is skipped.
fn bed_boundary_curvature(tape: &mut Tape, ctx: &TermContext) -> Result<Option<Var>, InversionError> {
    let ring = ctx.ref_ice_mask - ctx.model_inner_mask;
    let num = curvature_norm(tape, ctx.bed, &ring, ctx.dx)?;
    let denom = 2.0 * masks::interior_sum(&ring);
    if denom < 0.0 {
        warn!(
            "{}: model interior extends past the reference ice (signed ring sum {})",
            RegularizationTerm::BedBoundaryCurvature,
            denom / 2.0
        );
    }
    Ok(normalise(tape, RegularizationTerm::BedBoundaryCurvature, num, denom))
}

fn surface_curvature(tape: &mut Tape, ctx: &TermContext) -> Result<Option<Var>, InversionError> {
    let num = curvature_norm(tape, ctx.model_surf, ctx.model_inner_mask, ctx.dx)?;
    Ok(normalise(tape, RegularizationTerm::SurfaceCurvature, num, ctx.n_inner()))
}

/// Reference ice mask serves as both region and gradient mask.
fn local_msd(tape: &mut Tape, ctx: &TermContext) -> Result<Option<Var>, InversionError> {
    let ice_region = tape.constant(ctx.ref_ice_mask.clone());
    let ice_mask = tape.constant(ctx.ref_ice_mask.clone());
    Ok(Some(local_mean_squared_difference(
        tape,
        ctx.model_surf,
        ctx.ref_surf,
        ice_region,
        ice_mask,
        ctx.bed,
    )))
}

/// Σ (ref_surf − model_surf)² / Σ ref_ice.
pub fn surface_misfit(tape: &mut Tape, ctx: &TermContext) -> Result<Var, InversionError> {
    let diff = tape.sub(ctx.ref_surf, ctx.model_surf)?;
    let num = tape.sum_squares(diff);
    Ok(tape.scale(num, 1.0 / ctx.n_ref_ice()))
}

// ─────────────────────────────────────────────────────────────
//  Dispatch
// ─────────────────────────────────────────────────────────────

/// Unweighted value of a single term, `None` if its region is empty.
pub fn term_value(
    tape: &mut Tape,
    term: RegularizationTerm,
    ctx: &TermContext,
) -> Result<Option<Var>, InversionError> {
    match term {
        RegularizationTerm::IceThicknessGradient => ice_thickness_gradient(tape, ctx),
        RegularizationTerm::BedGradient => bed_gradient(tape, ctx),
        RegularizationTerm::IceOutsideGlacier => ice_outside_glacier(tape, ctx),
        RegularizationTerm::BedOutsideGlacier => bed_outside_glacier(tape, ctx),
        RegularizationTerm::IceThicknessCurvature => ice_thickness_curvature(tape, ctx),
        RegularizationTerm::BedCurvature => bed_curvature(tape, ctx),
        RegularizationTerm::BedBoundaryCurvature => bed_boundary_curvature(tape, ctx),
        RegularizationTerm::SurfaceCurvature => surface_curvature(tape, ctx),
        RegularizationTerm::LocalMeanSquaredDifference => local_msd(tape, ctx),
    }
}

/// Record every enabled, weighted term plus the misfit.
pub fn get_costs(tape: &mut Tape, lambdas: &Lambdas, ctx: &TermContext) -> Result<TermVars, InversionError> {
    let mut vars = TermVars {
        terms: [None; RegularizationTerm::COUNT],
        misfit: surface_misfit(tape, ctx)?,
    };
    for term in RegularizationTerm::ALL {
        let weight = lambdas.get(term);
        if weight == 0.0 {
            continue;
        }
        if let Some(value) = term_value(tape, term, ctx)? {
            vars.terms[term.index()] = Some(tape.scale(value, weight));
        }
    }
    Ok(vars)
}
