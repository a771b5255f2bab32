//! Forward glacier model: traits, the adapter the cost function calls,
//! and a shallow-ice implementation recorded on the tape.
//!
//! Everything a forward model does to the bed must be recorded on the
//! [`Tape`]; anything computed off-tape is a constant as far as the bed
//! gradient is concerned.

use crate::masks;
use crate::tape::{Tape, Var};
use crate::types::InversionError;
use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

pub const SEC_IN_YEAR: f64 = 365.25 * 24.0 * 3600.0;

// ─────────────────────────────────────────────────────────────
//  Interfaces
// ─────────────────────────────────────────────────────────────

/// Surface mass balance as a differentiable function of the surface.
pub trait MassBalanceModel: Debug {
    /// Record `mb(surface)` on the tape, in m ice per year.
    fn apply(&self, tape: &mut Tape, surface: Var) -> Result<Var, InversionError>;
}

/// Time-stepped glacier model mapping a bed and initial ice thickness to
/// the surface after `years`.
pub trait ForwardModel: Debug {
    fn run(
        &self,
        tape: &mut Tape,
        years: f64,
        bed: Var,
        dx: f64,
        mass_balance: &dyn MassBalanceModel,
        initial_thickness: Var,
    ) -> Result<Var, InversionError>;
}

// ─────────────────────────────────────────────────────────────
//  Adapter
// ─────────────────────────────────────────────────────────────

/// Model surface on the tape plus the masks derived from it.
#[derive(Debug)]
pub struct ModelState {
    pub surface: Var,
    pub ice_mask: Array2<f64>,
    pub inner_mask: Array2<f64>,
}

/// Run `model` from `spinup_surf` over `bed` and derive the model masks.
pub fn run_forward(
    tape: &mut Tape,
    model: &dyn ForwardModel,
    years: f64,
    bed: Var,
    dx: f64,
    mass_balance: &dyn MassBalanceModel,
    spinup_surf: Var,
) -> Result<ModelState, InversionError> {
    let initial_thickness = tape.sub(spinup_surf, bed)?;
    let surface = model.run(tape, years, bed, dx, mass_balance, initial_thickness)?;

    if tape.shape(surface) != tape.shape(bed) {
        return Err(InversionError::Shape(format!(
            "forward model returned {:?} for a bed of {:?}",
            tape.shape(surface),
            tape.shape(bed)
        )));
    }
    if tape.value(surface).iter().any(|v| !v.is_finite()) {
        return Err(InversionError::NonFinite("modelled surface".into()));
    }

    let ice_mask = masks::ice_mask(tape.value(surface), tape.value(bed));
    let inner_mask = masks::inner_mask(&ice_mask);
    Ok(ModelState { surface, ice_mask, inner_mask })
}

// ─────────────────────────────────────────────────────────────
//  Linear mass balance
// ─────────────────────────────────────────────────────────────

/// `mb(s) = min(gradient · (s − ela_h), max_mb)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearMassBalance {
    /// Equilibrium line altitude (m).
    pub ela_h: f64,
    /// m ice per year, per m of elevation.
    pub gradient: f64,
    /// Upper clip, m ice per year.
    pub max_mb: f64,
}

impl Default for LinearMassBalance {
    fn default() -> Self {
        Self {
            ela_h: 3000.0,
            gradient: 0.0075,
            max_mb: 2.0,
        }
    }
}

impl LinearMassBalance {
    pub fn new(ela_h: f64, gradient: f64) -> Self {
        Self { ela_h, gradient, ..Self::default() }
    }
}

impl MassBalanceModel for LinearMassBalance {
    fn apply(&self, tape: &mut Tape, surface: Var) -> Result<Var, InversionError> {
        let above = tape.offset(surface, -self.ela_h);
        let mb = tape.scale(above, self.gradient);
        Ok(tape.clamp_max(mb, self.max_mb))
    }
}

// ─────────────────────────────────────────────────────────────
//  Shallow-ice model
// ─────────────────────────────────────────────────────────────

/// Explicit shallow-ice-approximation model on a staggered grid.
///
/// Diffusivity on each cell face is `Γ · H^(n+2) · (∂s/∂n)^(n−1)` with
/// Glen exponent n = 3, using the face-normal surface slope.  Fluxes
/// through the outer domain boundary are zero.  Thickness is clipped at
/// 0 after every step.  The time step obeys a diffusive CFL limit
/// evaluated on current values (it does not depend on the bed through
/// the tape).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShallowIceModel {
    /// Glen's creep parameter A (s⁻¹ Pa⁻³).
    pub glen_a: f64,
    /// Ice density (kg m⁻³).
    pub rho: f64,
    /// Gravitational acceleration (m s⁻²).
    pub g: f64,
    /// Fraction of the diffusive stability limit used per step.
    pub cfl: f64,
    /// Upper bound on a step (years).
    pub max_dt: f64,
}

const GLEN_N: i32 = 3;

impl Default for ShallowIceModel {
    fn default() -> Self {
        Self {
            glen_a: 2.4e-24,
            rho: 900.0,
            g: 9.81,
            cfl: 0.9,
            max_dt: 1.0,
        }
    }
}

impl ShallowIceModel {
    /// `Γ = 2A(ρg)^n / (n+2)`, per year.
    pub fn gamma(&self) -> f64 {
        let n = f64::from(GLEN_N);
        2.0 * self.glen_a * (self.rho * self.g).powi(GLEN_N) / (n + 2.0) * SEC_IN_YEAR
    }

    /// Face diffusivity and flux along one axis.  Returns the flux
    /// divergence on the full grid and the largest face diffusivity.
    fn divergence(
        &self,
        tape: &mut Tape,
        thick: Var,
        surface: Var,
        dx: f64,
        along_rows: bool,
    ) -> Result<(Var, f64), InversionError> {
        let (nr, nc) = tape.shape(thick);
        let (first, second) = if along_rows {
            ((0..nr - 1, 0..nc), (1..nr, 0..nc))
        } else {
            ((0..nr, 0..nc - 1), (0..nr, 1..nc))
        };

        let s_a = tape.window(surface, first.0.clone(), first.1.clone())?;
        let s_b = tape.window(surface, second.0.clone(), second.1.clone())?;
        let ds = tape.sub(s_b, s_a)?;
        let slope = tape.scale(ds, 1.0 / dx);

        let h_a = tape.window(thick, first.0, first.1)?;
        let h_b = tape.window(thick, second.0, second.1)?;
        let h_sum = tape.add(h_a, h_b)?;
        let h_face = tape.scale(h_sum, 0.5);

        let h_pow = tape.powi(h_face, GLEN_N + 2);
        let slope_pow = tape.powi(slope, GLEN_N - 1);
        let d_raw = tape.mul(h_pow, slope_pow)?;
        let diffusivity = tape.scale(d_raw, self.gamma());
        let d_max = tape.value(diffusivity).iter().fold(0.0_f64, |m, &v| m.max(v));

        // q = −D ∂s/∂n, padded with zero flux on both outer faces
        let d_slope = tape.mul(diffusivity, slope)?;
        let flux = tape.scale(d_slope, -1.0);
        let (lo, hi) = if along_rows {
            let p = tape.embed(flux, (nr + 1, nc), 1, 0)?;
            (tape.window(p, 0..nr, 0..nc)?, tape.window(p, 1..nr + 1, 0..nc)?)
        } else {
            let p = tape.embed(flux, (nr, nc + 1), 0, 1)?;
            (tape.window(p, 0..nr, 0..nc)?, tape.window(p, 0..nr, 1..nc + 1)?)
        };
        let dq = tape.sub(hi, lo)?;
        Ok((tape.scale(dq, 1.0 / dx), d_max))
    }
}

impl ForwardModel for ShallowIceModel {
    fn run(
        &self,
        tape: &mut Tape,
        years: f64,
        bed: Var,
        dx: f64,
        mass_balance: &dyn MassBalanceModel,
        initial_thickness: Var,
    ) -> Result<Var, InversionError> {
        let (nr, nc) = tape.shape(bed);
        if nr < 2 || nc < 2 {
            return Err(InversionError::Shape(format!(
                "shallow-ice model needs at least a 2×2 grid, got ({nr}, {nc})"
            )));
        }
        if !(years >= 0.0) || !(dx > 0.0) {
            return Err(InversionError::NonFinite(format!(
                "forward run parameters (years = {years}, dx = {dx})"
            )));
        }

        let mut thick = tape.relu(initial_thickness);
        let mut t = 0.0;
        let mut steps = 0usize;

        // Remainders below this are rounding, not another step.
        while years - t > 1e-9 {
            let surface = tape.add(bed, thick)?;
            let (div_x, dmax_x) = self.divergence(tape, thick, surface, dx, false)?;
            let (div_y, dmax_y) = self.divergence(tape, thick, surface, dx, true)?;

            let d_max = dmax_x.max(dmax_y);
            if !d_max.is_finite() {
                return Err(InversionError::NonFinite(format!("ice diffusivity at t = {t:.3} a")));
            }
            let mut dt = (years - t).min(self.max_dt);
            if d_max > 0.0 {
                dt = dt.min(self.cfl * dx * dx / (4.0 * d_max));
            }

            let mb = mass_balance.apply(tape, surface)?;
            let div = tape.add(div_x, div_y)?;
            let rate = tape.sub(mb, div)?;
            let dh = tape.scale(rate, dt);
            let updated = tape.add(thick, dh)?;
            thick = tape.relu(updated);

            t += dt;
            steps += 1;
        }

        debug!("shallow-ice run: {years} a in {steps} steps, {} tape nodes", tape.len());
        tape.add(bed, thick)
    }
}
