//! Masked central finite differences on the tape.
//!
//! Along axis `a` the output loses one cell at each end of that axis
//! (shape `(rows, cols−2)` for `Axis(1)`, `(rows−2, cols)` for `Axis(0)`),
//! and is multiplied by the mask's interior slice along the same axis, so
//! a derivative only counts where the mask is set at the centre cell.
//!
//! `Axis(1)` is the x direction (along a row), `Axis(0)` is y.

use crate::tape::{Tape, Var};
use crate::types::InversionError;
use ndarray::{s, Array2, Axis};

/// `(F[..−2], F[1..−1], F[2..])` along `axis`.
fn shifted(tape: &mut Tape, f: Var, axis: Axis) -> Result<(Var, Var, Var), InversionError> {
    let (nr, nc) = tape.shape(f);
    let n = if axis == Axis(0) { nr } else { nc };
    if n < 3 {
        return Err(InversionError::Shape(format!(
            "need at least 3 cells along axis {} for a central difference, got {n}",
            axis.index()
        )));
    }
    let (lo, mid, hi) = if axis == Axis(0) {
        (
            tape.window(f, 0..nr - 2, 0..nc)?,
            tape.window(f, 1..nr - 1, 0..nc)?,
            tape.window(f, 2..nr, 0..nc)?,
        )
    } else {
        (
            tape.window(f, 0..nr, 0..nc - 2)?,
            tape.window(f, 0..nr, 1..nc - 1)?,
            tape.window(f, 0..nr, 2..nc)?,
        )
    };
    Ok((lo, mid, hi))
}

/// Interior slice of `mask` along `axis` (matches the derivative's shape).
pub fn mask_interior(mask: &Array2<f64>, axis: Axis) -> Array2<f64> {
    let (nr, nc) = mask.dim();
    if axis == Axis(0) {
        mask.slice(s![1..nr.saturating_sub(1).max(1), ..]).to_owned()
    } else {
        mask.slice(s![.., 1..nc.saturating_sub(1).max(1)]).to_owned()
    }
}

/// `(F[..−2] − F[2..]) / span`, masked.
pub fn central_difference(
    tape: &mut Tape,
    f: Var,
    mask: &Array2<f64>,
    axis: Axis,
    span: f64,
) -> Result<Var, InversionError> {
    if mask.dim() != tape.shape(f) {
        return Err(InversionError::Shape(format!(
            "mask {:?} does not match field {:?}",
            mask.dim(),
            tape.shape(f)
        )));
    }
    let (lo, _, hi) = shifted(tape, f, axis)?;
    let diff = tape.sub(lo, hi)?;
    let d = tape.scale(diff, 1.0 / span);
    tape.mul_const(d, mask_interior(mask, axis))
}

/// First derivative, `(F[..−2] − F[2..]) / (2·dx)`, masked.
pub fn first_derivative(
    tape: &mut Tape,
    f: Var,
    mask: &Array2<f64>,
    axis: Axis,
    dx: f64,
) -> Result<Var, InversionError> {
    central_difference(tape, f, mask, axis, 2.0 * dx)
}

/// Curvature, `(F[..−2] + F[2..] − 2·F[1..−1]) / dx²`, masked.
pub fn second_derivative(
    tape: &mut Tape,
    f: Var,
    mask: &Array2<f64>,
    axis: Axis,
    dx: f64,
) -> Result<Var, InversionError> {
    if mask.dim() != tape.shape(f) {
        return Err(InversionError::Shape(format!(
            "mask {:?} does not match field {:?}",
            mask.dim(),
            tape.shape(f)
        )));
    }
    let (lo, mid, hi) = shifted(tape, f, axis)?;
    let outer = tape.add(lo, hi)?;
    let twice_mid = tape.scale(mid, 2.0);
    let num = tape.sub(outer, twice_mid)?;
    let d = tape.scale(num, 1.0 / (dx * dx));
    tape.mul_const(d, mask_interior(mask, axis))
}

/// Σ over both axes of the squared derivative produced by `op`.
///
/// This is the numerator every gradient/curvature penalty uses:
/// `Σ (∂F/∂x)² + Σ (∂F/∂y)²`.
pub fn squared_norm_both_axes<F>(
    tape: &mut Tape,
    f: Var,
    mask: &Array2<f64>,
    mut op: F,
) -> Result<Var, InversionError>
where
    F: FnMut(&mut Tape, Var, &Array2<f64>, Axis) -> Result<Var, InversionError>,
{
    let dx_term = op(tape, f, mask, Axis(1))?;
    let dy_term = op(tape, f, mask, Axis(0))?;
    let sx = tape.sum_squares(dx_term);
    let sy = tape.sum_squares(dy_term);
    tape.add(sx, sy)
}
