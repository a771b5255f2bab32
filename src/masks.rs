//! Ice / inner masks.
//!
//! Reference and model masks go through the same functions so that the
//! boundary-ring term compares like with like.

use ndarray::{s, Array2, Zip};

/// Window sum a cell must reach to count as interior (3×3 all ice).
pub const INNER_THRESHOLD: f64 = 9.0;

/// 1 where `surface − bed > 0`, else 0.
pub fn ice_mask(surface: &Array2<f64>, bed: &Array2<f64>) -> Array2<f64> {
    let mut mask = Array2::zeros(surface.dim());
    Zip::from(&mut mask)
        .and(surface)
        .and(bed)
        .for_each(|m, &s, &b| *m = if s - b > 0.0 { 1.0 } else { 0.0 });
    mask
}

/// 3×3 all-ones window sum, valid region only: shape `(rows−2, cols−2)`.
pub fn window_sum_3x3(field: &Array2<f64>) -> Array2<f64> {
    let (nr, nc) = field.dim();
    if nr < 3 || nc < 3 {
        return Array2::zeros((nr.saturating_sub(2), nc.saturating_sub(2)));
    }
    let mut out = Array2::zeros((nr - 2, nc - 2));
    for di in 0..3 {
        for dj in 0..3 {
            out += &field.slice(s![di..nr - 2 + di, dj..nc - 2 + dj]);
        }
    }
    out
}

/// Cells whose whole 3×3 neighbourhood is ice.  The one-cell border is
/// always 0.
pub fn inner_mask(ice_mask: &Array2<f64>) -> Array2<f64> {
    let (nr, nc) = ice_mask.dim();
    let mut inner = Array2::zeros((nr, nc));
    if nr < 3 || nc < 3 {
        return inner;
    }
    let sums = window_sum_3x3(ice_mask);
    inner
        .slice_mut(s![1..nr - 1, 1..nc - 1])
        .assign(&sums.mapv(|v| if v == INNER_THRESHOLD { 1.0 } else { 0.0 }));
    inner
}

/// Number of set cells.
pub fn count(mask: &Array2<f64>) -> f64 {
    mask.sum()
}

/// Sum over the `[1:-1, 1:-1]` interior.
pub fn interior_sum(field: &Array2<f64>) -> f64 {
    let (nr, nc) = field.dim();
    if nr < 3 || nc < 3 {
        return 0.0;
    }
    field.slice(s![1..nr - 1, 1..nc - 1]).sum()
}
