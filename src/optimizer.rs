//! L-BFGS inversion driver via the `argmin` crate.
//!
//! Wraps [`CostFunction::evaluate`] into argmin's `CostFunction` +
//! `Gradient` traits and runs L-BFGS from an initial bed guess.
//!
//! Uses `Vec<f64>` as the argmin parameter type; the bed is flattened
//! row-major, exactly the layout `evaluate` expects.

use crate::cost::CostFunction;
use crate::types::{InversionError, InversionResult, SolverOptions};
use argmin::core::{CostFunction as ArgminCost, Executor, Gradient, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use log::info;
use ndarray::Array2;
use std::cell::RefCell;

// ─────────────────────────────────────────────────────────────
//  argmin problem wrapper
// ─────────────────────────────────────────────────────────────

/// Adapts a [`CostFunction`] to argmin.
///
/// `RefCell` because argmin's traits take `&self` while evaluation
/// appends to the cost function's logger.  The solver is
/// single-threaded, so the borrow never conflicts.
///
/// argmin asks for `cost(θ)` and `gradient(θ)` separately at the same θ;
/// the last `(θ, cost, gradient)` is cached so each distinct bed runs the
/// forward model once.
struct BedProblem<'a> {
    cost_fn: RefCell<&'a mut CostFunction>,
    last_eval: RefCell<Option<(Vec<f64>, f64, Vec<f64>)>>,
}

impl BedProblem<'_> {
    fn ensure_evaluated(&self, theta: &[f64]) -> Result<(), argmin::core::Error> {
        {
            let cached = self.last_eval.borrow();
            if let Some((ref t, _, _)) = *cached {
                if t == theta {
                    return Ok(());
                }
            }
        }
        let (cost, grad) = self
            .cost_fn
            .borrow_mut()
            .evaluate(theta)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        *self.last_eval.borrow_mut() = Some((theta.to_vec(), cost, grad));
        Ok(())
    }

    fn cached<T>(&self, pick: impl FnOnce(&(Vec<f64>, f64, Vec<f64>)) -> T) -> Result<T, argmin::core::Error> {
        self.last_eval
            .borrow()
            .as_ref()
            .map(pick)
            .ok_or_else(|| argmin::core::Error::msg("no cached evaluation"))
    }
}

impl ArgminCost for BedProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        self.ensure_evaluated(theta)?;
        self.cached(|e| e.1)
    }
}

impl Gradient for BedProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, theta: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        self.ensure_evaluated(theta)?;
        self.cached(|e| e.2.clone())
    }
}

// ─────────────────────────────────────────────────────────────
//  Top-level inversion entry point
// ─────────────────────────────────────────────────────────────

/// Minimise `cost_fn` over the bed, starting from `initial_bed`.
pub fn invert(
    cost_fn: &mut CostFunction,
    initial_bed: &Array2<f64>,
    options: &SolverOptions,
) -> Result<InversionResult, InversionError> {
    let shape = cost_fn.reference().shape();
    if initial_bed.dim() != shape {
        return Err(InversionError::Shape(format!(
            "initial bed has shape {:?}, expected {shape:?}",
            initial_bed.dim()
        )));
    }
    let init_param: Vec<f64> = initial_bed.iter().copied().collect();

    let problem = BedProblem {
        cost_fn: RefCell::new(cost_fn),
        last_eval: RefCell::new(None),
    };

    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, options.memory)
        .with_tolerance_grad(options.gradient_tolerance)?
        .with_tolerance_cost(options.cost_tolerance)?;

    let result = Executor::new(problem, solver)
        .configure(|config| {
            config
                .param(init_param)
                .max_iters(options.max_iterations as u64)
                .target_cost(f64::NEG_INFINITY)
        })
        .run()?;

    let state = result.state();
    let best_param = state
        .get_best_param()
        .ok_or_else(|| InversionError::Solver("L-BFGS returned no best parameters".into()))?;
    let bed = Array2::from_shape_vec(shape, best_param.clone())
        .map_err(|e| InversionError::Shape(e.to_string()))?;
    let converged = matches!(
        state.get_termination_reason(),
        Some(TerminationReason::SolverConverged)
    );
    let iterations = state.get_iter() as usize;
    let cost = state.get_best_cost();

    info!("inversion finished: {iterations} iterations, cost = {cost:.6e}, converged = {converged}");

    Ok(InversionResult {
        bed,
        cost,
        iterations,
        converged,
    })
}
