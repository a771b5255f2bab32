//! End-to-end inversions and configuration loading.

use ndarray::Array2;
use subglacial::config::{load_config, InversionConfig};
use subglacial::forward::{ForwardModel, LinearMassBalance, MassBalanceModel, ShallowIceModel};
use subglacial::optimizer;
use subglacial::tape::{Tape, Var};
use subglacial::types::*;
use subglacial::{CostFunction, DataLogger};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `surface = bed + k · initial_thickness`
#[derive(Debug)]
struct LinearForward {
    k: f64,
}

impl ForwardModel for LinearForward {
    fn run(
        &self,
        tape: &mut Tape,
        _years: f64,
        bed: Var,
        _dx: f64,
        _mass_balance: &dyn MassBalanceModel,
        initial_thickness: Var,
    ) -> Result<Var, InversionError> {
        let scaled = tape.scale(initial_thickness, self.k);
        tape.add(bed, scaled)
    }
}

fn interior_ice_mask(n: usize, margin: usize) -> Array2<f64> {
    Array2::from_shape_fn((n, n), |(i, j)| {
        if i >= margin && j >= margin && i < n - margin && j < n - margin {
            1.0
        } else {
            0.0
        }
    })
}

// ─────────────────────────────────────────────────────────────
//  Test: twin experiment with the linear model
// ─────────────────────────────────────────────────────────────

/// The reference surface is produced from a known bed, so the misfit +
/// bed-outside objective has its minimum (zero) at that bed.  Verify:
///   1. The optimiser runs without error
///   2. The cost drops by orders of magnitude
///   3. The recovered bed is close to the true one
#[test]
fn recover_bed_linear_model() {
    init_logger();
    let n = 10;
    let k = 0.5;
    let ref_ice_mask = interior_ice_mask(n, 2);
    let true_bed = Array2::from_shape_fn((n, n), |(i, j)| 1200.0 + 6.0 * i as f64 + 2.0 * (j as f64).sqrt());
    let thickness = Array2::from_shape_fn((n, n), |(i, j)| 50.0 + ((i * 3 + j) % 5) as f64 * 10.0);
    let spinup_surf = &true_bed + &(&thickness * &ref_ice_mask);
    let ref_surf = &true_bed * (1.0 - k) + &spinup_surf * k;

    let lambdas = Lambdas::zeros().with(RegularizationTerm::BedOutsideGlacier, 1.0);
    let mut cost_fn = CostFunction::new(
        ReferenceInputs { spinup_surf: spinup_surf.clone(), ref_surf, ref_ice_mask },
        lambdas,
        1.0,
        100.0,
        LinearMassBalance::default(),
        LinearForward { k },
        Some(DataLogger::new()),
    )
    .unwrap();

    let initial_bed = true_bed.mapv(|b| b - 20.0);
    let (initial_cost, _) = cost_fn.evaluate(&initial_bed.iter().copied().collect::<Vec<_>>()).unwrap();

    let options = SolverOptions {
        max_iterations: 200,
        gradient_tolerance: 1e-5,
        ..SolverOptions::default()
    };
    let result = optimizer::invert(&mut cost_fn, &initial_bed, &options).unwrap();

    assert!(result.iterations > 0, "should run at least 1 iteration");
    assert!(
        result.cost < initial_cost * 1e-6,
        "cost {:.3e} not reduced enough from {:.3e}",
        result.cost,
        initial_cost
    );
    let max_err = (&result.bed - &true_bed).iter().fold(0.0_f64, |m, e| m.max(e.abs()));
    assert!(max_err < 0.1, "max bed error = {max_err:.4}");

    let logger = cost_fn.logger().unwrap();
    assert!(logger.len() > 1);
    assert!(logger.costs.iter().all(|c| c.is_finite()));

    eprintln!(
        "recover_bed_linear_model: {} iterations, {} evaluations, converged={}, max error {max_err:.2e}",
        result.iterations,
        logger.len(),
        result.converged
    );
}

// ─────────────────────────────────────────────────────────────
//  Test: a few L-BFGS iterations through the shallow-ice model
// ─────────────────────────────────────────────────────────────

#[test]
fn shallow_ice_inversion_reduces_cost() {
    init_logger();
    let n = 8;
    let ref_ice_mask = interior_ice_mask(n, 2);
    let ground = Array2::from_shape_fn((n, n), |(i, j)| 2000.0 + 4.0 * i as f64 + 2.0 * j as f64);
    let thickness = Array2::from_shape_fn((n, n), |(i, j)| {
        let di = i as f64 - 3.5;
        let dj = j as f64 - 3.5;
        (55.0 - 4.0 * (di * di + dj * dj)) * ref_ice_mask[[i, j]]
    });
    let spinup_surf = &ground + &thickness;
    let ref_surf = &spinup_surf - &ref_ice_mask.mapv(|m| m * 3.0);

    let mass_balance = LinearMassBalance {
        ela_h: 2035.0,
        gradient: 0.005,
        max_mb: 2.0,
    };
    let lambdas = Lambdas::zeros()
        .with(RegularizationTerm::BedOutsideGlacier, 1.0)
        .with(RegularizationTerm::IceOutsideGlacier, 1.0);
    let mut cost_fn = CostFunction::new(
        ReferenceInputs { spinup_surf, ref_surf, ref_ice_mask },
        lambdas,
        3.0,
        100.0,
        mass_balance,
        ShallowIceModel::default(),
        None,
    )
    .unwrap();

    let initial_bed = ground.mapv(|b| b + 4.0);
    let flat: Vec<f64> = initial_bed.iter().copied().collect();
    let (initial_cost, grad) = cost_fn.evaluate(&flat).unwrap();
    assert!(grad.iter().any(|&g| g != 0.0));

    let options = SolverOptions {
        max_iterations: 5,
        ..SolverOptions::default()
    };
    let result = optimizer::invert(&mut cost_fn, &initial_bed, &options).unwrap();

    assert!(result.cost.is_finite());
    assert!(
        result.cost < initial_cost,
        "cost {:.6e} not below initial {:.6e}",
        result.cost,
        initial_cost
    );
    assert!(result.bed.iter().all(|b| b.is_finite()));
    eprintln!(
        "shallow_ice_inversion_reduces_cost: {:.4e} → {:.4e} in {} iterations",
        initial_cost, result.cost, result.iterations
    );
}

#[test]
fn invert_rejects_wrong_initial_shape() {
    let n = 6;
    let ref_ice_mask = interior_ice_mask(n, 1);
    let surf = Array2::from_elem((n, n), 100.0);
    let mut cost_fn = CostFunction::new(
        ReferenceInputs { spinup_surf: surf.clone(), ref_surf: surf, ref_ice_mask },
        Lambdas::zeros(),
        1.0,
        10.0,
        LinearMassBalance::default(),
        LinearForward { k: 1.0 },
        None,
    )
    .unwrap();
    let err = optimizer::invert(&mut cost_fn, &Array2::zeros((n, n + 1)), &SolverOptions::default()).unwrap_err();
    assert!(matches!(err, InversionError::Shape(_)));
}

// ─────────────────────────────────────────────────────────────
//  Test: configuration
// ─────────────────────────────────────────────────────────────

#[test]
fn config_defaults_and_overrides() {
    let config = InversionConfig::from_json(
        r#"{
            "years_to_run": 50,
            "lambdas": { "bed_curvature": 0.5, "local_mean_squared_difference": 2.0 },
            "mass_balance": { "ela_h": 2800.0 },
            "solver": { "max_iterations": 30 }
        }"#,
    )
    .unwrap();

    assert_eq!(config.years_to_run, 50.0);
    assert_eq!(config.dx, 100.0);
    assert_eq!(config.lambdas.get(RegularizationTerm::BedCurvature), 0.5);
    assert_eq!(config.lambdas.get(RegularizationTerm::LocalMeanSquaredDifference), 2.0);
    assert_eq!(config.lambdas.get(RegularizationTerm::BedGradient), 0.0);
    assert_eq!(config.mass_balance.ela_h, 2800.0);
    assert_eq!(config.mass_balance.gradient, LinearMassBalance::default().gradient);
    assert_eq!(config.ice_flow, ShallowIceModel::default());
    assert_eq!(config.solver.max_iterations, 30);
    assert_eq!(config.solver.memory, SolverOptions::default().memory);
    assert!(!config.log_iterations);
}

#[test]
fn config_rejects_bad_input() {
    let err = InversionConfig::from_json(r#"{ "lambdas": { "bed_gradient": -1.0 } }"#).unwrap_err();
    assert!(matches!(err, InversionError::InvalidLambda { term: RegularizationTerm::BedGradient, .. }));

    let err = InversionConfig::from_json("{ not json").unwrap_err();
    assert!(matches!(err, InversionError::Config(_)));

    let missing = std::env::temp_dir().join("subglacial-no-such-config.json");
    let err = load_config(&missing).unwrap_err();
    assert!(matches!(err, InversionError::Config(_)));
}

#[test]
fn config_file_roundtrip() {
    let path = std::env::temp_dir().join(format!("subglacial-config-{}.json", std::process::id()));
    std::fs::write(&path, r#"{ "dx": 50.0, "log_iterations": true }"#).unwrap();
    let config = load_config(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(config.dx, 50.0);
    assert!(config.log_iterations);
    assert_eq!(config.lambdas, Lambdas::zeros());
}

#[test]
fn cost_function_from_config() {
    init_logger();
    let n = 8;
    let ref_ice_mask = interior_ice_mask(n, 2);
    let ground = Array2::from_shape_fn((n, n), |(i, j)| 2000.0 + 4.0 * i as f64 + 2.0 * j as f64);
    let spinup_surf = &ground + &ref_ice_mask.mapv(|m| m * 40.0);
    let inputs = ReferenceInputs {
        ref_surf: &spinup_surf - &ref_ice_mask,
        spinup_surf,
        ref_ice_mask,
    };
    let bed: Vec<f64> = ground.iter().map(|b| b + 2.0).collect();

    let logged = InversionConfig::from_json(
        r#"{
            "years_to_run": 2,
            "dx": 100,
            "lambdas": { "bed_outside_glacier": 1.0 },
            "mass_balance": { "ela_h": 2030.5, "gradient": 0.005 },
            "log_iterations": true
        }"#,
    )
    .unwrap();
    let mut cost_fn = CostFunction::from_config(inputs.clone(), &logged).unwrap();
    assert_eq!(cost_fn.reference().years_to_run, 2.0);
    assert_eq!(cost_fn.lambdas().get(RegularizationTerm::BedOutsideGlacier), 1.0);

    let (first, _) = cost_fn.evaluate(&bed).unwrap();
    let shifted: Vec<f64> = bed.iter().map(|b| b - 1.0).collect();
    let (second, _) = cost_fn.evaluate(&shifted).unwrap();

    let logger = cost_fn.logger().unwrap();
    assert_eq!(logger.len(), 2);
    assert_eq!(logger.costs, vec![first, second]);
    assert_eq!(logger.beds[1].iter().copied().collect::<Vec<_>>(), shifted);

    let silent = InversionConfig {
        log_iterations: false,
        ..logged
    };
    let mut cost_fn = CostFunction::from_config(inputs, &silent).unwrap();
    cost_fn.evaluate(&bed).unwrap();
    assert!(cost_fn.logger().is_none());
}
