//! **subglacial**: glacier bed inversion by PDE-constrained optimisation.
//!
//! Given a spinup surface and a later observed surface, find the bed that
//! a forward glacier model turns into the observed surface, subject to
//! smoothness and plausibility penalties:
//!
//! 1. **Masks** (`masks`): ice / inner masks via a 3×3 window sum.
//! 2. **Tape** (`tape`): reverse-mode differentiation on 2-D fields, with
//!    custom backward rules.
//! 3. **Operators** (`operators`): masked central first/second differences.
//! 4. **Terms** (`terms`): nine switchable penalties + surface misfit.
//! 5. **Custom primitive** (`lmsd`): hand-differentiated misfit term.
//! 6. **Forward model** (`forward`): model traits, adapter, shallow-ice
//!    model and linear mass balance.
//! 7. **Cost function** (`cost`): `flat bed → (cost, gradient)`.
//! 8. **Logger** (`logger`): per-evaluation record of a run.
//! 9. **Optimiser** (`optimizer`): L-BFGS via `argmin`.
//! 10. **Config** (`config`): JSON run settings.

pub mod types;
pub mod masks;
pub mod tape;
pub mod operators;
pub mod lmsd;
pub mod terms;
pub mod forward;
pub mod logger;
pub mod cost;
pub mod optimizer;
pub mod config;

pub use cost::{CostFunction, ReferenceState};
pub use forward::{ForwardModel, LinearMassBalance, MassBalanceModel, ShallowIceModel};
pub use logger::DataLogger;
pub use types::{CostBreakdown, InversionError, Lambdas, ReferenceInputs, RegularizationTerm};
