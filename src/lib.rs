#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

//! # mixedlik
//!
//! Evaluates, for one subject of a nonlinear mixed-effects model, the
//! negative-log-likelihood contribution
//!
//! ```text
//! J(b, beta, delta) = J_noise + J_time + J_prior
//! ```
//!
//! together with its exact analytic derivatives: up to 4th order in the
//! random effects `b`, mixed with up to 2nd order in the fixed effects
//! `beta` and the covariance parameters `delta`.
//!
//! The crate is a hand-written higher-order chain-rule pipeline. Model
//! components (covariance resolver, mixed-effect map, trajectory simulator,
//! noise-scale builders) are consumed through the traits in [`model`]; the
//! likelihood kernels in [`noise`], [`event`] and [`prior`] produce partial
//! derivatives of the per-observation losses, and [`chain`] recombines
//! everything through the Faa di Bruno partition sums into total derivative
//! tensors with respect to `b`, `beta` and `delta`.
//!
//! Evaluation is pure and single-threaded: one call to
//! [`evaluate::evaluate_subject`] computes one `(point, order)` pair and
//! returns. Parallelism across subjects, optimization, model parsing and
//! ODE integration are all the caller's business.

pub mod chain;
pub mod evaluate;
pub mod event;
pub mod fixtures;
pub mod model;
pub mod noise;
pub mod order;
pub mod prior;

pub use evaluate::{EvalError, EvalSettings, evaluate_subject};
pub use model::{
    CovarianceDerivatives, CovarianceResolver, MixedEffectMap, NoiseKind, Parameters,
    PhiDerivatives, PriorKind, ScaleModel, Sensitivity, SimulatedTrajectory, SubjectData,
    SubjectModel, TimeKind, TrajectorySimulator,
};
pub use order::{DerivOrder, SubjectDerivatives};
