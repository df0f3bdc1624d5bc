//! Parameter and data containers, model-kind tags, and the trait contracts
//! through which the evaluator consumes its external collaborators.
//!
//! The evaluator never computes a trajectory, a covariance matrix, a
//! mixed-effect map or a noise scale itself; those four stages are supplied
//! by the caller behind the traits below and are treated as opaque. Each
//! trait returns the value of its quantity together with derivative tensors
//! up to exactly the requested [`DerivOrder`], in the index convention
//! `[output-component, V1, V2, ...]`.

use crate::evaluate::EvalError;
use crate::order::DerivOrder;
use ndarray::{Array1, Array2, Array3, Array4, Array5, ArrayView1};
use serde::{Deserialize, Serialize};

// --- Parameter point and subject data ---

/// One evaluation point in the full parameter space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    /// Fixed effects `beta`, length `p`.
    pub beta: Array1<f64>,
    /// Random effects `b`, length `q`.
    pub b: Array1<f64>,
    /// Free covariance parameters `delta`, length `r`.
    pub delta: Array1<f64>,
}

/// Measured data and experimental design for one subject.
///
/// `ind_y[i]` maps the `i`-th predicted measurement slot to its position on
/// the measurement grid (`ym` and the noise-scale vector live on that
/// grid); `ind_t` does the same for event slots. A grid position may be
/// referenced by several slots, which is how shared predictions map to
/// multiple residual terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectData {
    /// Measured values on the measurement grid.
    pub ym: Array1<f64>,
    /// Slot-to-grid index map for measurements.
    pub ind_y: Vec<usize>,
    /// Measured event times on the event grid.
    pub tm: Array1<f64>,
    /// Slot-to-grid index map for events.
    pub ind_t: Vec<usize>,
    /// Simulation time grid.
    pub time: Array1<f64>,
    /// Experimental condition descriptor (doses, covariates, ...), passed
    /// through to the simulator untouched.
    pub covariates: Array1<f64>,
    /// Subject index, for logging only.
    pub subject: usize,
}

// --- Model-kind tags ---

/// Distribution family of the measurement noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoiseKind {
    /// Additive Gaussian noise on the observation scale.
    Normal,
    /// Gaussian noise on the log scale (log-normal observations).
    LogNormal,
}

/// Distribution family of the event-time residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeKind {
    /// Gaussian residual-time model: the time residual is mapped to
    /// observation space by the event sensitivity `R`.
    Normal,
}

/// Distribution family of the random-effect prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorKind {
    /// Zero-mean multivariate normal with covariance `D(delta)`.
    Normal,
}

// --- Collaborator output bundles ---

/// A vector-valued quantity with its derivative tensors w.r.t. `phi`.
///
/// `value` has length `n`; `d1` is `[n, m]`, `d2` is `[n, m, m]` and so on,
/// with `m = phi.len()`. Tensors beyond the requested order are `None`;
/// tensors up to the requested order must be present.
#[derive(Debug, Clone)]
pub struct Sensitivity {
    pub value: Array1<f64>,
    pub d1: Option<Array2<f64>>,
    pub d2: Option<Array3<f64>>,
    pub d3: Option<Array4<f64>>,
    pub d4: Option<Array5<f64>>,
}

impl Sensitivity {
    /// A constant (phi-independent) quantity: all derivatives are zero.
    pub fn constant(value: Array1<f64>, m: usize, order: DerivOrder) -> Self {
        let n = value.len();
        let k = order.rank();
        Sensitivity {
            value,
            d1: (k >= 1).then(|| Array2::zeros((n, m))),
            d2: (k >= 2).then(|| Array3::zeros((n, m, m))),
            d3: (k >= 3).then(|| Array4::zeros((n, m, m, m))),
            d4: (k >= 4).then(|| Array5::zeros((n, m, m, m, m))),
        }
    }
}

/// Simulated predictions for one subject: measurement predictions `Y`,
/// event times `T` and the per-event auxiliary sensitivity `R`, each with
/// phi-derivatives to the requested order.
#[derive(Debug, Clone)]
pub struct SimulatedTrajectory {
    pub y: Sensitivity,
    pub t: Sensitivity,
    pub r: Sensitivity,
}

/// Covariance matrix of the random effects and its delta-derivatives.
///
/// `d` and `inv_d` are `[q, q]`; `dD_ddelta` is `[q, q, r]` and
/// `ddD_ddeltaddelta` is `[q, q, r, r]`, both symmetric in the leading
/// matrix axes (and the latter in its two delta axes).
#[derive(Debug, Clone)]
pub struct CovarianceDerivatives {
    pub d: Array2<f64>,
    pub inv_d: Array2<f64>,
    pub dD_ddelta: Option<Array3<f64>>,
    pub ddD_ddeltaddelta: Option<Array4<f64>>,
}

/// The mixed-effect parameter vector `phi(beta, b)` and its derivatives.
///
/// Axis order is `[phi-component, b-axes..., beta-axes...]`. The reference
/// formulation stopped at third order; exact fourth-order totals need the
/// fourth-order tensors as well, so they are part of the contract and are
/// requested only when the caller asks for `DerivOrder::Fourth`. For the
/// usual affine or log-normally parameterized maps they are cheap or zero.
#[derive(Debug, Clone)]
pub struct PhiDerivatives {
    pub phi: Array1<f64>,
    pub dphi_db: Option<Array2<f64>>,
    pub dphi_dbeta: Option<Array2<f64>>,
    pub ddphi_db_db: Option<Array3<f64>>,
    pub ddphi_db_dbeta: Option<Array3<f64>>,
    pub ddphi_dbeta_dbeta: Option<Array3<f64>>,
    pub dddphi_db_db_db: Option<Array4<f64>>,
    pub dddphi_db_db_dbeta: Option<Array4<f64>>,
    pub dddphi_db_dbeta_dbeta: Option<Array4<f64>>,
    pub ddddphi_db_db_db_db: Option<Array5<f64>>,
    pub ddddphi_db_db_db_dbeta: Option<Array5<f64>>,
    pub ddddphi_db_db_dbeta_dbeta: Option<Array5<f64>>,
}

// --- Collaborator traits ---

/// Maps the free covariance parameters to `D`, `inv(D)` and derivatives.
pub trait CovarianceResolver {
    fn resolve(
        &self,
        delta: ArrayView1<f64>,
        order: DerivOrder,
    ) -> Result<CovarianceDerivatives, EvalError>;
}

/// Maps `(beta, b)` to the physical parameter vector `phi` and its mixed
/// derivatives.
pub trait MixedEffectMap {
    fn map(
        &self,
        beta: ArrayView1<f64>,
        b: ArrayView1<f64>,
        order: DerivOrder,
    ) -> Result<PhiDerivatives, EvalError>;
}

/// Simulates the dynamical system at `phi` for one subject's design,
/// returning predictions and their phi-sensitivities.
pub trait TrajectorySimulator {
    fn simulate(
        &self,
        phi: ArrayView1<f64>,
        data: &SubjectData,
        order: DerivOrder,
    ) -> Result<SimulatedTrajectory, EvalError>;
}

/// Builds a heteroscedastic standard-deviation vector on a data grid from
/// `phi`, with phi-derivatives.
pub trait ScaleModel {
    fn scales(
        &self,
        phi: ArrayView1<f64>,
        data: &SubjectData,
        order: DerivOrder,
    ) -> Result<Sensitivity, EvalError>;
}

/// The full set of collaborators plus the model-kind tags for one subject.
/// Kind dispatch happens once per evaluation, not per derivative order.
pub struct SubjectModel<'a> {
    pub covariance: &'a dyn CovarianceResolver,
    pub map: &'a dyn MixedEffectMap,
    pub simulator: &'a dyn TrajectorySimulator,
    pub noise_scale: &'a dyn ScaleModel,
    pub time_scale: &'a dyn ScaleModel,
    pub noise_kind: NoiseKind,
    pub time_kind: TimeKind,
    pub prior_kind: PriorKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn parameters_serde_round_trip() {
        let point = Parameters {
            beta: array![1.0, 2.0],
            b: array![0.1, -0.2],
            delta: array![0.3],
        };
        let json = serde_json::to_string(&point).unwrap();
        let back: Parameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back.beta, point.beta);
        assert_eq!(back.b, point.b);
        assert_eq!(back.delta, point.delta);
    }

    #[test]
    fn constant_sensitivity_matches_requested_order() {
        let s = Sensitivity::constant(array![1.0, 2.0, 3.0], 4, DerivOrder::Second);
        assert_eq!(s.d1.as_ref().unwrap().dim(), (3, 4));
        assert_eq!(s.d2.as_ref().unwrap().dim(), (3, 4, 4));
        assert!(s.d3.is_none());
        assert!(s.d4.is_none());
    }
}
