//! Shared model fixture for the integration tests: a two-compartment-sized
//! problem (`q = p = m = r = 2`) with three measurement slots over a
//! two-point data grid, two event slots, heteroscedastic monomial scales
//! and a log-normally parameterized mixed-effect map. Every collaborator is
//! closed-form, so finite differences of the evaluator probe the assembler
//! and kernels, not simulator noise.

use mixedlik::fixtures::{
    DiagonalCovariance, ExpProductMap, MonomialScale, MonomialTrajectory, Monomials,
};
use mixedlik::{
    DerivOrder, EvalSettings, NoiseKind, Parameters, PriorKind, SubjectData, SubjectDerivatives,
    SubjectModel, TimeKind, evaluate_subject,
};
use ndarray::{Array1, array};

pub struct Harness {
    pub traj: MonomialTrajectory,
    pub noise_scale: MonomialScale,
    pub time_scale: MonomialScale,
    pub data: SubjectData,
}

impl Harness {
    pub fn new() -> Self {
        let traj = MonomialTrajectory {
            // Three prediction slots, two of them sharing grid point 0.
            y: Monomials {
                offset: array![0.1, 0.0, 0.2],
                coeff: array![1.0, 0.8, 0.5],
                expo: array![[1.0, 0.5], [2.0, -1.0], [0.5, 1.0]],
            },
            t: Monomials {
                offset: array![0.5, 1.0],
                coeff: array![0.4, 0.3],
                expo: array![[1.0, 0.0], [0.5, 0.5]],
            },
            r: Monomials {
                offset: array![0.2, 0.1],
                coeff: array![1.2, 0.9],
                expo: array![[0.5, 0.0], [0.0, 1.0]],
            },
        };
        let noise_scale = MonomialScale(Monomials {
            offset: array![0.3, 0.4],
            coeff: array![0.2, 0.1],
            expo: array![[0.5, 0.0], [0.0, 1.0]],
        });
        let time_scale = MonomialScale(Monomials {
            offset: array![0.25, 0.35],
            coeff: array![0.15, 0.05],
            expo: array![[1.0, 0.0], [0.0, 0.5]],
        });
        let data = SubjectData {
            ym: array![1.2, 0.7],
            ind_y: vec![0, 1, 0],
            tm: array![0.8, 1.1],
            ind_t: vec![0, 1],
            time: array![0.0, 0.5, 1.0],
            covariates: Array1::zeros(0),
            subject: 1,
        };
        Harness {
            traj,
            noise_scale,
            time_scale,
            data,
        }
    }

    pub fn model(&self, noise_kind: NoiseKind) -> SubjectModel<'_> {
        SubjectModel {
            covariance: &DiagonalCovariance,
            map: &ExpProductMap,
            simulator: &self.traj,
            noise_scale: &self.noise_scale,
            time_scale: &self.time_scale,
            noise_kind,
            time_kind: TimeKind::Normal,
            prior_kind: PriorKind::Normal,
        }
    }

    /// Evaluates without the Hessian ridge, for exact derivative checks.
    pub fn eval(&self, kind: NoiseKind, point: &Parameters, order: DerivOrder) -> SubjectDerivatives {
        evaluate_subject(
            &self.model(kind),
            &self.data,
            point,
            order,
            &EvalSettings { hessian_ridge: 0.0 },
        )
        .unwrap()
    }
}

pub fn base_point() -> Parameters {
    Parameters {
        beta: array![1.3, 0.9],
        b: array![0.2, -0.3],
        delta: array![0.1, -0.2],
    }
}

#[derive(Clone, Copy)]
pub enum Var {
    B,
    Beta,
    Delta,
}

pub fn perturbed(point: &Parameters, var: Var, j: usize, h: f64) -> Parameters {
    let mut out = point.clone();
    match var {
        Var::B => out.b[j] += h,
        Var::Beta => out.beta[j] += h,
        Var::Delta => out.delta[j] += h,
    }
    out
}
