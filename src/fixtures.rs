//! Reference collaborator implementations.
//!
//! These are small closed-form models exercising every trait contract in
//! [`crate::model`]: a log-scale diagonal covariance, the classic
//! log-normally parameterized mixed-effect map `phi_j = beta_j exp(b_j)`,
//! and monomial trajectory/scale models whose phi-derivatives of any order
//! are exact falling-factorial products. The test-suite and benches build
//! on them; they also serve as templates for real model bindings.

use crate::evaluate::EvalError;
use crate::model::{
    CovarianceDerivatives, CovarianceResolver, MixedEffectMap, PhiDerivatives, ScaleModel,
    Sensitivity, SimulatedTrajectory, SubjectData, TrajectorySimulator,
};
use crate::order::DerivOrder;
use ndarray::{Array1, Array2, Array3, Array4, Array5, ArrayView1};

// --- covariance ---

/// `D(delta) = diag(exp(2 delta_k))`, so `delta_k` is the log standard
/// deviation of random effect `k` and `r = q`.
pub struct DiagonalCovariance;

impl CovarianceResolver for DiagonalCovariance {
    fn resolve(
        &self,
        delta: ArrayView1<f64>,
        order: DerivOrder,
    ) -> Result<CovarianceDerivatives, EvalError> {
        let q = delta.len();
        let k = order.rank();
        let var = delta.mapv(|d| (2.0 * d).exp());

        let mut d = Array2::zeros((q, q));
        let mut inv_d = Array2::zeros((q, q));
        for j in 0..q {
            d[[j, j]] = var[j];
            inv_d[[j, j]] = 1.0 / var[j];
        }

        let dd = (k >= 1).then(|| {
            let mut t = Array3::zeros((q, q, q));
            for j in 0..q {
                t[[j, j, j]] = 2.0 * var[j];
            }
            t
        });
        let dd2 = (k >= 2).then(|| {
            let mut t = Array4::zeros((q, q, q, q));
            for j in 0..q {
                t[[j, j, j, j]] = 4.0 * var[j];
            }
            t
        });

        Ok(CovarianceDerivatives {
            d,
            inv_d,
            dD_ddelta: dd,
            ddD_ddeltaddelta: dd2,
        })
    }
}

// --- mixed-effect map ---

/// `phi_j = beta_j exp(b_j)` with `m = p = q`: fixed effects are typical
/// values, random effects act multiplicatively on the log scale. All pure
/// and mixed derivatives are diagonal; anything with two beta indices is
/// zero because phi is linear in beta.
pub struct ExpProductMap;

impl MixedEffectMap for ExpProductMap {
    fn map(
        &self,
        beta: ArrayView1<f64>,
        b: ArrayView1<f64>,
        order: DerivOrder,
    ) -> Result<PhiDerivatives, EvalError> {
        let m = beta.len();
        if b.len() != m {
            return Err(EvalError::ShapeMismatch {
                what: "mixed-effect map inputs",
                expected: format!("({m}, {m})"),
                got: format!("({m}, {})", b.len()),
            });
        }
        let k = order.rank();
        let eb = b.mapv(f64::exp);
        let phi = Array1::from_iter((0..m).map(|j| beta[j] * eb[j]));

        // The only nonzero entries sit on the hyper-diagonal (j, j, ..., j):
        // repeated b-derivatives reproduce phi_j, one beta-derivative
        // replaces beta_j by 1.
        let diag3 = |v: &Array1<f64>| {
            let mut t = Array3::zeros((m, m, m));
            for j in 0..m {
                t[[j, j, j]] = v[j];
            }
            t
        };
        let diag4 = |v: &Array1<f64>| {
            let mut t = Array4::zeros((m, m, m, m));
            for j in 0..m {
                t[[j, j, j, j]] = v[j];
            }
            t
        };
        let diag5 = |v: &Array1<f64>| {
            let mut t = Array5::zeros((m, m, m, m, m));
            for j in 0..m {
                t[[j, j, j, j, j]] = v[j];
            }
            t
        };

        let mut out = PhiDerivatives {
            phi: phi.clone(),
            dphi_db: None,
            dphi_dbeta: None,
            ddphi_db_db: None,
            ddphi_db_dbeta: None,
            ddphi_dbeta_dbeta: None,
            dddphi_db_db_db: None,
            dddphi_db_db_dbeta: None,
            dddphi_db_dbeta_dbeta: None,
            ddddphi_db_db_db_db: None,
            ddddphi_db_db_db_dbeta: None,
            ddddphi_db_db_dbeta_dbeta: None,
        };
        if k >= 1 {
            out.dphi_db = Some(Array2::from_diag(&phi));
            out.dphi_dbeta = Some(Array2::from_diag(&eb));
        }
        if k >= 2 {
            out.ddphi_db_db = Some(diag3(&phi));
            out.ddphi_db_dbeta = Some(diag3(&eb));
            out.ddphi_dbeta_dbeta = Some(Array3::zeros((m, m, m)));
        }
        if k >= 3 {
            out.dddphi_db_db_db = Some(diag4(&phi));
            out.dddphi_db_db_dbeta = Some(diag4(&eb));
            out.dddphi_db_dbeta_dbeta = Some(Array4::zeros((m, m, m, m)));
        }
        if k >= 4 {
            out.ddddphi_db_db_db_db = Some(diag5(&phi));
            out.ddddphi_db_db_db_dbeta = Some(diag5(&eb));
            out.ddddphi_db_db_dbeta_dbeta = Some(Array5::zeros((m, m, m, m, m)));
        }
        Ok(out)
    }
}

// --- monomial forward models ---

/// A vector of affinely shifted monomials of `phi`:
/// `v_i = offset_i + coeff_i * prod_mu phi_mu^{expo[i, mu]}`.
///
/// Derivatives of any order are falling-factorial products, which makes
/// this the workhorse fixture for finite-difference validation of the
/// assembler: its sensitivities are exact at every order.
#[derive(Debug, Clone)]
pub struct Monomials {
    pub offset: Array1<f64>,
    pub coeff: Array1<f64>,
    /// Shape `[n, m]`; real-valued exponents are fine for positive phi.
    pub expo: Array2<f64>,
}

impl Monomials {
    fn partial(&self, i: usize, phi: ArrayView1<f64>, counts: &[usize]) -> f64 {
        let mut acc = self.coeff[i];
        for (mu, &c) in counts.iter().enumerate() {
            let e = self.expo[[i, mu]];
            let mut ff = 1.0;
            for j in 0..c {
                ff *= e - j as f64;
            }
            acc *= ff * phi[mu].powf(e - c as f64);
        }
        acc
    }

    /// Evaluates values and derivative tensors at `phi` up to `order`.
    pub fn sensitivity(&self, phi: ArrayView1<f64>, order: DerivOrder) -> Sensitivity {
        let n = self.coeff.len();
        let m = phi.len();
        let k = order.rank();
        let mut counts = vec![0usize; m];

        let mut value = Array1::zeros(n);
        for i in 0..n {
            value[i] = self.offset[i] + self.partial(i, phi, &counts);
        }

        let d1 = (k >= 1).then(|| {
            let mut t = Array2::zeros((n, m));
            for i in 0..n {
                for mu in 0..m {
                    counts.fill(0);
                    counts[mu] = 1;
                    t[[i, mu]] = self.partial(i, phi, &counts);
                }
            }
            t
        });
        let d2 = (k >= 2).then(|| {
            let mut t = Array3::zeros((n, m, m));
            for i in 0..n {
                for mu in 0..m {
                    for nu in 0..m {
                        counts.fill(0);
                        counts[mu] += 1;
                        counts[nu] += 1;
                        t[[i, mu, nu]] = self.partial(i, phi, &counts);
                    }
                }
            }
            t
        });
        let d3 = (k >= 3).then(|| {
            let mut t = Array4::zeros((n, m, m, m));
            for i in 0..n {
                for mu in 0..m {
                    for nu in 0..m {
                        for rho in 0..m {
                            counts.fill(0);
                            counts[mu] += 1;
                            counts[nu] += 1;
                            counts[rho] += 1;
                            t[[i, mu, nu, rho]] = self.partial(i, phi, &counts);
                        }
                    }
                }
            }
            t
        });
        let d4 = (k >= 4).then(|| {
            let mut t = Array5::zeros((n, m, m, m, m));
            for i in 0..n {
                for mu in 0..m {
                    for nu in 0..m {
                        for rho in 0..m {
                            for tau in 0..m {
                                counts.fill(0);
                                counts[mu] += 1;
                                counts[nu] += 1;
                                counts[rho] += 1;
                                counts[tau] += 1;
                                t[[i, mu, nu, rho, tau]] = self.partial(i, phi, &counts);
                            }
                        }
                    }
                }
            }
            t
        });

        Sensitivity {
            value,
            d1,
            d2,
            d3,
            d4,
        }
    }
}

/// Closed-form "simulator": measurement predictions, event times and event
/// sensitivities are each monomial vectors of `phi`.
pub struct MonomialTrajectory {
    pub y: Monomials,
    pub t: Monomials,
    pub r: Monomials,
}

impl TrajectorySimulator for MonomialTrajectory {
    fn simulate(
        &self,
        phi: ArrayView1<f64>,
        _data: &SubjectData,
        order: DerivOrder,
    ) -> Result<SimulatedTrajectory, EvalError> {
        Ok(SimulatedTrajectory {
            y: self.y.sensitivity(phi, order),
            t: self.t.sensitivity(phi, order),
            r: self.r.sensitivity(phi, order),
        })
    }
}

/// Heteroscedastic scale builder: one shifted monomial per grid point.
pub struct MonomialScale(pub Monomials);

impl ScaleModel for MonomialScale {
    fn scales(
        &self,
        phi: ArrayView1<f64>,
        _data: &SubjectData,
        order: DerivOrder,
    ) -> Result<Sensitivity, EvalError> {
        Ok(self.0.sensitivity(phi, order))
    }
}
