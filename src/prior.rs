//! Random-effect prior kernel.
//!
//! For the normal prior the contribution is the zero-mean multivariate
//! Gaussian negative log-density
//!
//! ```text
//! J_b = 0.5 b' invD b + 0.5 ln det D + (q/2) ln 2 pi
//! ```
//!
//! with `D = D(delta)` from the covariance resolver. b-derivatives follow
//! the quadratic form directly (third and fourth order vanish);
//! delta-derivatives go through `D` with
//!
//! ```text
//! d invD / d delta_k  = -invD A_k invD            (A_k = dD/d delta_k)
//! d ln det D / d_k    = tr(invD A_k)
//! ```
//!
//! and the second delta-derivatives use the resolver's `d2D`. This branch
//! never sees `beta` or `phi`; every mixed partial containing `beta` is
//! zero and is supplied by the evaluator, not computed here.

use crate::evaluate::EvalError;
use crate::model::{CovarianceDerivatives, PriorKind};
use crate::order::DerivOrder;
use ndarray::{Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, s};
use ndarray_linalg::{Cholesky, UPLO};
use std::f64::consts::PI;

/// Prior value and the derivative tensors the prior branch contributes.
///
/// Tensors absent here (`dddJdbdbdb`, `ddddJdbdbdbdb`, `ddddJdbdbdbddelta`)
/// are identically zero for the normal prior because `J_b` is quadratic in
/// `b`; the evaluator materializes those zeros.
#[derive(Debug, Clone)]
pub struct PriorPartials {
    pub value: f64,
    pub dJdb: Option<Array1<f64>>,
    pub dJddelta: Option<Array1<f64>>,
    pub ddJdbdb: Option<Array2<f64>>,
    pub ddJdbddelta: Option<Array2<f64>>,
    pub ddJddeltaddelta: Option<Array2<f64>>,
    pub dddJdbdbddelta: Option<Array3<f64>>,
    pub dddJdbddeltaddelta: Option<Array3<f64>>,
    pub ddddJdbdbddeltaddelta: Option<Array4<f64>>,
}

fn trace(a: ArrayView2<f64>) -> f64 {
    a.diag().sum()
}

/// Evaluates the prior kernel at `b` for a resolved covariance.
pub fn prior_partials(
    kind: PriorKind,
    b: ArrayView1<f64>,
    cov: &CovarianceDerivatives,
    order: DerivOrder,
) -> Result<PriorPartials, EvalError> {
    let PriorKind::Normal = kind;

    let q = b.len();
    if cov.d.dim() != (q, q) || cov.inv_d.dim() != (q, q) {
        return Err(EvalError::ShapeMismatch {
            what: "covariance matrix",
            expected: format!("({q}, {q})"),
            got: format!("{:?} / {:?}", cov.d.dim(), cov.inv_d.dim()),
        });
    }
    let k = order.rank();
    let inv_d = &cov.inv_d;

    // Positive-definiteness gate and stable log-determinant in one step.
    let lower = cov
        .d
        .cholesky(UPLO::Lower)
        .map_err(|_| EvalError::CovarianceNotPositiveDefinite)?;
    let log_det: f64 = lower.diag().mapv(f64::ln).sum() * 2.0;

    let quad = b.dot(&inv_d.dot(&b));
    let mut out = PriorPartials {
        value: 0.5 * quad + 0.5 * log_det + 0.5 * q as f64 * (2.0 * PI).ln(),
        dJdb: None,
        dJddelta: None,
        ddJdbdb: None,
        ddJdbddelta: None,
        ddJddeltaddelta: None,
        dddJdbdbddelta: None,
        dddJdbddeltaddelta: None,
        ddddJdbdbddeltaddelta: None,
    };
    if k == 0 {
        return Ok(out);
    }

    out.dJdb = Some(inv_d.dot(&b));

    let dd = cov
        .dD_ddelta
        .as_ref()
        .ok_or(EvalError::MissingDerivative {
            what: "dD/ddelta",
            order: 1,
        })?;
    let r = dd.dim().2;
    if dd.dim() != (q, q, r) {
        return Err(EvalError::ShapeMismatch {
            what: "dD/ddelta",
            expected: format!("({q}, {q}, r)"),
            got: format!("{:?}", dd.dim()),
        });
    }

    // M_k = invD A_k, P_k = invD A_k invD = -dinvD/ddelta_k.
    let mut m_k: Vec<Array2<f64>> = Vec::with_capacity(r);
    let mut p_k: Vec<Array2<f64>> = Vec::with_capacity(r);
    for kk in 0..r {
        let a_k = dd.slice(s![.., .., kk]);
        let m = inv_d.dot(&a_k);
        let p = m.dot(inv_d);
        m_k.push(m);
        p_k.push(p);
    }

    {
        let mut dj = Array1::zeros(r);
        for kk in 0..r {
            dj[kk] = -0.5 * b.dot(&p_k[kk].dot(&b)) + 0.5 * trace(m_k[kk].view());
        }
        out.dJddelta = Some(dj);
    }
    if k == 1 {
        return Ok(out);
    }

    out.ddJdbdb = Some(inv_d.clone());

    {
        let mut dbd = Array2::zeros((q, r));
        for kk in 0..r {
            let col = p_k[kk].dot(&b);
            for i in 0..q {
                dbd[[i, kk]] = -col[i];
            }
        }
        out.ddJdbddelta = Some(dbd);
    }

    let d2d = cov
        .ddD_ddeltaddelta
        .as_ref()
        .ok_or(EvalError::MissingDerivative {
            what: "d2D/ddelta2",
            order: 2,
        })?;
    if d2d.dim() != (q, q, r, r) {
        return Err(EvalError::ShapeMismatch {
            what: "d2D/ddelta2",
            expected: format!("({q}, {q}, {r}, {r})"),
            got: format!("{:?}", d2d.dim()),
        });
    }

    // H_kl = d2 invD / ddelta_k ddelta_l, assembled from the first-order
    // pieces plus the resolver's curvature of D itself.
    let mut h = vec![vec![Array2::<f64>::zeros((q, q)); r]; r];
    let mut dd2 = Array2::zeros((r, r));
    for kk in 0..r {
        for ll in kk..r {
            let b_kl = d2d.slice(s![.., .., kk, ll]);
            let inv_b_inv = inv_d.dot(&b_kl).dot(inv_d);
            let h_kl = m_k[ll].dot(&p_k[kk]) + m_k[kk].dot(&p_k[ll]) - inv_b_inv;
            let logdet_kl =
                trace(inv_d.dot(&b_kl).view()) - trace(m_k[ll].dot(&m_k[kk]).view());
            dd2[[kk, ll]] = 0.5 * b.dot(&h_kl.dot(&b)) + 0.5 * logdet_kl;
            dd2[[ll, kk]] = dd2[[kk, ll]];
            h[ll][kk] = h_kl.clone();
            h[kk][ll] = h_kl;
        }
    }
    out.ddJddeltaddelta = Some(dd2);
    if k == 2 {
        return Ok(out);
    }

    {
        let mut t = Array3::zeros((q, q, r));
        for kk in 0..r {
            for i in 0..q {
                for j in 0..q {
                    t[[i, j, kk]] = -p_k[kk][[i, j]];
                }
            }
        }
        out.dddJdbdbddelta = Some(t);

        let mut t = Array3::zeros((q, r, r));
        for kk in 0..r {
            for ll in 0..r {
                let col = h[kk][ll].dot(&b);
                for i in 0..q {
                    t[[i, kk, ll]] = col[i];
                }
            }
        }
        out.dddJdbddeltaddelta = Some(t);
    }
    if k == 3 {
        return Ok(out);
    }

    {
        let mut t = Array4::zeros((q, q, r, r));
        for kk in 0..r {
            for ll in 0..r {
                for i in 0..q {
                    for j in 0..q {
                        t[[i, j, kk, ll]] = h[kk][ll][[i, j]];
                    }
                }
            }
        }
        out.ddddJdbdbddeltaddelta = Some(t);
    }

    Ok(out)
}
