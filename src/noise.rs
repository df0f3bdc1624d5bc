//! Likelihood kernel for continuous measurements.
//!
//! The branch objective is a sum of independent per-slot terms, so every
//! cross-slot partial derivative is zero and the kernel returns only the
//! diagonal (per-slot) partials, packaged as [`SlotPartials`] with two
//! input families: family 0 is the prediction `Y_i`, family 1 the gathered
//! scale `s_i = Sigma[ind_y[i]]`.
//!
//! Normal case, with `r = Y_i - Ym[ind_y[i]]`:
//!
//! ```text
//! l_i = 0.5 (r/s)^2 + 0.5 ln(2 pi s^2)
//! ```
//!
//! LogNormal case, Gaussian on the log scale with `u = ln Y_i - ln Ym[..]`:
//!
//! ```text
//! l_i = 0.5 (u/s)^2 + 0.5 ln(2 pi s^2)
//! ```
//!
//! (the data-only `ln Ym` Jacobian constant is dropped; it carries no
//! parameter derivatives). Both cases expose all partials up to 4th order
//! in `(Y_i, s_i)`.

use crate::chain::SlotPartials;
use crate::evaluate::EvalError;
use crate::model::NoiseKind;
use crate::order::DerivOrder;
use ndarray::{Array2, Array3, Array4, Array5, ArrayView1};
use std::f64::consts::PI;

/// Per-slot partials of one loss term, ordered by how many of the
/// derivative indices hit the scale family: `d2[k]` is the second partial
/// with `k` scale-derivatives and `2 - k` prediction-derivatives, etc.
#[derive(Debug)]
struct TermPartials {
    value: f64,
    d1: [f64; 2],
    d2: [f64; 3],
    d3: [f64; 4],
    d4: [f64; 5],
}

fn normal_term(y: f64, ym: f64, s: f64) -> TermPartials {
    let r = y - ym;
    let s2 = s * s;
    let s3 = s2 * s;
    let s4 = s3 * s;
    let s5 = s4 * s;
    let s6 = s5 * s;
    TermPartials {
        value: 0.5 * r * r / s2 + 0.5 * (2.0 * PI * s2).ln(),
        d1: [r / s2, 1.0 / s - r * r / s3],
        d2: [1.0 / s2, -2.0 * r / s3, 3.0 * r * r / s4 - 1.0 / s2],
        d3: [
            0.0,
            -2.0 / s3,
            6.0 * r / s4,
            2.0 / s3 - 12.0 * r * r / s5,
        ],
        d4: [
            0.0,
            0.0,
            6.0 / s4,
            -24.0 * r / s5,
            60.0 * r * r / s6 - 6.0 / s4,
        ],
    }
}

fn log_normal_term(y: f64, ym: f64, s: f64) -> Result<TermPartials, EvalError> {
    if y <= 0.0 || ym <= 0.0 {
        // ln of a non-positive prediction or datum cannot give a finite loss.
        return Err(EvalError::NonFinite {
            what: "log-normal measurement term",
        });
    }
    let u = y.ln() - ym.ln();
    let s2 = s * s;
    let s3 = s2 * s;
    let s4 = s3 * s;
    let s5 = s4 * s;
    let s6 = s5 * s;
    let y2 = y * y;
    let y3 = y2 * y;
    let y4 = y3 * y;
    Ok(TermPartials {
        value: 0.5 * u * u / s2 + 0.5 * (2.0 * PI * s2).ln(),
        d1: [u / (s2 * y), 1.0 / s - u * u / s3],
        d2: [
            (1.0 - u) / (s2 * y2),
            -2.0 * u / (s3 * y),
            3.0 * u * u / s4 - 1.0 / s2,
        ],
        d3: [
            (2.0 * u - 3.0) / (s2 * y3),
            -2.0 * (1.0 - u) / (s3 * y2),
            6.0 * u / (s4 * y),
            2.0 / s3 - 12.0 * u * u / s5,
        ],
        d4: [
            (11.0 - 6.0 * u) / (s2 * y4),
            -2.0 * (2.0 * u - 3.0) / (s3 * y3),
            6.0 * (1.0 - u) / (s4 * y2),
            -24.0 * u / (s5 * y),
            60.0 * u * u / s6 - 6.0 / s4,
        ],
    })
}

/// Evaluates the measurement-noise kernel over all slots.
///
/// `y` holds the predicted values per slot, `ym_slot` and `s_slot` the
/// measured values and scales already gathered onto slots via `ind_y`.
/// Partials beyond `order` are not computed.
pub fn noise_partials(
    kind: NoiseKind,
    y: ArrayView1<f64>,
    ym_slot: ArrayView1<f64>,
    s_slot: ArrayView1<f64>,
    order: DerivOrder,
) -> Result<SlotPartials, EvalError> {
    let n = y.len();
    if ym_slot.len() != n || s_slot.len() != n {
        return Err(EvalError::ShapeMismatch {
            what: "noise kernel slots",
            expected: format!("({n}, {n})"),
            got: format!("({}, {})", ym_slot.len(), s_slot.len()),
        });
    }
    let k = order.rank();

    let mut value = 0.0;
    let mut d1 = (k >= 1).then(|| Array2::zeros((2, n)));
    let mut d2 = (k >= 2).then(|| Array3::zeros((2, 2, n)));
    let mut d3 = (k >= 3).then(|| Array4::zeros((2, 2, 2, n)));
    let mut d4 = (k >= 4).then(|| Array5::zeros((2, 2, 2, 2, n)));

    for i in 0..n {
        let term = match kind {
            NoiseKind::Normal => normal_term(y[i], ym_slot[i], s_slot[i]),
            NoiseKind::LogNormal => log_normal_term(y[i], ym_slot[i], s_slot[i])?,
        };
        value += term.value;

        if let Some(d1) = d1.as_mut() {
            for a in 0..2 {
                d1[[a, i]] = term.d1[a];
            }
        }
        // A family index is 0 (prediction) or 1 (scale), so the index sum
        // counts the scale-derivatives and selects the partial directly.
        if let Some(d2) = d2.as_mut() {
            for a in 0..2 {
                for b in 0..2 {
                    d2[[a, b, i]] = term.d2[a + b];
                }
            }
        }
        if let Some(d3) = d3.as_mut() {
            for a in 0..2 {
                for b in 0..2 {
                    for c in 0..2 {
                        d3[[a, b, c, i]] = term.d3[a + b + c];
                    }
                }
            }
        }
        if let Some(d4) = d4.as_mut() {
            for a in 0..2 {
                for b in 0..2 {
                    for c in 0..2 {
                        for d in 0..2 {
                            d4[[a, b, c, d, i]] = term.d4[a + b + c + d];
                        }
                    }
                }
            }
        }
    }

    Ok(SlotPartials {
        value,
        d1: d1.take(),
        d2: d2.take(),
        d3: d3.take(),
        d4: d4.take(),
    })
}
