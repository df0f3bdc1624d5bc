//! Likelihood kernel for event times.
//!
//! Observed event times enter through a Gaussian residual-time model in
//! which the time residual is mapped to observation space by the event
//! sensitivity `R` (the trajectory's crossing speed at the predicted
//! event). With `w = T_i - Tm[ind_t[i]]`, `z = R_i * w` and
//! `s = Sigma_time[ind_t[i]]`:
//!
//! ```text
//! l_i = 0.5 (z/s)^2 + 0.5 ln(2 pi s^2)
//! ```
//!
//! Unlike the measurement kernel, the three input families interact: every
//! cross partial among {T, R, s} up to 4th order is populated. Different
//! event slots still never interact; the kernel stays diagonal in the slot
//! index. Family order in the returned [`SlotPartials`]: 0 = `T`, 1 = `R`,
//! 2 = scale.

use crate::chain::SlotPartials;
use crate::evaluate::EvalError;
use crate::model::TimeKind;
use crate::order::DerivOrder;
use ndarray::{Array2, Array3, Array4, Array5, ArrayView1};
use std::f64::consts::PI;

/// Scalar partials of one event term. `z` is bilinear in `(T, R)`, so
/// every partial reduces to derivatives of `g(z, s) = 0.5 z^2/s^2 +
/// 0.5 ln(2 pi s^2)` times low-degree monomials in `rho` and `w`; pure
/// `z`-derivatives of `g` beyond second order vanish.
struct EventTerm {
    value: f64,
    rho: f64,
    w: f64,
    g_z: f64,
    g_s: f64,
    g_zz: f64,
    g_zs: f64,
    g_ss: f64,
    g_zzs: f64,
    g_zss: f64,
    g_sss: f64,
    g_zzss: f64,
    g_zsss: f64,
    g_ssss: f64,
}

impl EventTerm {
    fn new(t: f64, tm: f64, rho: f64, s: f64) -> Self {
        let w = t - tm;
        let z = rho * w;
        let s2 = s * s;
        let s3 = s2 * s;
        let s4 = s3 * s;
        let s5 = s4 * s;
        let s6 = s5 * s;
        EventTerm {
            value: 0.5 * z * z / s2 + 0.5 * (2.0 * PI * s2).ln(),
            rho,
            w,
            g_z: z / s2,
            g_s: 1.0 / s - z * z / s3,
            g_zz: 1.0 / s2,
            g_zs: -2.0 * z / s3,
            g_ss: 3.0 * z * z / s4 - 1.0 / s2,
            g_zzs: -2.0 / s3,
            g_zss: 6.0 * z / s4,
            g_sss: 2.0 / s3 - 12.0 * z * z / s5,
            g_zzss: 6.0 / s4,
            g_zsss: -24.0 * z / s5,
            g_ssss: 60.0 * z * z / s6 - 6.0 / s4,
        }
    }

    /// Partial derivative with `c = [#T, #R, #s]` differentiations.
    fn partial(&self, c: [usize; 3]) -> f64 {
        let (rho, w) = (self.rho, self.w);
        match c {
            [1, 0, 0] => self.g_z * rho,
            [0, 1, 0] => self.g_z * w,
            [0, 0, 1] => self.g_s,

            [2, 0, 0] => self.g_zz * rho * rho,
            [1, 1, 0] => self.g_zz * rho * w + self.g_z,
            [0, 2, 0] => self.g_zz * w * w,
            [1, 0, 1] => self.g_zs * rho,
            [0, 1, 1] => self.g_zs * w,
            [0, 0, 2] => self.g_ss,

            [2, 1, 0] => 2.0 * self.g_zz * rho,
            [1, 2, 0] => 2.0 * self.g_zz * w,
            [2, 0, 1] => self.g_zzs * rho * rho,
            [1, 1, 1] => self.g_zzs * rho * w + self.g_zs,
            [0, 2, 1] => self.g_zzs * w * w,
            [1, 0, 2] => self.g_zss * rho,
            [0, 1, 2] => self.g_zss * w,
            [0, 0, 3] => self.g_sss,

            [2, 2, 0] => 2.0 * self.g_zz,
            [2, 1, 1] => 2.0 * self.g_zzs * rho,
            [1, 2, 1] => 2.0 * self.g_zzs * w,
            [2, 0, 2] => self.g_zzss * rho * rho,
            [1, 1, 2] => self.g_zzss * rho * w + self.g_zss,
            [0, 2, 2] => self.g_zzss * w * w,
            [1, 0, 3] => self.g_zsss * rho,
            [0, 1, 3] => self.g_zsss * w,
            [0, 0, 4] => self.g_ssss,

            // Third or more derivatives through the bilinear z in the same
            // variable, e.g. [3, 0, 0] or [3, 1, 0], vanish identically.
            _ => 0.0,
        }
    }
}

/// Evaluates the event-time kernel over all event slots.
///
/// `t` and `r` are the simulated event times and sensitivities per slot;
/// `tm_slot` and `s_slot` are the measured times and scales gathered onto
/// slots via `ind_t`.
pub fn event_partials(
    kind: TimeKind,
    t: ArrayView1<f64>,
    r: ArrayView1<f64>,
    tm_slot: ArrayView1<f64>,
    s_slot: ArrayView1<f64>,
    order: DerivOrder,
) -> Result<SlotPartials, EvalError> {
    // Single closed family so far; the tag fixes the residual model once
    // per call rather than per derivative order.
    let TimeKind::Normal = kind;

    let n = t.len();
    if r.len() != n || tm_slot.len() != n || s_slot.len() != n {
        return Err(EvalError::ShapeMismatch {
            what: "event kernel slots",
            expected: format!("({n}, {n}, {n})"),
            got: format!("({}, {}, {})", r.len(), tm_slot.len(), s_slot.len()),
        });
    }
    let k = order.rank();

    let mut value = 0.0;
    let mut d1 = (k >= 1).then(|| Array2::zeros((3, n)));
    let mut d2 = (k >= 2).then(|| Array3::zeros((3, 3, n)));
    let mut d3 = (k >= 3).then(|| Array4::zeros((3, 3, 3, n)));
    let mut d4 = (k >= 4).then(|| Array5::zeros((3, 3, 3, 3, n)));

    let count = |fams: &[usize]| -> [usize; 3] {
        let mut c = [0usize; 3];
        for &f in fams {
            c[f] += 1;
        }
        c
    };

    for i in 0..n {
        let term = EventTerm::new(t[i], tm_slot[i], r[i], s_slot[i]);
        value += term.value;

        if let Some(d1) = d1.as_mut() {
            for a in 0..3 {
                d1[[a, i]] = term.partial(count(&[a]));
            }
        }
        if let Some(d2) = d2.as_mut() {
            for a in 0..3 {
                for b in 0..3 {
                    d2[[a, b, i]] = term.partial(count(&[a, b]));
                }
            }
        }
        if let Some(d3) = d3.as_mut() {
            for a in 0..3 {
                for b in 0..3 {
                    for c in 0..3 {
                        d3[[a, b, c, i]] = term.partial(count(&[a, b, c]));
                    }
                }
            }
        }
        if let Some(d4) = d4.as_mut() {
            for a in 0..3 {
                for b in 0..3 {
                    for c in 0..3 {
                        for d in 0..3 {
                            d4[[a, b, c, d, i]] = term.partial(count(&[a, b, c, d]));
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
