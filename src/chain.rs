//! The derivative assembler: higher-order chain-rule recombination.
//!
//! Both observation branches of the objective are sums of per-slot losses,
//!
//! ```text
//! J_branch(phi) = sum_i l(u_i(phi), v_i(phi), ...)
//! ```
//!
//! with one scalar loss `l` per slot depending on a small number of
//! *families* of slot inputs (prediction and scale for the noise branch;
//! event time, event sensitivity and scale for the event branch). The
//! assembler works in two stages:
//!
//! 1. [`phi_totals`] contracts per-slot kernel partials ([`SlotPartials`])
//!    against the per-family phi-sensitivities, producing total derivative
//!    tensors of the branch with respect to `phi` (ranks 1..=4).
//! 2. [`outer_totals`] composes those phi-tensors with the derivatives of
//!    the mixed-effect map `phi(beta, b)`, producing every requested outer
//!    pattern in `b` and `beta`.
//!
//! Each stage is the generalized (Faa di Bruno) chain rule: a "pure
//! contraction" term pairing the order-k tensor with k first-order inner
//! Jacobians, plus curvature corrections pairing lower-order tensors with
//! higher inner derivatives, summed over the set partitions of the outer
//! differentiation indices. Every contraction asserts its operand shapes;
//! axis placement is done with explicit `permuted_axes` steps rather than
//! implicit broadcasting.

use crate::evaluate::EvalError;
use crate::model::{PhiDerivatives, Sensitivity};
use crate::order::DerivOrder;
use ndarray::{Array1, Array2, Array3, Array4, Array5, Axis, s};

/// Per-slot partial derivatives of a branch kernel.
///
/// `F` is the number of input families of the kernel (2 for the noise
/// branch, 3 for the event branch) and `n` the number of slots. `d1` is
/// `[F, n]`; `d2` is `[F, F, n]`, symmetric in the family axes, and so on.
/// The kernels are sums of independent per-slot terms, so no cross-slot
/// partials exist and none are stored.
#[derive(Debug, Clone)]
pub struct SlotPartials {
    /// Summed per-slot loss.
    pub value: f64,
    pub d1: Option<Array2<f64>>,
    pub d2: Option<Array3<f64>>,
    pub d3: Option<Array4<f64>>,
    pub d4: Option<Array5<f64>>,
}

/// Total derivative tensors of one branch with respect to `phi`.
#[derive(Debug, Clone)]
pub struct PhiTensors {
    pub value: f64,
    pub g1: Option<Array1<f64>>,
    pub g2: Option<Array2<f64>>,
    pub g3: Option<Array3<f64>>,
    pub g4: Option<Array4<f64>>,
}

impl PhiTensors {
    pub fn zeros(m: usize, order: DerivOrder) -> Self {
        let k = order.rank();
        PhiTensors {
            value: 0.0,
            g1: (k >= 1).then(|| Array1::zeros(m)),
            g2: (k >= 2).then(|| Array2::zeros((m, m))),
            g3: (k >= 3).then(|| Array3::zeros((m, m, m))),
            g4: (k >= 4).then(|| Array4::zeros((m, m, m, m))),
        }
    }

    /// Adds another branch's tensors in place. Both operands must have been
    /// built for the same `m` and order.
    pub fn accumulate(&mut self, other: &PhiTensors) {
        self.value += other.value;
        if let (Some(a), Some(b)) = (self.g1.as_mut(), other.g1.as_ref()) {
            *a += b;
        }
        if let (Some(a), Some(b)) = (self.g2.as_mut(), other.g2.as_ref()) {
            *a += b;
        }
        if let (Some(a), Some(b)) = (self.g3.as_mut(), other.g3.as_ref()) {
            *a += b;
        }
        if let (Some(a), Some(b)) = (self.g4.as_mut(), other.g4.as_ref()) {
            *a += b;
        }
    }
}

/// Total derivative tensors of the observation branches with respect to
/// the outer variables `b` (length `q`) and `beta` (length `p`). Patterns
/// involving `delta` never pass through `phi` and are supplied by the
/// prior kernel instead.
#[derive(Debug, Clone)]
pub struct OuterTensors {
    pub value: f64,
    pub db: Option<Array1<f64>>,
    pub dbeta: Option<Array1<f64>>,
    pub dbb: Option<Array2<f64>>,
    pub dbbeta: Option<Array2<f64>>,
    pub dbetabeta: Option<Array2<f64>>,
    pub dbbb: Option<Array3<f64>>,
    pub dbbbeta: Option<Array3<f64>>,
    pub dbbetabeta: Option<Array3<f64>>,
    pub dbbbb: Option<Array4<f64>>,
    pub dbbbbeta: Option<Array4<f64>>,
    pub dbbbetabeta: Option<Array4<f64>>,
}

// --- shape assertions ---

fn shape_err(what: &'static str, expected: String, got: String) -> EvalError {
    EvalError::ShapeMismatch {
        what,
        expected,
        got,
    }
}

fn check2(what: &'static str, a: &Array2<f64>, want: (usize, usize)) -> Result<(), EvalError> {
    if a.dim() != want {
        return Err(shape_err(what, format!("{:?}", want), format!("{:?}", a.dim())));
    }
    Ok(())
}

fn check3(
    what: &'static str,
    a: &Array3<f64>,
    want: (usize, usize, usize),
) -> Result<(), EvalError> {
    if a.dim() != want {
        return Err(shape_err(what, format!("{:?}", want), format!("{:?}", a.dim())));
    }
    Ok(())
}

fn check4(
    what: &'static str,
    a: &Array4<f64>,
    want: (usize, usize, usize, usize),
) -> Result<(), EvalError> {
    if a.dim() != want {
        return Err(shape_err(what, format!("{:?}", want), format!("{:?}", a.dim())));
    }
    Ok(())
}

fn check5(
    what: &'static str,
    a: &Array5<f64>,
    want: (usize, usize, usize, usize, usize),
) -> Result<(), EvalError> {
    if a.dim() != want {
        return Err(shape_err(what, format!("{:?}", want), format!("{:?}", a.dim())));
    }
    Ok(())
}

fn require<'a, T>(
    slot: &'a Option<T>,
    what: &'static str,
    order: usize,
) -> Result<&'a T, EvalError> {
    slot.as_ref()
        .ok_or(EvalError::MissingDerivative { what, order })
}

// --- stage 1: slot partials -> phi tensors ---

/// Contracts per-slot kernel partials against the per-family
/// phi-sensitivities, producing branch totals with respect to `phi`.
///
/// `fams[f]` must be the slot-level sensitivity of family `f`: `value` of
/// length `n` and derivative tensors `[n, m, ...]` up to the requested
/// order. Scale families must already be gathered from the data grid onto
/// slots by the caller.
pub fn phi_totals(
    partials: &SlotPartials,
    fams: &[&Sensitivity],
    m: usize,
    order: DerivOrder,
) -> Result<PhiTensors, EvalError> {
    let F = fams.len();
    let n = fams.first().map_or(0, |f| f.value.len());
    let k = order.rank();

    let mut out = PhiTensors::zeros(m, order);
    out.value = partials.value;
    if k == 0 {
        return Ok(out);
    }

    // First-order inner Jacobians, one [n, m] matrix per family.
    let mut j1: Vec<&Array2<f64>> = Vec::with_capacity(F);
    for fam in fams {
        let d1 = require(&fam.d1, "family d1", 1)?;
        check2("family d1", d1, (n, m))?;
        j1.push(d1);
    }
    let l1 = require(&partials.d1, "kernel d1", 1)?;
    check2("kernel d1", l1, (F, n))?;

    {
        let g1 = out.g1.as_mut().unwrap();
        for f in 0..F {
            for i in 0..n {
                let w = l1[[f, i]];
                if w == 0.0 {
                    continue;
                }
                for mu in 0..m {
                    g1[mu] += w * j1[f][[i, mu]];
                }
            }
        }
    }
    if k == 1 {
        return Ok(out);
    }

    let mut j2: Vec<&Array3<f64>> = Vec::with_capacity(F);
    for fam in fams {
        let d2 = require(&fam.d2, "family d2", 2)?;
        check3("family d2", d2, (n, m, m))?;
        j2.push(d2);
    }
    let l2 = require(&partials.d2, "kernel d2", 2)?;
    check3("kernel d2", l2, (F, F, n))?;

    {
        let g2 = out.g2.as_mut().unwrap();
        for i in 0..n {
            // Pure contraction: second kernel partials against two first-order
            // inner Jacobians.
            for f in 0..F {
                for g in 0..F {
                    let w = l2[[f, g, i]];
                    if w == 0.0 {
                        continue;
                    }
                    for mu in 0..m {
                        let a = w * j1[f][[i, mu]];
                        if a == 0.0 {
                            continue;
                        }
                        for nu in 0..m {
                            g2[[mu, nu]] += a * j1[g][[i, nu]];
                        }
                    }
                }
            }
            // Curvature correction: first kernel partials against the inner
            // second derivatives.
            for f in 0..F {
                let w = l1[[f, i]];
                if w == 0.0 {
                    continue;
                }
                for mu in 0..m {
                    for nu in 0..m {
                        g2[[mu, nu]] += w * j2[f][[i, mu, nu]];
                    }
                }
            }
        }
    }
    if k == 2 {
        return Ok(out);
    }

    let mut j3: Vec<&Array4<f64>> = Vec::with_capacity(F);
    for fam in fams {
        let d3 = require(&fam.d3, "family d3", 3)?;
        check4("family d3", d3, (n, m, m, m))?;
        j3.push(d3);
    }
    let l3 = require(&partials.d3, "kernel d3", 3)?;
    check4("kernel d3", l3, (F, F, F, n))?;

    {
        let g3 = out.g3.as_mut().unwrap();
        for i in 0..n {
            // Partition {1}{1}{1}.
            for f in 0..F {
                for g in 0..F {
                    for h in 0..F {
                        let w = l3[[f, g, h, i]];
                        if w == 0.0 {
                            continue;
                        }
                        for mu in 0..m {
                            let a = w * j1[f][[i, mu]];
                            if a == 0.0 {
                                continue;
                            }
                            for nu in 0..m {
                                let bcoef = a * j1[g][[i, nu]];
                                if bcoef == 0.0 {
                                    continue;
                                }
                                for rho in 0..m {
                                    g3[[mu, nu, rho]] += bcoef * j1[h][[i, rho]];
                                }
                            }
                        }
                    }
                }
            }
            // Partition {2}{1}, three placements of the pair.
            for f in 0..F {
                for g in 0..F {
                    let w = l2[[f, g, i]];
                    if w == 0.0 {
                        continue;
                    }
                    for mu in 0..m {
                        for nu in 0..m {
                            let hv = w * j2[f][[i, mu, nu]];
                            if hv == 0.0 {
                                continue;
                            }
                            for rho in 0..m {
                                let jv = j1[g][[i, rho]];
                                g3[[mu, nu, rho]] += hv * jv;
                                g3[[mu, rho, nu]] += hv * jv;
                                g3[[rho, mu, nu]] += hv * jv;
                            }
                        }
                    }
                }
            }
            // Partition {3}.
            for f in 0..F {
                let w = l1[[f, i]];
                if w == 0.0 {
                    continue;
                }
                for mu in 0..m {
                    for nu in 0..m {
                        for rho in 0..m {
                            g3[[mu, nu, rho]] += w * j3[f][[i, mu, nu, rho]];
                        }
                    }
                }
            }
        }
    }
    if k == 3 {
        return Ok(out);
    }

    let mut j4: Vec<&Array5<f64>> = Vec::with_capacity(F);
    for fam in fams {
        let d4 = require(&fam.d4, "family d4", 4)?;
        check5("family d4", d4, (n, m, m, m, m))?;
        j4.push(d4);
    }
    let l4 = require(&partials.d4, "kernel d4", 4)?;
    check5("kernel d4", l4, (F, F, F, F, n))?;

    {
        let g4 = out.g4.as_mut().unwrap();
        for i in 0..n {
            // Partition {1}{1}{1}{1}.
            for f in 0..F {
                for g in 0..F {
                    for h in 0..F {
                        for e in 0..F {
                            let w = l4[[f, g, h, e, i]];
                            if w == 0.0 {
                                continue;
                            }
                            for mu in 0..m {
                                let a = w * j1[f][[i, mu]];
                                if a == 0.0 {
                                    continue;
                                }
                                for nu in 0..m {
                                    let bcoef = a * j1[g][[i, nu]];
                                    if bcoef == 0.0 {
                                        continue;
                                    }
                                    for rho in 0..m {
                                        let c = bcoef * j1[h][[i, rho]];
                                        if c == 0.0 {
                                            continue;
                                        }
                                        for tau in 0..m {
                                            g4[[mu, nu, rho, tau]] += c * j1[e][[i, tau]];
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            // Partition {2}{1}{1}: six placements of the pair among the four
            // outer indices; the two singletons stay in index order.
            for f in 0..F {
                for g in 0..F {
                    for h in 0..F {
                        let w = l3[[f, g, h, i]];
                        if w == 0.0 {
                            continue;
                        }
                        for mu in 0..m {
                            for nu in 0..m {
                                let hv = w * j2[f][[i, mu, nu]];
                                if hv == 0.0 {
                                    continue;
                                }
                                for rho in 0..m {
                                    let a = hv * j1[g][[i, rho]];
                                    if a == 0.0 {
                                        continue;
                                    }
                                    for tau in 0..m {
                                        let v = a * j1[h][[i, tau]];
                                        // pair occupies (0,1), (0,2), (0,3),
                                        // (1,2), (1,3), (2,3) respectively.
                                        g4[[mu, nu, rho, tau]] += v;
                                        g4[[mu, rho, nu, tau]] += v;
                                        g4[[mu, rho, tau, nu]] += v;
                                        g4[[rho, mu, nu, tau]] += v;
                                        g4[[rho, mu, tau, nu]] += v;
                                        g4[[rho, tau, mu, nu]] += v;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            // Partition {2}{2}: three splits into two pairs.
            for f in 0..F {
                for g in 0..F {
                    let w = l2[[f, g, i]];
                    if w == 0.0 {
                        continue;
                    }
                    for mu in 0..m {
                        for nu in 0..m {
                            let hv = w * j2[f][[i, mu, nu]];
                            if hv == 0.0 {
                                continue;
                            }
                            for rho in 0..m {
                                for tau in 0..m {
                                    let v = hv * j2[g][[i, rho, tau]];
                                    g4[[mu, nu, rho, tau]] += v;
                                    g4[[mu, rho, nu, tau]] += v;
                                    g4[[mu, rho, tau, nu]] += v;
                                }
                            }
                        }
                    }
                }
            }
            // Partition {3}{1}: four placements of the singleton.
            for f in 0..F {
                for g in 0..F {
                    let w = l2[[f, g, i]];
                    if w == 0.0 {
                        continue;
                    }
                    for mu in 0..m {
                        for nu in 0..m {
                            for rho in 0..m {
                                let tv = w * j3[f][[i, mu, nu, rho]];
                                if tv == 0.0 {
                                    continue;
                                }
                                for tau in 0..m {
                                    let v = tv * j1[g][[i, tau]];
                                    g4[[mu, nu, rho, tau]] += v;
                                    g4[[mu, nu, tau, rho]] += v;
                                    g4[[mu, tau, nu, rho]] += v;
                                    g4[[tau, mu, nu, rho]] += v;
                                }
                            }
                        }
                    }
                }
            }
            // Partition {4}.
            for f in 0..F {
                let w = l1[[f, i]];
                if w == 0.0 {
                    continue;
                }
                for mu in 0..m {
                    for nu in 0..m {
                        for rho in 0..m {
                            for tau in 0..m {
                                g4[[mu, nu, rho, tau]] += w * j4[f][[i, mu, nu, rho, tau]];
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(out)
}

// --- stage 2 contraction primitives ---

fn vjp(k1: &Array1<f64>, j: &Array2<f64>) -> Array1<f64> {
    j.t().dot(k1)
}

/// `out[x, y] = sum_mu k1[mu] * h[mu, x, y]`
fn k1_dot3(k1: &Array1<f64>, h: &Array3<f64>) -> Array2<f64> {
    let (m, x, y) = h.dim();
    let mut out = Array2::zeros((x, y));
    for mu in 0..m {
        let w = k1[mu];
        if w == 0.0 {
            continue;
        }
        for a in 0..x {
            for b in 0..y {
                out[[a, b]] += w * h[[mu, a, b]];
            }
        }
    }
    out
}

fn k1_dot4(k1: &Array1<f64>, t: &Array4<f64>) -> Array3<f64> {
    let (m, x, y, z) = t.dim();
    let mut out = Array3::zeros((x, y, z));
    for mu in 0..m {
        let w = k1[mu];
        if w == 0.0 {
            continue;
        }
        for a in 0..x {
            for b in 0..y {
                for c in 0..z {
                    out[[a, b, c]] += w * t[[mu, a, b, c]];
                }
            }
        }
    }
    out
}

fn k1_dot5(k1: &Array1<f64>, t: &Array5<f64>) -> Array4<f64> {
    let (m, x, y, z, w_) = t.dim();
    let mut out = Array4::zeros((x, y, z, w_));
    for mu in 0..m {
        let w = k1[mu];
        if w == 0.0 {
            continue;
        }
        for a in 0..x {
            for b in 0..y {
                for c in 0..z {
                    for d in 0..w_ {
                        out[[a, b, c, d]] += w * t[[mu, a, b, c, d]];
                    }
                }
            }
        }
    }
    out
}

/// `out[x, y] = sum_{mu,nu} k2[mu, nu] * ja[mu, x] * jb[nu, y]`
fn k2_jj(k2: &Array2<f64>, ja: &Array2<f64>, jb: &Array2<f64>) -> Array2<f64> {
    ja.t().dot(k2).dot(jb)
}

/// `out[x, y, z] = sum_{mu,nu} k2[mu, nu] * h[mu, x, y] * j[nu, z]`
fn k2_hj(k2: &Array2<f64>, h: &Array3<f64>, j: &Array2<f64>) -> Array3<f64> {
    let (m, x, y) = h.dim();
    let z = j.dim().1;
    let mut out = Array3::zeros((x, y, z));
    for mu in 0..m {
        for nu in 0..m {
            let w = k2[[mu, nu]];
            if w == 0.0 {
                continue;
            }
            for a in 0..x {
                for b in 0..y {
                    let hv = w * h[[mu, a, b]];
                    if hv == 0.0 {
                        continue;
                    }
                    for c in 0..z {
                        out[[a, b, c]] += hv * j[[nu, c]];
                    }
                }
            }
        }
    }
    out
}

/// `out[x, y, z, w] = sum_{mu,nu} k2[mu, nu] * h1[mu, x, y] * h2[nu, z, w]`
fn k2_hh(k2: &Array2<f64>, h1: &Array3<f64>, h2: &Array3<f64>) -> Array4<f64> {
    let (m, x, y) = h1.dim();
    let (_, z, w_) = h2.dim();
    let mut out = Array4::zeros((x, y, z, w_));
    for mu in 0..m {
        for nu in 0..m {
            let w = k2[[mu, nu]];
            if w == 0.0 {
                continue;
            }
            for a in 0..x {
                for b in 0..y {
                    let hv = w * h1[[mu, a, b]];
                    if hv == 0.0 {
                        continue;
                    }
                    for c in 0..z {
                        for d in 0..w_ {
                            out[[a, b, c, d]] += hv * h2[[nu, c, d]];
                        }
                    }
                }
            }
        }
    }
    out
}

/// `out[x, y, z, w] = sum_{mu,nu} k2[mu, nu] * t[mu, x, y, z] * j[nu, w]`
fn k2_tj(k2: &Array2<f64>, t: &Array4<f64>, j: &Array2<f64>) -> Array4<f64> {
    let (m, x, y, z) = t.dim();
    let w_ = j.dim().1;
    let mut out = Array4::zeros((x, y, z, w_));
    for mu in 0..m {
        for nu in 0..m {
            let w = k2[[mu, nu]];
            if w == 0.0 {
                continue;
            }
            for a in 0..x {
                for b in 0..y {
                    for c in 0..z {
                        let tv = w * t[[mu, a, b, c]];
                        if tv == 0.0 {
                            continue;
                        }
                        for d in 0..w_ {
                            out[[a, b, c, d]] += tv * j[[nu, d]];
                        }
                    }
                }
            }
        }
    }
    out
}

/// `out[x, y, z] = sum_{mu,nu,rho} k3[mu, nu, rho] * ja[mu, x] * jb[nu, y] * jc[rho, z]`
fn k3_jjj(
    k3: &Array3<f64>,
    ja: &Array2<f64>,
    jb: &Array2<f64>,
    jc: &Array2<f64>,
) -> Array3<f64> {
    let m = k3.dim().0;
    let (x, y, z) = (ja.dim().1, jb.dim().1, jc.dim().1);
    let mut out = Array3::zeros((x, y, z));
    for mu in 0..m {
        for nu in 0..m {
            for rho in 0..m {
                let w = k3[[mu, nu, rho]];
                if w == 0.0 {
                    continue;
                }
                for a in 0..x {
                    let av = w * ja[[mu, a]];
                    if av == 0.0 {
                        continue;
                    }
                    for b in 0..y {
                        let bv = av * jb[[nu, b]];
                        if bv == 0.0 {
                            continue;
                        }
                        for c in 0..z {
                            out[[a, b, c]] += bv * jc[[rho, c]];
                        }
                    }
                }
            }
        }
    }
    out
}

/// `out[x, y, z, w] = sum k3[mu, nu, rho] * h[mu, x, y] * j1[nu, z] * j2[rho, w]`
fn k3_hjj(
    k3: &Array3<f64>,
    h: &Array3<f64>,
    j1: &Array2<f64>,
    j2: &Array2<f64>,
) -> Array4<f64> {
    let m = k3.dim().0;
    let (_, x, y) = h.dim();
    let (z, w_) = (j1.dim().1, j2.dim().1);
    let mut out = Array4::zeros((x, y, z, w_));
    for mu in 0..m {
        for nu in 0..m {
            for rho in 0..m {
                let w = k3[[mu, nu, rho]];
                if w == 0.0 {
                    continue;
                }
                for a in 0..x {
                    for b in 0..y {
                        let hv = w * h[[mu, a, b]];
                        if hv == 0.0 {
                            continue;
                        }
                        for c in 0..z {
                            let cv = hv * j1[[nu, c]];
                            if cv == 0.0 {
                                continue;
                            }
                            for d in 0..w_ {
                                out[[a, b, c, d]] += cv * j2[[rho, d]];
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

/// `out[x, y, z, w] = sum k4 * ja[mu, x] * jb[nu, y] * jc[rho, z] * jd[tau, w]`
fn k4_jjjj(
    k4: &Array4<f64>,
    ja: &Array2<f64>,
    jb: &Array2<f64>,
    jc: &Array2<f64>,
    jd: &Array2<f64>,
) -> Array4<f64> {
    let m = k4.dim().0;
    let (x, y, z, w_) = (ja.dim().1, jb.dim().1, jc.dim().1, jd.dim().1);
    let mut out = Array4::zeros((x, y, z, w_));
    for mu in 0..m {
        for nu in 0..m {
            for rho in 0..m {
                for tau in 0..m {
                    let w = k4[[mu, nu, rho, tau]];
                    if w == 0.0 {
                        continue;
                    }
                    for a in 0..x {
                        let av = w * ja[[mu, a]];
                        if av == 0.0 {
                            continue;
                        }
                        for b in 0..y {
                            let bv = av * jb[[nu, b]];
                            if bv == 0.0 {
                                continue;
                            }
                            for c in 0..z {
                                let cv = bv * jc[[rho, c]];
                                if cv == 0.0 {
                                    continue;
                                }
                                for d in 0..w_ {
                                    out[[a, b, c, d]] += cv * jd[[tau, d]];
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

// --- stage 2: phi tensors -> outer tensors ---

/// Holds the validated phi-map derivative tensors for one composition.
struct PhiMap<'a> {
    jb: &'a Array2<f64>,
    jbeta: &'a Array2<f64>,
    hbb: Option<&'a Array3<f64>>,
    hbbeta: Option<&'a Array3<f64>>,
    hbetabeta: Option<&'a Array3<f64>>,
    tbbb: Option<&'a Array4<f64>>,
    tbbbeta: Option<&'a Array4<f64>>,
    tbbetabeta: Option<&'a Array4<f64>>,
    qbbbb: Option<&'a Array5<f64>>,
    qbbbbeta: Option<&'a Array5<f64>>,
    qbbbetabeta: Option<&'a Array5<f64>>,
}

impl<'a> PhiMap<'a> {
    fn validate(
        phi: &'a PhiDerivatives,
        m: usize,
        q: usize,
        p: usize,
        order: DerivOrder,
    ) -> Result<Self, EvalError> {
        let k = order.rank();
        let jb = require(&phi.dphi_db, "dphi/db", 1)?;
        check2("dphi/db", jb, (m, q))?;
        let jbeta = require(&phi.dphi_dbeta, "dphi/dbeta", 1)?;
        check2("dphi/dbeta", jbeta, (m, p))?;

        let mut map = PhiMap {
            jb,
            jbeta,
            hbb: None,
            hbbeta: None,
            hbetabeta: None,
            tbbb: None,
            tbbbeta: None,
            tbbetabeta: None,
            qbbbb: None,
            qbbbbeta: None,
            qbbbetabeta: None,
        };
        if k >= 2 {
            let hbb = require(&phi.ddphi_db_db, "ddphi/dbdb", 2)?;
            check3("ddphi/dbdb", hbb, (m, q, q))?;
            let hbbeta = require(&phi.ddphi_db_dbeta, "ddphi/dbdbeta", 2)?;
            check3("ddphi/dbdbeta", hbbeta, (m, q, p))?;
            let hbetabeta = require(&phi.ddphi_dbeta_dbeta, "ddphi/dbetadbeta", 2)?;
            check3("ddphi/dbetadbeta", hbetabeta, (m, p, p))?;
            map.hbb = Some(hbb);
            map.hbbeta = Some(hbbeta);
            map.hbetabeta = Some(hbetabeta);
        }
        if k >= 3 {
            let tbbb = require(&phi.dddphi_db_db_db, "dddphi/dbdbdb", 3)?;
            check4("dddphi/dbdbdb", tbbb, (m, q, q, q))?;
            let tbbbeta = require(&phi.dddphi_db_db_dbeta, "dddphi/dbdbdbeta", 3)?;
            check4("dddphi/dbdbdbeta", tbbbeta, (m, q, q, p))?;
            let tbbetabeta = require(&phi.dddphi_db_dbeta_dbeta, "dddphi/dbdbetadbeta", 3)?;
            check4("dddphi/dbdbetadbeta", tbbetabeta, (m, q, p, p))?;
            map.tbbb = Some(tbbb);
            map.tbbbeta = Some(tbbbeta);
            map.tbbetabeta = Some(tbbetabeta);
        }
        if k >= 4 {
            let qbbbb = require(&phi.ddddphi_db_db_db_db, "ddddphi/db4", 4)?;
            check5("ddddphi/db4", qbbbb, (m, q, q, q, q))?;
            let qbbbbeta = require(&phi.ddddphi_db_db_db_dbeta, "ddddphi/db3dbeta", 4)?;
            check5("ddddphi/db3dbeta", qbbbbeta, (m, q, q, q, p))?;
            let qbbbetabeta = require(&phi.ddddphi_db_db_dbeta_dbeta, "ddddphi/db2dbeta2", 4)?;
            check5("ddddphi/db2dbeta2", qbbbetabeta, (m, q, q, p, p))?;
            map.qbbbb = Some(qbbbb);
            map.qbbbbeta = Some(qbbbbeta);
            map.qbbbetabeta = Some(qbbbetabeta);
        }
        Ok(map)
    }
}

/// Composes branch phi-tensors with the mixed-effect map derivatives,
/// producing the total derivatives of the branch with respect to `b` and
/// `beta` for every requested pattern.
pub fn outer_totals(
    k: &PhiTensors,
    phi: &PhiDerivatives,
    q: usize,
    p: usize,
    order: DerivOrder,
) -> Result<OuterTensors, EvalError> {
    let m = phi.phi.len();
    let rank = order.rank();

    let mut out = OuterTensors {
        value: k.value,
        db: None,
        dbeta: None,
        dbb: None,
        dbbeta: None,
        dbetabeta: None,
        dbbb: None,
        dbbbeta: None,
        dbbetabeta: None,
        dbbbb: None,
        dbbbbeta: None,
        dbbbetabeta: None,
    };
    if rank == 0 {
        return Ok(out);
    }

    let map = PhiMap::validate(phi, m, q, p, order)?;
    let k1 = require(&k.g1, "branch g1", 1)?;

    out.db = Some(vjp(k1, map.jb));
    out.dbeta = Some(vjp(k1, map.jbeta));
    if rank == 1 {
        return Ok(out);
    }

    let k2 = require(&k.g2, "branch g2", 2)?;
    let (hbb, hbbeta, hbetabeta) = (
        map.hbb.unwrap(),
        map.hbbeta.unwrap(),
        map.hbetabeta.unwrap(),
    );

    out.dbb = Some(k2_jj(k2, map.jb, map.jb) + k1_dot3(k1, hbb));
    out.dbbeta = Some(k2_jj(k2, map.jb, map.jbeta) + k1_dot3(k1, hbbeta));
    out.dbetabeta = Some(k2_jj(k2, map.jbeta, map.jbeta) + k1_dot3(k1, hbetabeta));
    if rank == 2 {
        return Ok(out);
    }

    let k3 = require(&k.g3, "branch g3", 3)?;
    let (tbbb, tbbbeta, tbbetabeta) = (
        map.tbbb.unwrap(),
        map.tbbbeta.unwrap(),
        map.tbbetabeta.unwrap(),
    );

    out.dbbb = Some(if q == 1 {
        dbbb_collapsed(k1, k2, k3, map.jb, hbb, tbbb)
    } else {
        dbbb_general(k1, k2, k3, map.jb, hbb, tbbb)
    });
    out.dbbbeta = Some(if q == 1 {
        dbbbeta_collapsed(k1, k2, k3, &map, hbb, tbbbeta, p)
    } else {
        dbbbeta_general(k1, k2, k3, &map, hbb, tbbbeta)
    });
    out.dbbetabeta = Some(dbbetabeta_general(
        k1, k2, k3, &map, hbetabeta, tbbetabeta,
    ));
    if rank == 3 {
        return Ok(out);
    }

    let k4 = require(&k.g4, "branch g4", 4)?;
    let (qbbbb, qbbbbeta, qbbbetabeta) = (
        map.qbbbb.unwrap(),
        map.qbbbbeta.unwrap(),
        map.qbbbetabeta.unwrap(),
    );

    // d4J/db4: sum over the set partitions of four b-indices.
    {
        let mut t = k4_jjjj(k4, map.jb, map.jb, map.jb, map.jb);

        let u = k3_hjj(k3, hbb, map.jb, map.jb);
        t += &u;
        t += &u.clone().permuted_axes([0, 2, 1, 3]);
        t += &u.clone().permuted_axes([0, 2, 3, 1]);
        t += &u.clone().permuted_axes([2, 0, 1, 3]);
        t += &u.clone().permuted_axes([2, 0, 3, 1]);
        t += &u.clone().permuted_axes([2, 3, 0, 1]);

        let v = k2_hh(k2, hbb, hbb);
        t += &v;
        t += &v.clone().permuted_axes([0, 2, 1, 3]);
        t += &v.clone().permuted_axes([0, 2, 3, 1]);

        let w = k2_tj(k2, tbbb, map.jb);
        t += &w;
        t += &w.clone().permuted_axes([0, 1, 3, 2]);
        t += &w.clone().permuted_axes([0, 3, 1, 2]);
        t += &w.clone().permuted_axes([3, 0, 1, 2]);

        t += &k1_dot5(k1, qbbbb);
        out.dbbbb = Some(t);
    }

    // d4J/db3 dbeta.
    {
        let mut t = k4_jjjj(k4, map.jb, map.jb, map.jb, map.jbeta);

        // Pair of b-indices; singletons are the remaining b and beta.
        let u = k3_hjj(k3, hbb, map.jb, map.jbeta);
        t += &u;
        t += &u.clone().permuted_axes([0, 2, 1, 3]);
        t += &u.clone().permuted_axes([2, 0, 1, 3]);

        // (b, beta) pair; singletons are the two remaining b's.
        let v = k3_hjj(k3, hbbeta, map.jb, map.jb);
        t += &v.clone().permuted_axes([0, 2, 3, 1]);
        t += &v.clone().permuted_axes([2, 0, 3, 1]);
        t += &v.clone().permuted_axes([2, 3, 0, 1]);

        // Two pairs: (b,b) with (b,beta).
        let w = k2_hh(k2, hbb, hbbeta);
        t += &w;
        t += &w.clone().permuted_axes([0, 2, 1, 3]);
        t += &w.clone().permuted_axes([2, 0, 1, 3]);

        // Triple + singleton.
        t += &k2_tj(k2, tbbb, map.jbeta);
        let x = k2_tj(k2, tbbbeta, map.jb);
        t += &x.clone().permuted_axes([0, 1, 3, 2]);
        t += &x.clone().permuted_axes([0, 3, 1, 2]);
        t += &x.clone().permuted_axes([3, 0, 1, 2]);

        t += &k1_dot5(k1, qbbbbeta);
        out.dbbbbeta = Some(t);
    }

    // d4J/db2 dbeta2.
    {
        let mut t = k4_jjjj(k4, map.jb, map.jb, map.jbeta, map.jbeta);

        t += &k3_hjj(k3, hbb, map.jbeta, map.jbeta);
        let u = k3_hjj(k3, hbbeta, map.jb, map.jbeta);
        t += &u.clone().permuted_axes([0, 2, 1, 3]);
        t += &u.clone().permuted_axes([0, 2, 3, 1]);
        t += &u.clone().permuted_axes([2, 0, 1, 3]);
        t += &u.clone().permuted_axes([2, 0, 3, 1]);
        let v = k3_hjj(k3, hbetabeta, map.jb, map.jb);
        t += &v.clone().permuted_axes([2, 3, 0, 1]);

        t += &k2_hh(k2, hbb, hbetabeta);
        let w = k2_hh(k2, hbbeta, hbbeta);
        t += &w.clone().permuted_axes([0, 2, 1, 3]);
        t += &w.clone().permuted_axes([0, 2, 3, 1]);

        let x = k2_tj(k2, tbbbeta, map.jbeta);
        t += &x;
        t += &x.clone().permuted_axes([0, 1, 3, 2]);
        let y = k2_tj(k2, tbbetabeta, map.jb);
        t += &y.clone().permuted_axes([0, 3, 1, 2]);
        t += &y.clone().permuted_axes([3, 0, 1, 2]);

        t += &k1_dot5(k1, qbbbetabeta);
        out.dbbbetabeta = Some(t);
    }

    Ok(out)
}

// Third-order b-only pattern, general q.
fn dbbb_general(
    k1: &Array1<f64>,
    k2: &Array2<f64>,
    k3: &Array3<f64>,
    jb: &Array2<f64>,
    hbb: &Array3<f64>,
    tbbb: &Array4<f64>,
) -> Array3<f64> {
    let mut t = k3_jjj(k3, jb, jb, jb);
    let u = k2_hj(k2, hbb, jb);
    t += &u;
    t += &u.clone().permuted_axes([0, 2, 1]);
    t += &u.clone().permuted_axes([2, 0, 1]);
    t += &k1_dot4(k1, tbbb);
    t
}

// Third-order b-only pattern for the singleton random effect. The b-axes
// collapse to scalars; the result is rebuilt as a [1, 1, 1] tensor so the
// axis layout matches the general branch exactly.
fn dbbb_collapsed(
    k1: &Array1<f64>,
    k2: &Array2<f64>,
    k3: &Array3<f64>,
    jb: &Array2<f64>,
    hbb: &Array3<f64>,
    tbbb: &Array4<f64>,
) -> Array3<f64> {
    let m = k1.len();
    let jb1 = jb.column(0).to_owned();
    let hbb1: Array1<f64> = hbb.slice(s![.., 0, 0]).to_owned();
    let tbbb1 = tbbb.slice(s![.., 0, 0, 0]).to_owned();

    let mut val = 0.0;
    for mu in 0..m {
        for nu in 0..m {
            for rho in 0..m {
                val += k3[[mu, nu, rho]] * jb1[mu] * jb1[nu] * jb1[rho];
            }
        }
    }
    val += 3.0 * hbb1.dot(&k2.dot(&jb1));
    val += k1.dot(&tbbb1);

    Array1::from_elem(1, val)
        .insert_axis(Axis(1))
        .insert_axis(Axis(2))
}

// Third-order (b, b, beta) pattern, general q.
fn dbbbeta_general(
    k1: &Array1<f64>,
    k2: &Array2<f64>,
    k3: &Array3<f64>,
    map: &PhiMap,
    hbb: &Array3<f64>,
    tbbbeta: &Array4<f64>,
) -> Array3<f64> {
    let hbbeta = map.hbbeta.unwrap();
    let mut t = k3_jjj(k3, map.jb, map.jb, map.jbeta);
    t += &k2_hj(k2, hbb, map.jbeta);
    let v = k2_hj(k2, hbbeta, map.jb);
    t += &v.clone().permuted_axes([0, 2, 1]);
    t += &v.clone().permuted_axes([2, 0, 1]);
    t += &k1_dot4(k1, tbbbeta);
    t
}

// Third-order (b, b, beta) pattern for the singleton random effect: the two
// b-axes collapse, the beta-profile is computed as a vector, and the result
// is restored to the general [1, 1, p] layout by an explicit axis
// permutation.
fn dbbbeta_collapsed(
    k1: &Array1<f64>,
    k2: &Array2<f64>,
    k3: &Array3<f64>,
    map: &PhiMap,
    hbb: &Array3<f64>,
    tbbbeta: &Array4<f64>,
    p: usize,
) -> Array3<f64> {
    let m = k1.len();
    let jb1 = map.jb.column(0).to_owned();
    let hbb1 = hbb.slice(s![.., 0, 0]).to_owned();
    let hbbeta1: Array2<f64> = map.hbbeta.unwrap().slice(s![.., 0, ..]).to_owned();
    let tbbbeta1: Array2<f64> = tbbbeta.slice(s![.., 0, 0, ..]).to_owned();

    let mut v = Array1::zeros(p);
    // {1}{1}{1}: contract two b-slots, profile over beta.
    for mu in 0..m {
        for nu in 0..m {
            let w = jb1[mu] * jb1[nu];
            if w == 0.0 {
                continue;
            }
            for a in 0..p {
                let mut acc = 0.0;
                for rho in 0..m {
                    acc += k3[[mu, nu, rho]] * map.jbeta[[rho, a]];
                }
                v[a] += w * acc;
            }
        }
    }
    // {bb}{beta} pair and the two {b,beta}{b} pairs.
    v += &map.jbeta.t().dot(&k2.dot(&hbb1));
    v += &(hbbeta1.t().dot(&k2.dot(&jb1)) * 2.0);
    // {bbbeta} triple.
    v += &tbbbeta1.t().dot(k1);

    v.insert_axis(Axis(1))
        .insert_axis(Axis(2))
        .permuted_axes([1, 2, 0])
}

// Third-order (b, beta, beta) pattern.
fn dbbetabeta_general(
    k1: &Array1<f64>,
    k2: &Array2<f64>,
    k3: &Array3<f64>,
    map: &PhiMap,
    hbetabeta: &Array3<f64>,
    tbbetabeta: &Array4<f64>,
) -> Array3<f64> {
    let hbbeta = map.hbbeta.unwrap();
    let mut t = k3_jjj(k3, map.jb, map.jbeta, map.jbeta);
    let w = k2_hj(k2, hbbeta, map.jbeta);
    t += &w;
    t += &w.clone().permuted_axes([0, 2, 1]);
    let x = k2_hj(k2, hbetabeta, map.jb);
    t += &x.clone().permuted_axes([2, 0, 1]);
    t += &k1_dot4(k1, tbbetabeta);
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    // Scalar single-family fixture: l(y) = y^3 composed with y(phi) = phi^2,
    // so J(phi) = phi^6 and the phi-totals have closed forms.
    fn cubic_partials(y: f64) -> SlotPartials {
        SlotPartials {
            value: y.powi(3),
            d1: Some(array![[3.0 * y * y]]),
            d2: Some(Array3::from_elem((1, 1, 1), 6.0 * y)),
            d3: Some(Array4::from_elem((1, 1, 1, 1), 6.0)),
            d4: Some(Array5::from_elem((1, 1, 1, 1, 1), 0.0)),
        }
    }

    fn square_sensitivity(phi: f64) -> Sensitivity {
        Sensitivity {
            value: array![phi * phi],
            d1: Some(array![[2.0 * phi]]),
            d2: Some(Array3::from_elem((1, 1, 1), 2.0)),
            d3: Some(Array4::from_elem((1, 1, 1, 1), 0.0)),
            d4: Some(Array5::from_elem((1, 1, 1, 1, 1), 0.0)),
        }
    }

    #[test]
    fn phi_totals_reproduce_scalar_faa_di_bruno() {
        let phi = 1.3_f64;
        let y = phi * phi;
        let partials = cubic_partials(y);
        let fam = square_sensitivity(phi);

        let k = phi_totals(&partials, &[&fam], 1, DerivOrder::Fourth).unwrap();
        assert_relative_eq!(k.value, phi.powi(6), max_relative = 1e-12);
        assert_relative_eq!(k.g1.unwrap()[0], 6.0 * phi.powi(5), max_relative = 1e-12);
        assert_relative_eq!(
            k.g2.unwrap()[[0, 0]],
            30.0 * phi.powi(4),
            max_relative = 1e-12
        );
        assert_relative_eq!(
            k.g3.unwrap()[[0, 0, 0]],
            120.0 * phi.powi(3),
            max_relative = 1e-12
        );
        assert_relative_eq!(
            k.g4.unwrap()[[0, 0, 0, 0]],
            360.0 * phi.powi(2),
            max_relative = 1e-12
        );
    }

    // phi(b, beta) = beta * exp(2 b) with scalar b and beta, feeding
    // J(phi) = phi^6 = beta^6 exp(12 b). Every mixed total has a closed
    // form to test the outer composition against.
    fn exp_phi_derivatives(b: f64, beta: f64) -> PhiDerivatives {
        let e = (2.0 * b).exp();
        PhiDerivatives {
            phi: array![beta * e],
            dphi_db: Some(array![[2.0 * beta * e]]),
            dphi_dbeta: Some(array![[e]]),
            ddphi_db_db: Some(Array3::from_elem((1, 1, 1), 4.0 * beta * e)),
            ddphi_db_dbeta: Some(Array3::from_elem((1, 1, 1), 2.0 * e)),
            ddphi_dbeta_dbeta: Some(Array3::from_elem((1, 1, 1), 0.0)),
            dddphi_db_db_db: Some(Array4::from_elem((1, 1, 1, 1), 8.0 * beta * e)),
            dddphi_db_db_dbeta: Some(Array4::from_elem((1, 1, 1, 1), 4.0 * e)),
            dddphi_db_dbeta_dbeta: Some(Array4::from_elem((1, 1, 1, 1), 0.0)),
            ddddphi_db_db_db_db: Some(Array5::from_elem((1, 1, 1, 1, 1), 16.0 * beta * e)),
            ddddphi_db_db_db_dbeta: Some(Array5::from_elem((1, 1, 1, 1, 1), 8.0 * e)),
            ddddphi_db_db_dbeta_dbeta: Some(Array5::from_elem((1, 1, 1, 1, 1), 0.0)),
        }
    }

    fn sixth_power_tensors(phi: f64) -> PhiTensors {
        PhiTensors {
            value: phi.powi(6),
            g1: Some(array![6.0 * phi.powi(5)]),
            g2: Some(Array2::from_elem((1, 1), 30.0 * phi.powi(4))),
            g3: Some(Array3::from_elem((1, 1, 1), 120.0 * phi.powi(3))),
            g4: Some(Array4::from_elem((1, 1, 1, 1), 360.0 * phi.powi(2))),
        }
    }

    #[test]
    fn outer_totals_match_closed_forms_in_b_and_beta() {
        let (b, beta) = (0.1_f64, 0.7_f64);
        let phi = beta * (2.0 * b).exp();
        let phid = exp_phi_derivatives(b, beta);
        let k = sixth_power_tensors(phi);

        let out = outer_totals(&k, &phid, 1, 1, DerivOrder::Fourth).unwrap();
        let j = beta.powi(6) * (12.0 * b).exp();

        assert_relative_eq!(out.value, j, max_relative = 1e-12);
        assert_relative_eq!(out.db.unwrap()[0], 12.0 * j, max_relative = 1e-12);
        assert_relative_eq!(out.dbeta.unwrap()[0], 6.0 * j / beta, max_relative = 1e-12);
        assert_relative_eq!(out.dbb.unwrap()[[0, 0]], 144.0 * j, max_relative = 1e-12);
        assert_relative_eq!(
            out.dbbeta.unwrap()[[0, 0]],
            72.0 * j / beta,
            max_relative = 1e-12
        );
        assert_relative_eq!(
            out.dbetabeta.unwrap()[[0, 0]],
            30.0 * j / (beta * beta),
            max_relative = 1e-12
        );
        assert_relative_eq!(
            out.dbbb.unwrap()[[0, 0, 0]],
            1728.0 * j,
            max_relative = 1e-12
        );
        assert_relative_eq!(
            out.dbbbeta.unwrap()[[0, 0, 0]],
            864.0 * j / beta,
            max_relative = 1e-12
        );
        assert_relative_eq!(
            out.dbbetabeta.unwrap()[[0, 0, 0]],
            360.0 * j / (beta * beta),
            max_relative = 1e-12
        );
        assert_relative_eq!(
            out.dbbbb.unwrap()[[0, 0, 0, 0]],
            20736.0 * j,
            max_relative = 1e-12
        );
        assert_relative_eq!(
            out.dbbbbeta.unwrap()[[0, 0, 0, 0]],
            10368.0 * j / beta,
            max_relative = 1e-12
        );
        assert_relative_eq!(
            out.dbbbetabeta.unwrap()[[0, 0, 0, 0]],
            4320.0 * j / (beta * beta),
            max_relative = 1e-12
        );
    }

    #[test]
    fn singleton_b_paths_agree_with_general_loops() {
        // q = 1, p = 2, m = 2: exercise both code paths on the same inputs.
        let m = 2;
        let k1 = array![0.7, -1.1];
        let k2 = array![[1.2, 0.3], [0.3, -0.5]];
        let mut k3 = Array3::zeros((m, m, m));
        // A symmetric rank-3 kernel with distinct entries.
        for mu in 0..m {
            for nu in 0..m {
                for rho in 0..m {
                    let mut idx = [mu, nu, rho];
                    idx.sort_unstable();
                    k3[[mu, nu, rho]] =
                        0.1 + idx[0] as f64 * 0.4 + idx[1] as f64 * 0.9 + idx[2] as f64 * 1.7;
                }
            }
        }

        let jb = array![[0.9], [-0.4]];
        let jbeta = array![[0.5, -0.2], [1.1, 0.8]];
        let hbb = Array3::from_shape_vec((m, 1, 1), vec![0.6, -0.3]).unwrap();
        let hbbeta = Array3::from_shape_vec((m, 1, 2), vec![0.2, -0.7, 0.4, 0.9]).unwrap();
        let tbbb = Array4::from_shape_vec((m, 1, 1, 1), vec![1.4, 0.2]).unwrap();
        let tbbbeta = Array4::from_shape_vec((m, 1, 1, 2), vec![-0.6, 0.3, 0.5, 1.2]).unwrap();

        let phid = PhiDerivatives {
            phi: array![1.0, 2.0],
            dphi_db: Some(jb.clone()),
            dphi_dbeta: Some(jbeta.clone()),
            ddphi_db_db: Some(hbb.clone()),
            ddphi_db_dbeta: Some(hbbeta.clone()),
            ddphi_dbeta_dbeta: Some(Array3::zeros((m, 2, 2))),
            dddphi_db_db_db: Some(tbbb.clone()),
            dddphi_db_db_dbeta: Some(tbbbeta.clone()),
            dddphi_db_dbeta_dbeta: Some(Array4::zeros((m, 1, 2, 2))),
            ddddphi_db_db_db_db: None,
            ddddphi_db_db_db_dbeta: None,
            ddddphi_db_db_dbeta_dbeta: None,
        };
        let map = PhiMap::validate(&phid, m, 1, 2, DerivOrder::Third).unwrap();

        let general = dbbb_general(&k1, &k2, &k3, &jb, &hbb, &tbbb);
        let collapsed = dbbb_collapsed(&k1, &k2, &k3, &jb, &hbb, &tbbb);
        assert_eq!(general.dim(), collapsed.dim());
        assert_relative_eq!(
            general[[0, 0, 0]],
            collapsed[[0, 0, 0]],
            max_relative = 1e-12
        );

        let general = dbbbeta_general(&k1, &k2, &k3, &map, &hbb, &tbbbeta);
        let collapsed = dbbbeta_collapsed(&k1, &k2, &k3, &map, &hbb, &tbbbeta, 2);
        assert_eq!(general.dim(), collapsed.dim());
        for a in 0..2 {
            assert_relative_eq!(
                general[[0, 0, a]],
                collapsed[[0, 0, a]],
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn missing_phi_derivative_is_a_typed_error() {
        let phid = PhiDerivatives {
            phi: array![1.0],
            dphi_db: Some(array![[1.0]]),
            dphi_dbeta: Some(array![[1.0]]),
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
        let k = sixth_power_tensors(1.0);
        let err = outer_totals(&k, &phid, 1, 1, DerivOrder::Second).unwrap_err();
        assert!(matches!(err, EvalError::MissingDerivative { order: 2, .. }));
    }
}
