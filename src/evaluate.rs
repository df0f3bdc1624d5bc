//! Per-subject objective evaluation.
//!
//! [`evaluate_subject`] is the single entry point: it resolves the
//! covariance, maps `(beta, b)` to `phi`, simulates the trajectory, gathers
//! data and scales from their grids onto slots, runs the two observation
//! kernels and the prior kernel, and assembles the total derivative tensors
//! of
//!
//! ```text
//! J = J_noise + J_time + J_prior
//! ```
//!
//! with respect to `(b, beta, delta)` up to the requested [`DerivOrder`].
//! The two observation branches share the composition through `phi`, so
//! their phi-tensors are summed and the outer chain rule runs once; the
//! prior never passes through `phi` and is added directly in outer space.

use crate::chain::{self, PhiTensors};
use crate::event::event_partials;
use crate::model::{Parameters, Sensitivity, SubjectData, SubjectModel};
use crate::noise::noise_partials;
use crate::order::{DerivOrder, SubjectDerivatives};
use crate::prior::prior_partials;
use ndarray::{Array, Array1, Array2, Array4, Axis, Dimension};
use thiserror::Error;

/// Everything that can go wrong in one evaluation.
#[derive(Error, Debug)]
pub enum EvalError {
    /// A collaborator returned a tensor whose shape disagrees with the
    /// parameter and data dimensions of this evaluation.
    #[error("shape mismatch in {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        got: String,
    },

    /// `D(delta)` failed its Cholesky factorization.
    #[error("random-effect covariance matrix is not positive definite")]
    CovarianceNotPositiveDefinite,

    /// A non-finite value appeared in an input term or an output tensor.
    #[error("non-finite value in {what}")]
    NonFinite { what: &'static str },

    /// A collaborator omitted a derivative tensor the requested order needs.
    #[error("missing derivative tensor {what} (order {order})")]
    MissingDerivative { what: &'static str, order: usize },
}

/// Default diagonal ridge added to `d2J/db db`, a few ulps above zero so a
/// Hessian that is singular to machine precision still factorizes
/// downstream.
pub const DEFAULT_HESSIAN_RIDGE: f64 = 100.0 * f64::EPSILON;

/// Numerical knobs of the evaluator.
#[derive(Debug, Clone)]
pub struct EvalSettings {
    /// Added to every diagonal entry of the assembled `d2J/db db`. Set to
    /// `0.0` for exact derivatives (finite-difference validation).
    pub hessian_ridge: f64,
}

impl Default for EvalSettings {
    fn default() -> Self {
        EvalSettings {
            hessian_ridge: DEFAULT_HESSIAN_RIDGE,
        }
    }
}

fn taken<T>(slot: Option<T>, what: &'static str, order: usize) -> Result<T, EvalError> {
    slot.ok_or(EvalError::MissingDerivative { what, order })
}

/// Gathers grid values onto slots: `out[i] = grid[ind[i]]`.
fn gather_values(
    grid: &Array1<f64>,
    ind: &[usize],
    what: &'static str,
) -> Result<Array1<f64>, EvalError> {
    let n_grid = grid.len();
    if let Some(&bad) = ind.iter().find(|&&j| j >= n_grid) {
        return Err(EvalError::ShapeMismatch {
            what,
            expected: format!("indices below {n_grid}"),
            got: format!("index {bad}"),
        });
    }
    Ok(Array1::from_iter(ind.iter().map(|&j| grid[j])))
}

/// Gathers a grid-resident sensitivity onto slots by row selection along
/// the leading axis of every tensor.
fn gather_sensitivity(
    s: &Sensitivity,
    ind: &[usize],
    what: &'static str,
) -> Result<Sensitivity, EvalError> {
    let n_grid = s.value.len();
    if let Some(&bad) = ind.iter().find(|&&j| j >= n_grid) {
        return Err(EvalError::ShapeMismatch {
            what,
            expected: format!("indices below {n_grid}"),
            got: format!("index {bad}"),
        });
    }
    Ok(Sensitivity {
        value: s.value.select(Axis(0), ind),
        d1: s.d1.as_ref().map(|t| t.select(Axis(0), ind)),
        d2: s.d2.as_ref().map(|t| t.select(Axis(0), ind)),
        d3: s.d3.as_ref().map(|t| t.select(Axis(0), ind)),
        d4: s.d4.as_ref().map(|t| t.select(Axis(0), ind)),
    })
}

fn ensure_finite<D: Dimension>(
    what: &'static str,
    t: Option<&Array<f64, D>>,
) -> Result<(), EvalError> {
    if let Some(t) = t
        && !t.iter().all(|v| v.is_finite())
    {
        return Err(EvalError::NonFinite { what });
    }
    Ok(())
}

/// Evaluates `J` and its total derivatives for one subject at one point.
///
/// The returned bundle has exactly the slots of `order` populated; see
/// [`SubjectDerivatives`] for the index conventions and the structural
/// zeros of the mixed `beta`-`delta` patterns. `d2J/db db` carries
/// `settings.hessian_ridge` on its diagonal.
pub fn evaluate_subject(
    model: &SubjectModel,
    data: &SubjectData,
    point: &Parameters,
    order: DerivOrder,
    settings: &EvalSettings,
) -> Result<SubjectDerivatives, EvalError> {
    let q = point.b.len();
    let p = point.beta.len();
    let r = point.delta.len();
    let k = order.rank();
    log::debug!(
        "evaluating subject {} at order {k} (q={q}, p={p}, r={r})",
        data.subject
    );

    // Stage 0: collaborators.
    let cov = model.covariance.resolve(point.delta.view(), order)?;
    if cov.d.dim() != (q, q) {
        return Err(EvalError::ShapeMismatch {
            what: "resolved covariance",
            expected: format!("({q}, {q})"),
            got: format!("{:?}", cov.d.dim()),
        });
    }
    let phi = model.map.map(point.beta.view(), point.b.view(), order)?;
    let m = phi.phi.len();
    let traj = model.simulator.simulate(phi.phi.view(), data, order)?;

    let n_y = data.ind_y.len();
    let n_t = data.ind_t.len();
    if traj.y.value.len() != n_y {
        return Err(EvalError::ShapeMismatch {
            what: "predicted measurements",
            expected: format!("{n_y} slots"),
            got: format!("{} slots", traj.y.value.len()),
        });
    }
    if traj.t.value.len() != n_t || traj.r.value.len() != n_t {
        return Err(EvalError::ShapeMismatch {
            what: "predicted events",
            expected: format!("({n_t}, {n_t}) slots"),
            got: format!("({}, {}) slots", traj.t.value.len(), traj.r.value.len()),
        });
    }

    // Stage 1: kernels on slots, each branch contracted to phi-tensors.
    let mut branch = PhiTensors::zeros(m, order);

    let sy = model.noise_scale.scales(phi.phi.view(), data, order)?;
    if sy.value.len() != data.ym.len() {
        return Err(EvalError::ShapeMismatch {
            what: "measurement scale grid",
            expected: format!("{}", data.ym.len()),
            got: format!("{}", sy.value.len()),
        });
    }
    let sy_slot = gather_sensitivity(&sy, &data.ind_y, "measurement slot map")?;
    let ym_slot = gather_values(&data.ym, &data.ind_y, "measurement slot map")?;
    let lp = noise_partials(
        model.noise_kind,
        traj.y.value.view(),
        ym_slot.view(),
        sy_slot.value.view(),
        order,
    )?;
    branch.accumulate(&chain::phi_totals(&lp, &[&traj.y, &sy_slot], m, order)?);

    let st = model.time_scale.scales(phi.phi.view(), data, order)?;
    if st.value.len() != data.tm.len() {
        return Err(EvalError::ShapeMismatch {
            what: "event scale grid",
            expected: format!("{}", data.tm.len()),
            got: format!("{}", st.value.len()),
        });
    }
    let st_slot = gather_sensitivity(&st, &data.ind_t, "event slot map")?;
    let tm_slot = gather_values(&data.tm, &data.ind_t, "event slot map")?;
    let ep = event_partials(
        model.time_kind,
        traj.t.value.view(),
        traj.r.value.view(),
        tm_slot.view(),
        st_slot.value.view(),
        order,
    )?;
    branch.accumulate(&chain::phi_totals(
        &ep,
        &[&traj.t, &traj.r, &st_slot],
        m,
        order,
    )?);

    // Stage 2: one outer composition for both observation branches, plus
    // the prior directly in outer space.
    let outer = chain::outer_totals(&branch, &phi, q, p, order)?;
    let prior = prior_partials(model.prior_kind, point.b.view(), &cov, order)?;

    let mut out = SubjectDerivatives::value_only(outer.value + prior.value);
    if !out.value.is_finite() {
        return Err(EvalError::NonFinite {
            what: "objective value",
        });
    }

    if k >= 1 {
        let mut db = taken(outer.db, "dJ/db", 1)?;
        db += &taken(prior.dJdb, "prior dJ/db", 1)?;
        out.dJdb = Some(db);
        out.dJdbeta = Some(taken(outer.dbeta, "dJ/dbeta", 1)?);
        out.dJddelta = Some(taken(prior.dJddelta, "dJ/ddelta", 1)?);
    }
    if k >= 2 {
        let mut dbb = taken(outer.dbb, "d2J/db2", 2)?;
        dbb += &taken(prior.ddJdbdb, "prior d2J/db2", 2)?;
        for j in 0..q {
            dbb[[j, j]] += settings.hessian_ridge;
        }
        out.ddJdbdb = Some(dbb);
        out.ddJdbdbeta = Some(taken(outer.dbbeta, "d2J/db dbeta", 2)?);
        out.ddJdbddelta = Some(taken(prior.ddJdbddelta, "d2J/db ddelta", 2)?);
        out.ddJdbetadbeta = Some(taken(outer.dbetabeta, "d2J/dbeta2", 2)?);
        out.ddJddeltaddelta = Some(taken(prior.ddJddeltaddelta, "d2J/ddelta2", 2)?);
        out.ddJdbetaddelta = Some(Array2::zeros((p, r)));
    }
    if k >= 3 {
        // The quadratic normal prior has no third b-derivative, so the
        // pure-b and b-beta patterns come from the branches alone.
        out.dddJdbdbdb = Some(taken(outer.dbbb, "d3J/db3", 3)?);
        out.dddJdbdbdbeta = Some(taken(outer.dbbbeta, "d3J/db2 dbeta", 3)?);
        out.dddJdbdbddelta = Some(taken(prior.dddJdbdbddelta, "d3J/db2 ddelta", 3)?);
        out.dddJdbdbetadbeta = Some(taken(outer.dbbetabeta, "d3J/db dbeta2", 3)?);
        out.dddJdbddeltaddelta = Some(taken(prior.dddJdbddeltaddelta, "d3J/db ddelta2", 3)?);
    }
    if k >= 4 {
        out.ddddJdbdbdbdb = Some(taken(outer.dbbbb, "d4J/db4", 4)?);
        out.ddddJdbdbdbdbeta = Some(taken(outer.dbbbbeta, "d4J/db3 dbeta", 4)?);
        out.ddddJdbdbdbddelta = Some(Array4::zeros((q, q, q, r)));
        out.ddddJdbdbdbetadbeta = Some(taken(outer.dbbbetabeta, "d4J/db2 dbeta2", 4)?);
        out.ddddJdbdbddeltaddelta =
            Some(taken(prior.ddddJdbdbddeltaddelta, "d4J/db2 ddelta2", 4)?);
    }

    ensure_finite("dJ/db", out.dJdb.as_ref())?;
    ensure_finite("dJ/dbeta", out.dJdbeta.as_ref())?;
    ensure_finite("dJ/ddelta", out.dJddelta.as_ref())?;
    ensure_finite("d2J/db2", out.ddJdbdb.as_ref())?;
    ensure_finite("d2J/db dbeta", out.ddJdbdbeta.as_ref())?;
    ensure_finite("d2J/db ddelta", out.ddJdbddelta.as_ref())?;
    ensure_finite("d2J/dbeta2", out.ddJdbetadbeta.as_ref())?;
    ensure_finite("d2J/ddelta2", out.ddJddeltaddelta.as_ref())?;
    ensure_finite("d3J/db3", out.dddJdbdbdb.as_ref())?;
    ensure_finite("d3J/db2 dbeta", out.dddJdbdbdbeta.as_ref())?;
    ensure_finite("d3J/db2 ddelta", out.dddJdbdbddelta.as_ref())?;
    ensure_finite("d3J/db dbeta2", out.dddJdbdbetadbeta.as_ref())?;
    ensure_finite("d3J/db ddelta2", out.dddJdbddeltaddelta.as_ref())?;
    ensure_finite("d4J/db4", out.ddddJdbdbdbdb.as_ref())?;
    ensure_finite("d4J/db3 dbeta", out.ddddJdbdbdbdbeta.as_ref())?;
    ensure_finite("d4J/db2 dbeta2", out.ddddJdbdbdbetadbeta.as_ref())?;
    ensure_finite("d4J/db2 ddelta2", out.ddddJdbdbddeltaddelta.as_ref())?;

    Ok(out)
}
