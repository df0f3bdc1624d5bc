//! Structural properties of the evaluated output: consistency across
//! requested orders, symmetry of repeated axes, structural zeros of the
//! beta-delta cross patterns, additivity of the three branches and the
//! Hessian ridge.

mod harness;

use approx::assert_relative_eq;
use harness::{Harness, base_point};
use mixedlik::fixtures::Monomials;
use mixedlik::{DerivOrder, EvalSettings, NoiseKind, Parameters, evaluate_subject};
use ndarray::{Array1, Array2};

/// A monomial vector with zero slots (for disabling one branch).
fn no_slots() -> Monomials {
    Monomials {
        offset: Array1::zeros(0),
        coeff: Array1::zeros(0),
        expo: Array2::zeros((0, 2)),
    }
}

/// Lower-order slots must not change when a higher order is requested:
/// every tier is computed once, not re-derived per order.
#[test]
fn lower_orders_are_identical_across_requested_orders() {
    let hx = Harness::new();
    let point = base_point();

    let first = hx.eval(NoiseKind::Normal, &point, DerivOrder::First);
    let second = hx.eval(NoiseKind::Normal, &point, DerivOrder::Second);
    let fourth = hx.eval(NoiseKind::Normal, &point, DerivOrder::Fourth);

    assert_relative_eq!(first.value, fourth.value, max_relative = 1e-14);
    for i in 0..2 {
        assert_relative_eq!(
            first.dJdb.as_ref().unwrap()[i],
            fourth.dJdb.as_ref().unwrap()[i],
            max_relative = 1e-14
        );
        assert_relative_eq!(
            first.dJddelta.as_ref().unwrap()[i],
            fourth.dJddelta.as_ref().unwrap()[i],
            max_relative = 1e-14
        );
        for j in 0..2 {
            assert_relative_eq!(
                second.ddJdbdb.as_ref().unwrap()[[i, j]],
                fourth.ddJdbdb.as_ref().unwrap()[[i, j]],
                max_relative = 1e-14
            );
            assert_relative_eq!(
                second.ddJdbdbeta.as_ref().unwrap()[[i, j]],
                fourth.ddJdbdbeta.as_ref().unwrap()[[i, j]],
                max_relative = 1e-14
            );
        }
    }
}

#[test]
fn repeated_axes_are_symmetric() {
    let hx = Harness::new();
    let out = hx.eval(NoiseKind::Normal, &base_point(), DerivOrder::Fourth);

    let dbb = out.ddJdbdb.as_ref().unwrap();
    let dbbb = out.dddJdbdbdb.as_ref().unwrap();
    let dbbbb = out.ddddJdbdbdbdb.as_ref().unwrap();
    let dbbetabeta = out.dddJdbdbetadbeta.as_ref().unwrap();
    let dbbdd = out.ddddJdbdbddeltaddelta.as_ref().unwrap();

    for i in 0..2 {
        for j in 0..2 {
            assert_relative_eq!(dbb[[i, j]], dbb[[j, i]], max_relative = 1e-12);
            for k in 0..2 {
                assert_relative_eq!(dbbb[[i, j, k]], dbbb[[j, i, k]], max_relative = 1e-12);
                assert_relative_eq!(dbbb[[i, j, k]], dbbb[[i, k, j]], max_relative = 1e-12);
                assert_relative_eq!(
                    dbbetabeta[[i, j, k]],
                    dbbetabeta[[i, k, j]],
                    max_relative = 1e-12
                );
                for l in 0..2 {
                    assert_relative_eq!(
                        dbbbb[[i, j, k, l]],
                        dbbbb[[j, i, l, k]],
                        max_relative = 1e-12
                    );
                    assert_relative_eq!(
                        dbbbb[[i, j, k, l]],
                        dbbbb[[l, k, j, i]],
                        max_relative = 1e-12
                    );
                    assert_relative_eq!(
                        dbbdd[[i, j, k, l]],
                        dbbdd[[j, i, l, k]],
                        max_relative = 1e-12
                    );
                }
            }
        }
    }
}

#[test]
fn beta_delta_cross_patterns_are_zero() {
    let hx = Harness::new();
    let out = hx.eval(NoiseKind::Normal, &base_point(), DerivOrder::Fourth);
    assert_eq!(out.ddJdbetaddelta.as_ref().unwrap().sum(), 0.0);
    assert_eq!(out.ddddJdbdbdbddelta.as_ref().unwrap().sum(), 0.0);
}

/// With the measurement slots removed, `J` drops by exactly the noise
/// branch; with the event slots removed, by exactly the event branch; with
/// both removed only the prior remains. The three branch values therefore
/// satisfy `J_full = J_noise_only + J_event_only - J_prior_only`.
#[test]
fn branch_values_are_additive() {
    let point = base_point();
    let settings = EvalSettings::default();

    let value = |strip_y: bool, strip_t: bool| {
        let mut hx = Harness::new();
        if strip_y {
            hx.traj.y = no_slots();
            hx.data.ind_y = vec![];
        }
        if strip_t {
            hx.traj.t = no_slots();
            hx.traj.r = no_slots();
            hx.data.ind_t = vec![];
        }
        evaluate_subject(
            &hx.model(NoiseKind::Normal),
            &hx.data,
            &point,
            DerivOrder::Value,
            &settings,
        )
        .unwrap()
        .value
    };

    let full = value(false, false);
    let noise_only = value(false, true);
    let event_only = value(true, false);
    let prior_only = value(true, true);

    assert_relative_eq!(
        full,
        noise_only + event_only - prior_only,
        max_relative = 1e-12
    );
    // The prior term at b is the closed-form Gaussian negative log-density.
    let q = 2.0;
    let var: Array1<f64> = point.delta.mapv(|d| (2.0 * d).exp());
    let expect = 0.5 * (point.b.mapv(|x| x * x) / &var).sum()
        + 0.5 * var.mapv(f64::ln).sum()
        + 0.5 * q * (2.0 * std::f64::consts::PI).ln();
    assert_relative_eq!(prior_only, expect, max_relative = 1e-12);
}

#[test]
fn hessian_ridge_shifts_the_diagonal_only() {
    let hx = Harness::new();
    let point = base_point();
    let model = hx.model(NoiseKind::Normal);

    let bare = evaluate_subject(
        &model,
        &hx.data,
        &point,
        DerivOrder::Second,
        &EvalSettings { hessian_ridge: 0.0 },
    )
    .unwrap();
    let ridged = evaluate_subject(
        &model,
        &hx.data,
        &point,
        DerivOrder::Second,
        &EvalSettings { hessian_ridge: 1.0 },
    )
    .unwrap();

    let a = bare.ddJdbdb.as_ref().unwrap();
    let b = ridged.ddJdbdb.as_ref().unwrap();
    for i in 0..2 {
        for j in 0..2 {
            let expect = a[[i, j]] + if i == j { 1.0 } else { 0.0 };
            assert_relative_eq!(b[[i, j]], expect, max_relative = 1e-14);
        }
    }
    // No other slot is touched by the ridge.
    assert_relative_eq!(bare.value, ridged.value, max_relative = 1e-14);
    for i in 0..2 {
        for j in 0..2 {
            assert_relative_eq!(
                bare.ddJdbdbeta.as_ref().unwrap()[[i, j]],
                ridged.ddJdbdbeta.as_ref().unwrap()[[i, j]],
                max_relative = 1e-14
            );
        }
    }
}

/// An empty subject still evaluates: only the prior contributes and the
/// observation tensors are zero.
#[test]
fn subject_without_observations_reduces_to_the_prior() {
    let mut hx = Harness::new();
    hx.traj.y = no_slots();
    hx.traj.t = no_slots();
    hx.traj.r = no_slots();
    hx.data.ind_y = vec![];
    hx.data.ind_t = vec![];
    let point = base_point();
    let out = evaluate_subject(
        &hx.model(NoiseKind::Normal),
        &hx.data,
        &point,
        DerivOrder::Second,
        &EvalSettings { hessian_ridge: 0.0 },
    )
    .unwrap();

    // beta enters only through the observation branches.
    assert_eq!(out.dJdbeta.as_ref().unwrap().sum(), 0.0);
    assert_eq!(out.ddJdbetadbeta.as_ref().unwrap().sum(), 0.0);
    // The b-Hessian is exactly inv(D).
    let var: Array1<f64> = point.delta.mapv(|d| (2.0 * d).exp());
    for i in 0..2 {
        assert_relative_eq!(
            out.ddJdbdb.as_ref().unwrap()[[i, i]],
            1.0 / var[i],
            max_relative = 1e-12
        );
    }
}

/// `Parameters` is the unit other tooling serializes; an evaluation at a
/// deserialized point must match the original bitwise.
#[test]
fn evaluation_survives_a_parameter_round_trip() {
    let hx = Harness::new();
    let point = base_point();
    let json = serde_json::to_string(&point).unwrap();
    let back: Parameters = serde_json::from_str(&json).unwrap();

    let a = hx.eval(NoiseKind::Normal, &point, DerivOrder::First);
    let b = hx.eval(NoiseKind::Normal, &back, DerivOrder::First);
    assert_eq!(a.value, b.value);
    assert_eq!(a.dJdb.as_ref().unwrap(), b.dJdb.as_ref().unwrap());
}
