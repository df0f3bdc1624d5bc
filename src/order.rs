//! Derivative-order selection and the evaluated output bundle.
//!
//! The reference formulation of this computation selected the derivative
//! order implicitly, by how many return slots the caller asked for (1, 4,
//! 10, 15 or 20). Here that convention is replaced by an explicit
//! [`DerivOrder`] enum and a result struct with `Option`-typed slots, so a
//! request for order `k` computes exactly the orders `0..=k` and nothing
//! more.

use ndarray::{Array1, Array2, Array3, Array4};
use serde::{Deserialize, Serialize};

/// The highest total derivative order to compute in one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DerivOrder {
    /// Objective value only.
    Value,
    /// Value plus first derivatives w.r.t. `b`, `beta`, `delta`.
    First,
    /// Everything above plus the six second-derivative tensors.
    Second,
    /// Everything above plus the five third-derivative tensors.
    Third,
    /// Everything above plus the five fourth-derivative tensors.
    Fourth,
}

impl DerivOrder {
    /// Numeric rank of the order (0 for `Value` .. 4 for `Fourth`).
    pub fn rank(self) -> usize {
        match self {
            DerivOrder::Value => 0,
            DerivOrder::First => 1,
            DerivOrder::Second => 2,
            DerivOrder::Third => 3,
            DerivOrder::Fourth => 4,
        }
    }

    /// Number of output tensors populated at this order (value included).
    pub fn output_slots(self) -> usize {
        match self {
            DerivOrder::Value => 1,
            DerivOrder::First => 4,
            DerivOrder::Second => 10,
            DerivOrder::Third => 15,
            DerivOrder::Fourth => 20,
        }
    }

    /// Recovers the order from a requested output-slot count, mirroring the
    /// reference's variable-arity return convention. Counts between two
    /// tiers round up to the order able to fill every requested slot.
    pub fn from_requested_outputs(n_outputs: usize) -> Self {
        match n_outputs {
            0 | 1 => DerivOrder::Value,
            2..=4 => DerivOrder::First,
            5..=10 => DerivOrder::Second,
            11..=15 => DerivOrder::Third,
            _ => DerivOrder::Fourth,
        }
    }
}

/// The evaluated objective and every requested total derivative tensor.
///
/// Index convention: every tensor is indexed `[V1, V2, ...]` in the order
/// the differentiation variables appear in the field name, and is symmetric
/// under permutation of axes that belong to the same variable. Slots beyond
/// the requested [`DerivOrder`] are `None`.
///
/// Mixed derivatives containing both `beta` and `delta` are structural
/// zeros: `phi` depends on `(beta, b)` only, the prior on `(b, delta)`
/// only, so no term of `J` sees `beta` and `delta` together. The second
/// order `ddJdbetaddelta` slot is part of the output contract and is
/// returned as an explicit zero tensor; the third-order `b,beta,delta` and
/// fourth-order `b,b,beta,delta` cross terms vanish identically for the
/// same reason and have no slot.
#[derive(Debug, Clone)]
pub struct SubjectDerivatives {
    /// `J`, the subject's negative log-likelihood contribution.
    pub value: f64,

    // First order.
    pub dJdb: Option<Array1<f64>>,
    pub dJdbeta: Option<Array1<f64>>,
    pub dJddelta: Option<Array1<f64>>,

    // Second order. `ddJdbdb` carries the stability ridge on its diagonal
    // (see `EvalSettings::hessian_ridge`).
    pub ddJdbdb: Option<Array2<f64>>,
    pub ddJdbdbeta: Option<Array2<f64>>,
    pub ddJdbddelta: Option<Array2<f64>>,
    pub ddJdbetadbeta: Option<Array2<f64>>,
    pub ddJddeltaddelta: Option<Array2<f64>>,
    /// Structural zero, returned with shape `[p, r]`.
    pub ddJdbetaddelta: Option<Array2<f64>>,

    // Third order.
    pub dddJdbdbdb: Option<Array3<f64>>,
    pub dddJdbdbdbeta: Option<Array3<f64>>,
    pub dddJdbdbddelta: Option<Array3<f64>>,
    pub dddJdbdbetadbeta: Option<Array3<f64>>,
    pub dddJdbddeltaddelta: Option<Array3<f64>>,

    // Fourth order.
    pub ddddJdbdbdbdb: Option<Array4<f64>>,
    pub ddddJdbdbdbdbeta: Option<Array4<f64>>,
    pub ddddJdbdbdbddelta: Option<Array4<f64>>,
    pub ddddJdbdbdbetadbeta: Option<Array4<f64>>,
    pub ddddJdbdbddeltaddelta: Option<Array4<f64>>,
}

impl SubjectDerivatives {
    /// An output bundle with every derivative slot empty.
    pub fn value_only(value: f64) -> Self {
        SubjectDerivatives {
            value,
            dJdb: None,
            dJdbeta: None,
            dJddelta: None,
            ddJdbdb: None,
            ddJdbdbeta: None,
            ddJdbddelta: None,
            ddJdbetadbeta: None,
            ddJddeltaddelta: None,
            ddJdbetaddelta: None,
            dddJdbdbdb: None,
            dddJdbdbdbeta: None,
            dddJdbdbddelta: None,
            dddJdbdbetadbeta: None,
            dddJdbddeltaddelta: None,
            ddddJdbdbdbdb: None,
            ddddJdbdbdbdbeta: None,
            ddddJdbdbdbddelta: None,
            ddddJdbdbdbetadbeta: None,
            ddddJdbdbddeltaddelta: None,
        }
    }

    /// Number of populated output slots (value included).
    pub fn populated_slots(&self) -> usize {
        let opts = [
            self.dJdb.is_some(),
            self.dJdbeta.is_some(),
            self.dJddelta.is_some(),
            self.ddJdbdb.is_some(),
            self.ddJdbdbeta.is_some(),
            self.ddJdbddelta.is_some(),
            self.ddJdbetadbeta.is_some(),
            self.ddJddeltaddelta.is_some(),
            self.ddJdbetaddelta.is_some(),
            self.dddJdbdbdb.is_some(),
            self.dddJdbdbdbeta.is_some(),
            self.dddJdbdbddelta.is_some(),
            self.dddJdbdbetadbeta.is_some(),
            self.dddJdbddeltaddelta.is_some(),
            self.ddddJdbdbdbdb.is_some(),
            self.ddddJdbdbdbdbeta.is_some(),
            self.ddddJdbdbdbddelta.is_some(),
            self.ddddJdbdbdbetadbeta.is_some(),
            self.ddddJdbdbddeltaddelta.is_some(),
        ];
        1 + opts.iter().filter(|&&x| x).count()
    }
}
