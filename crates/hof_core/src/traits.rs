use anyhow::Result;
use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A trait for types that can flow through user functions.
/// Implemented by `f64` (plain evaluation) and `Dual` (derivative evaluation),
/// so one generic implementation of a contract serves both.
pub trait Scalar: Float + FromPrimitive + Debug + Send + Sync + 'static {}

impl<T: Float + FromPrimitive + Debug + Send + Sync + 'static> Scalar for T {}

/// Data-only arguments bound into a user function.
///
/// Reals and integers are stored as plain numbers, so nothing inside a data
/// block can ever carry a sensitivity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataBlock {
    pub real: Vec<f64>,
    pub int: Vec<i64>,
}

impl DataBlock {
    pub fn new(real: Vec<f64>, int: Vec<i64>) -> Self {
        Self { real, int }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Root-finding contract: `residual(y, theta, data)` must return a vector of
/// the same length as `y`.
pub trait AlgebraicSystem: Sync {
    fn residual<T: Scalar>(&self, y: &[T], theta: &[T], data: &DataBlock) -> Result<Vec<T>>;
}

/// ODE right-hand side contract: returns `d(state)/dt` at time `t`.
pub trait OdeSystem: Sync {
    fn derivative<T: Scalar>(
        &self,
        t: f64,
        state: &[T],
        theta: &[T],
        data: &DataBlock,
    ) -> Result<Vec<T>>;
}

/// Integrand contract for `integrate_1d`.
///
/// `xc` is the distance to the nearest finite endpoint (`a - x` in the left
/// half of a finite interval, `b - x` in the right half) and NaN when either
/// endpoint is infinite.
pub trait Integrand: Sync {
    fn value<T: Scalar>(&self, x: f64, xc: f64, theta: &[T], data: &DataBlock) -> Result<T>;
}

/// Shard worker contract for `map_rect`.
/// `phi` is shared by every shard; `theta`, `x_r` and `x_i` are shard-local.
pub trait ShardWorker: Sync {
    fn apply<T: Scalar>(&self, phi: &[T], theta: &[T], x_r: &[f64], x_i: &[i64])
        -> Result<Vec<T>>;
}
