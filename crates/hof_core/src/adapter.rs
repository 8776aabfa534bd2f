use nalgebra::{DMatrix, DVector};

use crate::autodiff::{seed, seed_unit, Dual};
use crate::error::{Error, Result};
use crate::traits::{AlgebraicSystem, DataBlock, Integrand, OdeSystem, Scalar, ShardWorker};

fn check_output<T: Scalar>(operation: &'static str, out: &[T], expected: usize) -> Result<()> {
    if out.len() != expected {
        return Err(Error::evaluation(
            operation,
            format!("returned {} values, expected {}", out.len(), expected),
        ));
    }
    if let Some(idx) = out.iter().position(|v| !v.is_finite()) {
        return Err(Error::evaluation(
            operation,
            format!("output[{idx}] is not finite ({:?})", out[idx]),
        ));
    }
    Ok(())
}

fn real_parts(out: &[Dual]) -> DVector<f64> {
    DVector::from_iterator(out.len(), out.iter().map(|d| d.val))
}

fn eps_parts(out: &[Dual]) -> DVector<f64> {
    DVector::from_iterator(out.len(), out.iter().map(|d| d.eps))
}

/// Builds a Jacobian column by column from directional dual passes.
fn jacobian_by_columns<F>(rows: usize, cols: usize, mut column: F) -> Result<DMatrix<f64>>
where
    F: FnMut(usize) -> Result<Vec<Dual>>,
{
    let mut jacobian = DMatrix::zeros(rows, cols);
    for j in 0..cols {
        let out = column(j)?;
        for i in 0..rows {
            jacobian[(i, j)] = out[i].eps;
        }
    }
    Ok(jacobian)
}

/// Like `jacobian_by_columns`, also keeping the real parts of the first pass,
/// which equal a plain evaluation. `None` when there are no columns.
fn value_and_jacobian<F>(
    rows: usize,
    cols: usize,
    mut column: F,
) -> Result<(Option<DVector<f64>>, DMatrix<f64>)>
where
    F: FnMut(usize) -> Result<Vec<Dual>>,
{
    let mut value = None;
    let jacobian = jacobian_by_columns(rows, cols, |j| {
        let out = column(j)?;
        if value.is_none() {
            value = Some(real_parts(&out));
        }
        Ok(out)
    })?;
    Ok((value, jacobian))
}

/// Adapter for an algebraic system `g(y; theta, data)`.
///
/// Each adapter binds a user function to its parameters and data block.
/// Derivatives come from evaluating the same generic function with `Dual`
/// inputs, one column or one direction per pass, and every output is checked
/// for length and finiteness before a solver sees it.
pub struct RootAdapter<'a, S> {
    system: &'a S,
    theta: &'a [f64],
    data: &'a DataBlock,
    dim: usize,
}

impl<'a, S: AlgebraicSystem> RootAdapter<'a, S> {
    const OPERATION: &'static str = "solve_algebraic";

    pub fn new(system: &'a S, theta: &'a [f64], data: &'a DataBlock, dim: usize) -> Self {
        Self {
            system,
            theta,
            data,
            dim,
        }
    }

    fn call<T: Scalar>(&self, y: &[T], theta: &[T]) -> Result<Vec<T>> {
        let out = self
            .system
            .residual(y, theta, self.data)
            .map_err(|e| Error::user(Self::OPERATION, e))?;
        check_output(Self::OPERATION, &out, self.dim)?;
        Ok(out)
    }

    pub fn evaluate(&self, y: &[f64]) -> Result<DVector<f64>> {
        Ok(DVector::from_vec(self.call(y, self.theta)?))
    }

    /// First evaluation of a solve: a residual of the wrong length is a
    /// dimension mismatch rather than an evaluation failure.
    pub fn probe(&self, y: &[f64]) -> Result<DVector<f64>> {
        let out = self
            .system
            .residual(y, self.theta, self.data)
            .map_err(|e| Error::user(Self::OPERATION, e))?;
        if out.len() != self.dim {
            return Err(Error::dimension(Self::OPERATION, "residual", self.dim, out.len()));
        }
        check_output(Self::OPERATION, &out, self.dim)?;
        Ok(DVector::from_vec(out))
    }

    /// Residual and `dg/dy` at `y` from the same `len(y)` dual passes.
    pub fn evaluate_with_jacobian(&self, y: &[f64]) -> Result<(DVector<f64>, DMatrix<f64>)> {
        let theta = seed_unit(self.theta, usize::MAX);
        let (value, jacobian) = value_and_jacobian(self.dim, self.dim, |j| {
            self.call(&seed_unit(y, j), &theta)
        })?;
        let value = match value {
            Some(value) => value,
            None => self.evaluate(y)?,
        };
        Ok((value, jacobian))
    }

    /// `dg/dy` at `y`.
    pub fn jacobian(&self, y: &[f64]) -> Result<DMatrix<f64>> {
        let theta = seed_unit(self.theta, usize::MAX);
        jacobian_by_columns(self.dim, self.dim, |j| {
            self.call(&seed_unit(y, j), &theta)
        })
    }

    /// `dg/dtheta` at `y`.
    pub fn theta_jacobian(&self, y: &[f64]) -> Result<DMatrix<f64>> {
        let y_dual = seed_unit(y, usize::MAX);
        jacobian_by_columns(self.dim, self.theta.len(), |j| {
            self.call(&y_dual, &seed_unit(self.theta, j))
        })
    }

    /// `(dg/dtheta) theta_dot` in a single dual pass.
    pub fn theta_directional(&self, y: &[f64], theta_dot: &[f64]) -> Result<DVector<f64>> {
        let out = self.call(&seed_unit(y, usize::MAX), &seed(self.theta, theta_dot))?;
        Ok(eps_parts(&out))
    }
}

/// Adapter for an ODE right-hand side `f(t, y; theta, data)`.
pub struct OdeAdapter<'a, S> {
    system: &'a S,
    theta: &'a [f64],
    data: &'a DataBlock,
    dim: usize,
    operation: &'static str,
}

impl<'a, S: OdeSystem> OdeAdapter<'a, S> {
    pub fn new(
        system: &'a S,
        theta: &'a [f64],
        data: &'a DataBlock,
        dim: usize,
        operation: &'static str,
    ) -> Self {
        Self {
            system,
            theta,
            data,
            dim,
            operation,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn num_params(&self) -> usize {
        self.theta.len()
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    fn call<T: Scalar>(&self, t: f64, y: &[T], theta: &[T]) -> Result<Vec<T>> {
        let out = self
            .system
            .derivative(t, y, theta, self.data)
            .map_err(|e| Error::user(self.operation, e))?;
        check_output(self.operation, &out, self.dim)?;
        Ok(out)
    }

    pub fn evaluate(&self, t: f64, y: &[f64]) -> Result<DVector<f64>> {
        Ok(DVector::from_vec(self.call(t, y, self.theta)?))
    }

    /// First evaluation of an integration; see `RootAdapter::probe`.
    pub fn probe(&self, t: f64, y: &[f64]) -> Result<DVector<f64>> {
        let out = self
            .system
            .derivative(t, y, self.theta, self.data)
            .map_err(|e| Error::user(self.operation, e))?;
        if out.len() != self.dim {
            return Err(Error::dimension(self.operation, "derivative", self.dim, out.len()));
        }
        check_output(self.operation, &out, self.dim)?;
        Ok(DVector::from_vec(out))
    }

    /// Derivative and `df/dy` at `(t, y)`.
    pub fn evaluate_with_jacobian(
        &self,
        t: f64,
        y: &[f64],
    ) -> Result<(DVector<f64>, DMatrix<f64>)> {
        let theta = seed_unit(self.theta, usize::MAX);
        let (value, jacobian) = value_and_jacobian(self.dim, self.dim, |j| {
            self.call(t, &seed_unit(y, j), &theta)
        })?;
        let value = match value {
            Some(value) => value,
            None => self.evaluate(t, y)?,
        };
        Ok((value, jacobian))
    }

    pub fn state_jacobian(&self, t: f64, y: &[f64]) -> Result<DMatrix<f64>> {
        let theta = seed_unit(self.theta, usize::MAX);
        jacobian_by_columns(self.dim, self.dim, |j| {
            self.call(t, &seed_unit(y, j), &theta)
        })
    }

    /// `f(t, y)` together with `(df/dy) y_dot + (df/dtheta) theta_dot`.
    pub fn directional(
        &self,
        t: f64,
        y: &[f64],
        y_dot: &[f64],
        theta_dot: &[f64],
    ) -> Result<(DVector<f64>, DVector<f64>)> {
        let out = self.call(t, &seed(y, y_dot), &seed(self.theta, theta_dot))?;
        Ok((real_parts(&out), eps_parts(&out)))
    }
}

/// Adapter for an integrand `f(x, xc; theta, data)`.
pub struct IntegrandAdapter<'a, F> {
    integrand: &'a F,
    theta: &'a [f64],
    data: &'a DataBlock,
}

impl<'a, F: Integrand> IntegrandAdapter<'a, F> {
    const OPERATION: &'static str = "integrate_1d";

    pub fn new(integrand: &'a F, theta: &'a [f64], data: &'a DataBlock) -> Self {
        Self {
            integrand,
            theta,
            data,
        }
    }

    fn call<T: Scalar>(&self, x: f64, xc: f64, theta: &[T]) -> Result<T> {
        let out = self
            .integrand
            .value(x, xc, theta, self.data)
            .map_err(|e| Error::user(Self::OPERATION, e))?;
        check_output(Self::OPERATION, &[out], 1)?;
        Ok(out)
    }

    pub fn evaluate(&self, x: f64, xc: f64) -> Result<f64> {
        self.call(x, xc, self.theta)
    }

    /// `(df/dtheta) theta_dot` at one node.
    pub fn directional(&self, x: f64, xc: f64, theta_dot: &[f64]) -> Result<f64> {
        Ok(self.call(x, xc, &seed(self.theta, theta_dot))?.eps)
    }

    /// `df/dtheta_index` at one node.
    pub fn partial(&self, x: f64, xc: f64, index: usize) -> Result<f64> {
        Ok(self.call(x, xc, &seed_unit(self.theta, index))?.eps)
    }

    pub fn num_params(&self) -> usize {
        self.theta.len()
    }
}

/// Adapter for one shard of a `map_rect` call.
pub struct ShardAdapter<'a, W> {
    worker: &'a W,
    phi: &'a [f64],
    theta: &'a [f64],
    x_r: &'a [f64],
    x_i: &'a [i64],
}

impl<'a, W: ShardWorker> ShardAdapter<'a, W> {
    const OPERATION: &'static str = "map_rect";

    pub fn new(
        worker: &'a W,
        phi: &'a [f64],
        theta: &'a [f64],
        x_r: &'a [f64],
        x_i: &'a [i64],
    ) -> Self {
        Self {
            worker,
            phi,
            theta,
            x_r,
            x_i,
        }
    }

    fn call<T: Scalar>(&self, phi: &[T], theta: &[T], expected: Option<usize>) -> Result<Vec<T>> {
        let out = self
            .worker
            .apply(phi, theta, self.x_r, self.x_i)
            .map_err(|e| Error::user(Self::OPERATION, e))?;
        check_output(Self::OPERATION, &out, expected.unwrap_or(out.len()))?;
        Ok(out)
    }

    pub fn evaluate(&self) -> Result<Vec<f64>> {
        self.call(self.phi, self.theta, None)
    }

    /// Outputs and their tangent along `(phi_dot, theta_dot)`, one dual pass.
    pub fn directional(&self, phi_dot: &[f64], theta_dot: &[f64]) -> Result<(Vec<f64>, Vec<f64>)> {
        let out = self.call(&seed(self.phi, phi_dot), &seed(self.theta, theta_dot), None)?;
        Ok((
            out.iter().map(|d| d.val).collect(),
            out.iter().map(|d| d.eps).collect(),
        ))
    }

    /// Outputs with the Jacobians with respect to `phi` and the shard's `theta`.
    pub fn evaluate_with_jacobian(&self) -> Result<(Vec<f64>, DMatrix<f64>, DMatrix<f64>)> {
        let value = self.evaluate()?;
        let rows = value.len();
        let phi_const = seed_unit(self.phi, usize::MAX);
        let theta_const = seed_unit(self.theta, usize::MAX);
        let phi_jacobian = jacobian_by_columns(rows, self.phi.len(), |j| {
            self.call(&seed_unit(self.phi, j), &theta_const, Some(rows))
        })?;
        let theta_jacobian = jacobian_by_columns(rows, self.theta.len(), |j| {
            self.call(&phi_const, &seed_unit(self.theta, j), Some(rows))
        })?;
        Ok((value, phi_jacobian, theta_jacobian))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use approx::assert_relative_eq;

    struct Circle;

    impl AlgebraicSystem for Circle {
        fn residual<T: Scalar>(&self, y: &[T], theta: &[T], _data: &DataBlock) -> anyhow::Result<Vec<T>> {
            Ok(vec![y[0] * y[0] + y[1] * y[1] - theta[0], y[0] - y[1] * theta[1]])
        }
    }

    struct WrongLength;

    impl AlgebraicSystem for WrongLength {
        fn residual<T: Scalar>(&self, y: &[T], _theta: &[T], _data: &DataBlock) -> anyhow::Result<Vec<T>> {
            Ok(vec![y[0]])
        }
    }

    struct Failing;

    impl AlgebraicSystem for Failing {
        fn residual<T: Scalar>(&self, _y: &[T], _theta: &[T], _data: &DataBlock) -> anyhow::Result<Vec<T>> {
            bail!("log of negative number")
        }
    }

    #[test]
    fn root_adapter_jacobians_are_exact() {
        let data = DataBlock::empty();
        let theta = [4.0, 2.0];
        let adapter = RootAdapter::new(&Circle, &theta, &data, 2);
        let (value, jac) = adapter.evaluate_with_jacobian(&[1.0, 3.0]).unwrap();
        assert_relative_eq!(value[0], 6.0);
        assert_relative_eq!(value[1], -5.0);
        assert_relative_eq!(jac[(0, 0)], 2.0);
        assert_relative_eq!(jac[(0, 1)], 6.0);
        assert_relative_eq!(jac[(1, 0)], 1.0);
        assert_relative_eq!(jac[(1, 1)], -2.0);

        let jt = adapter.theta_jacobian(&[1.0, 3.0]).unwrap();
        assert_relative_eq!(jt[(0, 0)], -1.0);
        assert_relative_eq!(jt[(1, 1)], -3.0);

        let dir = adapter.theta_directional(&[1.0, 3.0], &[1.0, 1.0]).unwrap();
        assert_relative_eq!(dir[0], -1.0);
        assert_relative_eq!(dir[1], -3.0);
    }

    #[test]
    fn wrong_length_is_an_evaluation_error() {
        let data = DataBlock::empty();
        let adapter = RootAdapter::new(&WrongLength, &[], &data, 2);
        let err = adapter.evaluate(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, Error::Evaluation { .. }));
        assert!(format!("{err}").contains("returned 1 values, expected 2"));
    }

    #[test]
    fn user_errors_are_carried_as_source() {
        let data = DataBlock::empty();
        let adapter = RootAdapter::new(&Failing, &[], &data, 1);
        match adapter.evaluate(&[1.0]) {
            Err(Error::Evaluation { source: Some(source), .. }) => {
                assert_eq!(format!("{source}"), "log of negative number");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    struct Scaled;

    impl Integrand for Scaled {
        fn value<T: Scalar>(&self, x: f64, _xc: f64, theta: &[T], _data: &DataBlock) -> anyhow::Result<T> {
            Ok(theta[0] * T::from_f64(x).unwrap() + theta[1])
        }
    }

    #[test]
    fn integrand_rejects_non_finite_values() {
        let data = DataBlock::empty();
        let theta = [f64::INFINITY, 0.0];
        let adapter = IntegrandAdapter::new(&Scaled, &theta, &data);
        assert!(matches!(
            adapter.evaluate(1.0, 0.0),
            Err(Error::Evaluation { .. })
        ));
    }

    /// Logistic growth `y' = r y (1 - y / K)` with `theta = [r, K]`.
    struct Logistic;

    impl OdeSystem for Logistic {
        fn derivative<T: Scalar>(
            &self,
            _t: f64,
            state: &[T],
            theta: &[T],
            _data: &DataBlock,
        ) -> anyhow::Result<Vec<T>> {
            Ok(vec![theta[0] * state[0] * (T::one() - state[0] / theta[1])])
        }
    }

    #[test]
    fn ode_adapter_state_jacobian_and_directional() {
        let data = DataBlock::empty();
        let theta = [0.5, 10.0];
        let adapter = OdeAdapter::new(&Logistic, &theta, &data, 1, "test");
        let (value, jac) = adapter.evaluate_with_jacobian(0.0, &[2.0]).unwrap();
        assert_relative_eq!(value[0], 0.8);
        // r (1 - 2 y / K)
        assert_relative_eq!(jac[(0, 0)], 0.3);

        // y_dot = 1 and r_dot = 1: 0.3 + y (1 - y / K) = 0.3 + 1.6.
        let (_, ds) = adapter.directional(0.0, &[2.0], &[1.0], &[1.0, 0.0]).unwrap();
        assert_relative_eq!(ds[0], 1.9, epsilon = 1e-12);
    }

    #[test]
    fn probe_reports_wrong_derivative_length_as_dimension_mismatch() {
        let data = DataBlock::empty();
        let theta = [0.5, 10.0];
        let adapter = OdeAdapter::new(&Logistic, &theta, &data, 2, "test");
        assert!(matches!(
            adapter.probe(0.0, &[2.0, 1.0]),
            Err(Error::DimensionMismatch {
                expected: 2,
                found: 1,
                ..
            })
        ));
    }
}
