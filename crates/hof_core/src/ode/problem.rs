use nalgebra::{DMatrix, DVector};

use crate::adapter::OdeAdapter;
use crate::error::Result;
use crate::traits::OdeSystem;

/// Right-hand side seen by the steppers, either the user system as is or
/// augmented with forward sensitivity columns.
pub(crate) trait OdeProblem {
    fn dimension(&self) -> usize;
    fn operation(&self) -> &'static str;
    fn rhs(&self, t: f64, y: &DVector<f64>) -> Result<DVector<f64>>;
    fn jacobian(&self, t: f64, y: &DVector<f64>) -> Result<DMatrix<f64>>;

    fn rhs_with_jacobian(
        &self,
        t: f64,
        y: &DVector<f64>,
    ) -> Result<(DVector<f64>, DMatrix<f64>)> {
        Ok((self.rhs(t, y)?, self.jacobian(t, y)?))
    }
}

pub(crate) struct PlainProblem<'a, S> {
    adapter: OdeAdapter<'a, S>,
}

impl<'a, S: OdeSystem> PlainProblem<'a, S> {
    pub fn new(adapter: OdeAdapter<'a, S>) -> Self {
        Self { adapter }
    }
}

impl<S: OdeSystem> OdeProblem for PlainProblem<'_, S> {
    fn dimension(&self) -> usize {
        self.adapter.dimension()
    }

    fn operation(&self) -> &'static str {
        self.adapter.operation()
    }

    fn rhs(&self, t: f64, y: &DVector<f64>) -> Result<DVector<f64>> {
        self.adapter.evaluate(t, y.as_slice())
    }

    fn jacobian(&self, t: f64, y: &DVector<f64>) -> Result<DMatrix<f64>> {
        self.adapter.state_jacobian(t, y.as_slice())
    }

    fn rhs_with_jacobian(
        &self,
        t: f64,
        y: &DVector<f64>,
    ) -> Result<(DVector<f64>, DMatrix<f64>)> {
        self.adapter.evaluate_with_jacobian(t, y.as_slice())
    }
}

/// State layout: `[y, S_0, S_1, ..., S_{k-1}]` where `S_c` is the `c`-th
/// sensitivity column (length `n`).
pub(crate) struct SensitivityProblem<'a, S> {
    adapter: OdeAdapter<'a, S>,
    /// `p x k` seed matrix multiplying `df/dtheta`.
    theta_seeds: DMatrix<f64>,
}

impl<'a, S: OdeSystem> SensitivityProblem<'a, S> {
    pub fn new(adapter: OdeAdapter<'a, S>, theta_seeds: DMatrix<f64>) -> Self {
        debug_assert_eq!(theta_seeds.nrows(), adapter.num_params());
        Self {
            adapter,
            theta_seeds,
        }
    }

    pub fn columns(&self) -> usize {
        self.theta_seeds.ncols()
    }

    /// Builds the augmented initial state from `y0` and the `n x k` initial
    /// sensitivities.
    pub fn initial_state(&self, y0: &[f64], s0: &DMatrix<f64>) -> DVector<f64> {
        let n = y0.len();
        let k = self.columns();
        let mut state = DVector::zeros(n * (k + 1));
        state.rows_mut(0, n).copy_from_slice(y0);
        for c in 0..k {
            state.rows_mut(n * (c + 1), n).copy_from(&s0.column(c));
        }
        state
    }

    /// Splits an augmented state into `y` and its `n x k` sensitivity matrix.
    pub fn split(&self, state: &DVector<f64>) -> (Vec<f64>, DMatrix<f64>) {
        let n = self.adapter.dimension();
        let k = self.columns();
        let y = state.rows(0, n).iter().copied().collect();
        let sens = DMatrix::from_column_slice(n, k, &state.as_slice()[n..n * (k + 1)]);
        (y, sens)
    }
}

impl<S: OdeSystem> OdeProblem for SensitivityProblem<'_, S> {
    fn dimension(&self) -> usize {
        self.adapter.dimension() * (self.columns() + 1)
    }

    fn operation(&self) -> &'static str {
        self.adapter.operation()
    }

    fn rhs(&self, t: f64, state: &DVector<f64>) -> Result<DVector<f64>> {
        let n = self.adapter.dimension();
        let k = self.columns();
        let y = &state.as_slice()[..n];
        let mut out = DVector::zeros(n * (k + 1));

        if k == 0 {
            out.rows_mut(0, n).copy_from(&self.adapter.evaluate(t, y)?);
            return Ok(out);
        }

        // (J_y S + J_theta Theta) column c is the directional derivative of f
        // along (S_c, Theta_c): one dual evaluation per column.
        for c in 0..k {
            let s_c = &state.as_slice()[n * (c + 1)..n * (c + 2)];
            let theta_c: Vec<f64> = self.theta_seeds.column(c).iter().copied().collect();
            let (f, ds) = self.adapter.directional(t, y, s_c, &theta_c)?;
            if c == 0 {
                out.rows_mut(0, n).copy_from(&f);
            }
            out.rows_mut(n * (c + 1), n).copy_from(&ds);
        }
        Ok(out)
    }

    /// Block diagonal in `df/dy`: the coupling of the sensitivity columns to
    /// the state is left out of the Newton matrix.
    fn jacobian(&self, t: f64, state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let n = self.adapter.dimension();
        let blocks = self.columns() + 1;
        let j_y = self.adapter.state_jacobian(t, &state.as_slice()[..n])?;
        let mut jacobian = DMatrix::zeros(n * blocks, n * blocks);
        for b in 0..blocks {
            jacobian.view_mut((b * n, b * n), (n, n)).copy_from(&j_y);
        }
        Ok(jacobian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{DataBlock, Scalar};
    use approx::assert_relative_eq;

    /// dy0/dt = -theta0 * y0, dy1/dt = y0 * y1.
    struct Coupled;

    impl OdeSystem for Coupled {
        fn derivative<T: Scalar>(
            &self,
            _t: f64,
            y: &[T],
            theta: &[T],
            _data: &DataBlock,
        ) -> anyhow::Result<Vec<T>> {
            Ok(vec![-theta[0] * y[0], y[0] * y[1]])
        }
    }

    #[test]
    fn sensitivity_rhs_matches_variational_equation() {
        let data = DataBlock::empty();
        let theta = [0.5];
        let adapter = OdeAdapter::new(&Coupled, &theta, &data, 2, "test");
        let seeds = DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        let problem = SensitivityProblem::new(adapter, seeds);
        let s0 = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 2.0]);
        let state = problem.initial_state(&[2.0, 3.0], &s0);
        assert_eq!(problem.dimension(), 6);

        let out = problem.rhs(0.0, &state).unwrap();
        // f
        assert_relative_eq!(out[0], -1.0);
        assert_relative_eq!(out[1], 6.0);
        // column 0: J_y [0, 0] + J_theta * 1 = [-y0, 0]
        assert_relative_eq!(out[2], -2.0);
        assert_relative_eq!(out[3], 0.0);
        // column 1: J_y [1, 2] = [-theta0, y1 + 2 y0]
        assert_relative_eq!(out[4], -0.5);
        assert_relative_eq!(out[5], 3.0 + 4.0);

        let (y, sens) = problem.split(&state);
        assert_eq!(y, vec![2.0, 3.0]);
        assert_eq!(sens, s0);
    }

    #[test]
    fn sensitivity_jacobian_is_block_diagonal() {
        let data = DataBlock::empty();
        let theta = [0.5];
        let adapter = OdeAdapter::new(&Coupled, &theta, &data, 2, "test");
        let problem = SensitivityProblem::new(adapter, DMatrix::zeros(1, 1));
        let state = problem.initial_state(&[2.0, 3.0], &DMatrix::zeros(2, 1));
        let jac = problem.jacobian(0.0, &state).unwrap();
        assert_eq!(jac.shape(), (4, 4));
        assert_relative_eq!(jac[(0, 0)], -0.5);
        assert_relative_eq!(jac[(1, 0)], 3.0);
        assert_relative_eq!(jac[(3, 2)], 3.0);
        assert_relative_eq!(jac[(1, 1)], 2.0);
        assert_eq!(jac[(2, 0)], 0.0);
    }
}
