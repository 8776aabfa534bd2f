use log::{trace, warn};
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};

use super::problem::OdeProblem;
use super::{initial_step, rms_norm, AdaptiveStepper, OdeStats};
use crate::error::Result;
use crate::settings::OdeSettings;

const MAX_ORDER: usize = 5;
const NEWTON_MAXITER: usize = 4;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
const KAPPA: [f64; MAX_ORDER + 1] = [0.0, -0.1850, -1.0 / 9.0, -0.0823, -0.0415, 0.0];

struct Coefficients {
    gamma: [f64; MAX_ORDER + 1],
    alpha: [f64; MAX_ORDER + 1],
    error_const: [f64; MAX_ORDER + 1],
}

impl Coefficients {
    fn new() -> Self {
        let mut gamma = [0.0; MAX_ORDER + 1];
        for k in 1..=MAX_ORDER {
            gamma[k] = gamma[k - 1] + 1.0 / k as f64;
        }
        let mut alpha = [0.0; MAX_ORDER + 1];
        let mut error_const = [0.0; MAX_ORDER + 1];
        for k in 0..=MAX_ORDER {
            alpha[k] = (1.0 - KAPPA[k]) * gamma[k];
            error_const[k] = KAPPA[k] * gamma[k] + 1.0 / (k + 1) as f64;
        }
        Self {
            gamma,
            alpha,
            error_const,
        }
    }
}

/// `R[i][j] = prod_{m=1..i} (m - 1 - factor * j) / m`, the matrix that
/// re-expresses differences for a step scaled by `factor`.
fn compute_r(order: usize, factor: f64) -> DMatrix<f64> {
    let size = order + 1;
    let mut r = DMatrix::zeros(size, size);
    for j in 0..size {
        r[(0, j)] = 1.0;
    }
    for i in 1..size {
        for j in 0..size {
            let m = if j == 0 {
                0.0
            } else {
                (i as f64 - 1.0 - factor * j as f64) / i as f64
            };
            r[(i, j)] = r[(i - 1, j)] * m;
        }
    }
    r
}

/// Rescales the first `order + 1` differences for a new step `h * factor`.
fn change_differences(d: &mut [DVector<f64>], order: usize, factor: f64) {
    let ru = compute_r(order, factor) * compute_r(order, 1.0);
    let old: Vec<DVector<f64>> = d[..=order].to_vec();
    for (i, row) in d.iter_mut().take(order + 1).enumerate() {
        row.fill(0.0);
        for (j, prev) in old.iter().enumerate() {
            row.axpy(ru[(j, i)], prev, 1.0);
        }
    }
}

struct NewtonOutcome {
    converged: bool,
    iterations: usize,
    y: DVector<f64>,
    d: DVector<f64>,
}

/// Variable order (1-5), variable step BDF.
///
/// The history is kept as modified divided differences, so a step size change
/// recombines them instead of restarting. The corrector uses NDF `kappa`
/// coefficients and a simplified Newton iteration whose Jacobian is only
/// re-evaluated when the iteration fails.
pub(crate) struct Bdf {
    t: f64,
    h: f64,
    order: usize,
    n_equal_steps: usize,
    differences: Vec<DVector<f64>>,
    jacobian: DMatrix<f64>,
    jacobian_current: bool,
    lu: Option<LU<f64, Dyn, Dyn>>,
    newton_tol: f64,
    rtol: f64,
    atol: f64,
    coefficients: Coefficients,
}

impl Bdf {
    pub fn new<Q: OdeProblem>(
        problem: &Q,
        t0: f64,
        y0: DVector<f64>,
        t_bound: f64,
        settings: &OdeSettings,
        stats: &mut OdeStats,
    ) -> Result<Self> {
        let rtol = settings.relative_tolerance;
        let (f0, jacobian) = problem.rhs_with_jacobian(t0, &y0)?;
        stats.rhs_evaluations += 1;
        stats.jacobian_evaluations += 1;
        let h = initial_step(problem, t0, &y0, &f0, t_bound, 1, settings, stats)?;

        let n = y0.len();
        let mut differences = vec![DVector::zeros(n); MAX_ORDER + 3];
        differences[1] = &f0 * h;
        differences[0] = y0;

        Ok(Self {
            t: t0,
            h,
            order: 1,
            n_equal_steps: 0,
            differences,
            jacobian,
            jacobian_current: true,
            lu: None,
            newton_tol: (10.0 * f64::EPSILON / rtol).max(0.03f64.min(rtol.sqrt())),
            rtol,
            atol: settings.absolute_tolerance,
            coefficients: Coefficients::new(),
        })
    }

    fn rescale(&mut self, factor: f64) {
        self.h *= factor;
        change_differences(&mut self.differences, self.order, factor);
        self.n_equal_steps = 0;
    }

    fn scale_of(&self, y: &DVector<f64>) -> DVector<f64> {
        y.map(|v| self.atol + self.rtol * v.abs())
    }

    #[allow(clippy::too_many_arguments)]
    fn solve_corrector<Q: OdeProblem>(
        &self,
        problem: &Q,
        t_new: f64,
        y_predict: &DVector<f64>,
        c: f64,
        psi: &DVector<f64>,
        lu: &LU<f64, Dyn, Dyn>,
        scale: &DVector<f64>,
        stats: &mut OdeStats,
    ) -> Result<NewtonOutcome> {
        let mut d = DVector::zeros(y_predict.len());
        let mut y = y_predict.clone();
        let mut dy_norm_old: Option<f64> = None;
        let mut converged = false;
        let mut iterations = 0;

        for k in 0..NEWTON_MAXITER {
            iterations = k + 1;
            let f = problem.rhs(t_new, &y)?;
            stats.rhs_evaluations += 1;
            let rhs = f * c - psi - &d;
            let Some(dy) = lu.solve(&rhs) else {
                break;
            };
            let dy_norm = rms_norm(&dy, scale);
            let rate = dy_norm_old.map(|old| dy_norm / old);
            if let Some(rate) = rate {
                let remaining = (NEWTON_MAXITER - k) as i32;
                if rate >= 1.0 || rate.powi(remaining) / (1.0 - rate) * dy_norm > self.newton_tol {
                    break;
                }
            }
            y += &dy;
            d += &dy;
            if dy_norm == 0.0
                || rate.map_or(false, |rate| rate / (1.0 - rate) * dy_norm < self.newton_tol)
            {
                converged = true;
                break;
            }
            dy_norm_old = Some(dy_norm);
        }

        Ok(NewtonOutcome {
            converged,
            iterations,
            y,
            d,
        })
    }

    fn select_order(&mut self, error_norm: f64, scale: &DVector<f64>, safety: f64) {
        let order = self.order;
        let error_const = &self.coefficients.error_const;
        let error_m = if order > 1 {
            rms_norm(&(&self.differences[order] * error_const[order - 1]), scale)
        } else {
            f64::INFINITY
        };
        let error_p = if order < MAX_ORDER {
            rms_norm(&(&self.differences[order + 2] * error_const[order + 1]), scale)
        } else {
            f64::INFINITY
        };

        let norms = [error_m, error_norm, error_p];
        let mut best = 1;
        let mut best_factor = f64::NEG_INFINITY;
        for (i, &norm) in norms.iter().enumerate() {
            let factor = norm.powf(-1.0 / (order + i) as f64);
            if factor > best_factor {
                best_factor = factor;
                best = i;
            }
        }

        self.order = order + best - 1;
        let factor = (safety * best_factor).min(MAX_FACTOR);
        self.rescale(factor);
        self.lu = None;
        trace!("bdf: order {} -> {}, h = {:e}", order, self.order, self.h);
    }
}

impl AdaptiveStepper for Bdf {
    fn t(&self) -> f64 {
        self.t
    }

    fn attempt<Q: OdeProblem>(
        &mut self,
        problem: &Q,
        t_bound: f64,
        stats: &mut OdeStats,
    ) -> Result<bool> {
        let min_step = 10.0 * f64::EPSILON * self.t.abs();
        if self.h <= min_step {
            return Err(stats.failure(
                problem.operation(),
                self.t,
                format!("step size {:e} underflowed", self.h),
            ));
        }

        let remaining = t_bound - self.t;
        let stretched = self.h >= remaining - min_step;
        if stretched {
            let factor = remaining / self.h;
            self.rescale(factor);
            self.h = remaining;
            self.lu = None;
        }
        let t_new = if stretched { t_bound } else { self.t + self.h };
        let h = self.h;
        let order = self.order;
        let gamma = self.coefficients.gamma;
        let alpha = self.coefficients.alpha;

        let mut y_predict = DVector::zeros(self.differences[0].len());
        for row in &self.differences[..=order] {
            y_predict += row;
        }
        let scale = self.scale_of(&y_predict);
        let mut psi = DVector::zeros(y_predict.len());
        for j in 1..=order {
            psi.axpy(gamma[j] / alpha[order], &self.differences[j], 1.0);
        }
        let c = h / alpha[order];

        let outcome = loop {
            let lu = match self.lu.take() {
                Some(lu) => lu,
                None => {
                    let n = y_predict.len();
                    (DMatrix::identity(n, n) - &self.jacobian * c).lu()
                }
            };
            let outcome =
                self.solve_corrector(problem, t_new, &y_predict, c, &psi, &lu, &scale, stats)?;
            self.lu = Some(lu);
            if outcome.converged || self.jacobian_current {
                break outcome;
            }
            self.jacobian = problem.jacobian(t_new, &y_predict)?;
            stats.jacobian_evaluations += 1;
            self.jacobian_current = true;
            self.lu = None;
        };

        if !outcome.converged {
            warn!("bdf: corrector failed at t = {}, halving h = {h:e}", self.t);
            self.rescale(0.5);
            self.lu = None;
            stats.rejected_steps += 1;
            return Ok(false);
        }

        let safety = 0.9 * (2 * NEWTON_MAXITER + 1) as f64
            / (2 * NEWTON_MAXITER + outcome.iterations) as f64;
        let scale = self.scale_of(&outcome.y);
        let error_norm = rms_norm(&(&outcome.d * self.coefficients.error_const[order]), &scale);
        if !error_norm.is_finite() {
            return Err(stats.failure(
                problem.operation(),
                self.t,
                "local error estimate is not finite",
            ));
        }

        if error_norm > 1.0 {
            let factor = (safety * error_norm.powf(-1.0 / (order + 1) as f64)).max(MIN_FACTOR);
            self.rescale(factor);
            stats.rejected_steps += 1;
            return Ok(false);
        }

        if outcome.y.iter().any(|v| !v.is_finite()) {
            return Err(stats.failure(
                problem.operation(),
                t_new,
                "state became non-finite",
            ));
        }

        stats.accepted_steps += 1;
        self.n_equal_steps += 1;
        self.t = t_new;
        self.jacobian_current = false;

        // D^{j+1} y_n = D^j y_n - D^j y_{n-1}, and d = D^{k+1} y_n.
        let d = outcome.d;
        self.differences[order + 2] = &d - &self.differences[order + 1];
        self.differences[order + 1] = d;
        for i in (0..=order).rev() {
            let next = self.differences[i + 1].clone();
            self.differences[i] += next;
        }

        if self.n_equal_steps >= order + 1 {
            self.select_order(error_norm, &scale, safety);
        }
        Ok(true)
    }

    fn interpolate(&self, t: f64) -> DVector<f64> {
        let mut y = self.differences[0].clone();
        let mut product = 1.0;
        for j in 0..self.order {
            let shift = self.t - self.h * j as f64;
            let denom = self.h * (j + 1) as f64;
            product *= (t - shift) / denom;
            y.axpy(product, &self.differences[j + 1], 1.0);
        }
        y
    }
}
