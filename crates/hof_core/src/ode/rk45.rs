use log::trace;
use nalgebra::DVector;

use super::problem::OdeProblem;
use super::{initial_step, rms_norm, AdaptiveStepper, OdeStats};
use crate::error::Result;
use crate::settings::OdeSettings;

// Dormand-Prince 5(4) tableau.
const C: [f64; 6] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0];
const A: [[f64; 5]; 6] = [
    [0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
    ],
];
const B: [f64; 6] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
];
/// Difference between the order 5 and order 4 weights (7 stages, FSAL).
const E: [f64; 7] = [
    -71.0 / 57600.0,
    0.0,
    71.0 / 16695.0,
    -71.0 / 1920.0,
    17253.0 / 339200.0,
    -22.0 / 525.0,
    1.0 / 40.0,
];
/// Continuous extension: y(t_old + x h) = y_old + h * sum_j (K^T P)_j x^(j+1).
const P: [[f64; 4]; 7] = [
    [
        1.0,
        -8048581381.0 / 2820520608.0,
        8663915743.0 / 2820520608.0,
        -12715105075.0 / 11282082432.0,
    ],
    [0.0, 0.0, 0.0, 0.0],
    [
        0.0,
        131558114200.0 / 32700410799.0,
        -68118460800.0 / 10900136933.0,
        87487479700.0 / 32700410799.0,
    ],
    [
        0.0,
        -1754552775.0 / 470086768.0,
        14199869525.0 / 1410260304.0,
        -10690763975.0 / 1880347072.0,
    ],
    [
        0.0,
        127303824393.0 / 49829197408.0,
        -318862633887.0 / 49829197408.0,
        701980252875.0 / 199316789632.0,
    ],
    [
        0.0,
        -282668133.0 / 205662961.0,
        2019193451.0 / 616988883.0,
        -1453857185.0 / 822651844.0,
    ],
    [
        0.0,
        40617522.0 / 29380423.0,
        -110615467.0 / 29380423.0,
        69997945.0 / 29380423.0,
    ],
];

// PI step size controller.
const SAFETY: f64 = 0.9;
const BETA: f64 = 0.04;
const EXPONENT: f64 = 0.2 - BETA * 0.75;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

/// Dormand-Prince 5(4) with a PI controller and dense output.
pub(crate) struct DormandPrince {
    t: f64,
    y: DVector<f64>,
    f: DVector<f64>,
    h: f64,
    err_old: f64,
    last_rejected: bool,
    rtol: f64,
    atol: f64,
    stages: Vec<DVector<f64>>,
    // Last accepted step, kept for interpolation.
    t_old: f64,
    y_old: DVector<f64>,
    h_last: f64,
    dense_stages: Vec<DVector<f64>>,
}

impl DormandPrince {
    pub fn new<Q: OdeProblem>(
        problem: &Q,
        t0: f64,
        y0: DVector<f64>,
        t_bound: f64,
        settings: &OdeSettings,
        stats: &mut OdeStats,
    ) -> Result<Self> {
        let f0 = problem.rhs(t0, &y0)?;
        stats.rhs_evaluations += 1;
        let h = initial_step(problem, t0, &y0, &f0, t_bound, 4, settings, stats)?;
        let n = y0.len();
        Ok(Self {
            t: t0,
            y: y0.clone(),
            f: f0,
            h,
            err_old: 1e-4,
            last_rejected: false,
            rtol: settings.relative_tolerance,
            atol: settings.absolute_tolerance,
            stages: vec![DVector::zeros(n); 7],
            t_old: t0,
            y_old: y0,
            h_last: 0.0,
            dense_stages: vec![DVector::zeros(n); 7],
        })
    }
}

impl AdaptiveStepper for DormandPrince {
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
        let remaining = t_bound - self.t;
        let h = if self.h >= remaining - min_step {
            remaining
        } else {
            self.h
        };
        if h <= min_step {
            return Err(stats.failure(
                problem.operation(),
                self.t,
                format!("step size {h:e} underflowed"),
            ));
        }

        self.stages[0].copy_from(&self.f);
        for s in 1..6 {
            let mut y_stage = self.y.clone();
            for j in 0..s {
                if A[s][j] != 0.0 {
                    y_stage.axpy(h * A[s][j], &self.stages[j], 1.0);
                }
            }
            self.stages[s] = problem.rhs(self.t + C[s] * h, &y_stage)?;
        }

        let mut y_new = self.y.clone();
        for j in 0..6 {
            if B[j] != 0.0 {
                y_new.axpy(h * B[j], &self.stages[j], 1.0);
            }
        }
        let t_new = if h == remaining { t_bound } else { self.t + h };
        self.stages[6] = problem.rhs(t_new, &y_new)?;
        stats.rhs_evaluations += 6;

        let mut error = DVector::zeros(self.y.len());
        for j in 0..7 {
            if E[j] != 0.0 {
                error.axpy(h * E[j], &self.stages[j], 1.0);
            }
        }
        let scale = self
            .y
            .zip_map(&y_new, |a, b| self.atol + self.rtol * a.abs().max(b.abs()));
        let err = rms_norm(&error, &scale);
        if !err.is_finite() {
            return Err(stats.failure(
                problem.operation(),
                self.t,
                "local error estimate is not finite",
            ));
        }
        let fac11 = err.powf(EXPONENT);

        if err <= 1.0 {
            if y_new.iter().any(|v| !v.is_finite()) {
                return Err(stats.failure(
                    problem.operation(),
                    t_new,
                    "state became non-finite",
                ));
            }
            let factor = (fac11 / self.err_old.powf(BETA) / SAFETY)
                .clamp(1.0 / MAX_FACTOR, 1.0 / MIN_FACTOR);
            let mut h_new = h / factor;
            if self.last_rejected {
                h_new = h_new.min(h);
            }
            self.err_old = err.max(1e-4);
            self.last_rejected = false;

            self.t_old = self.t;
            self.h_last = h;
            std::mem::swap(&mut self.y_old, &mut self.y);
            std::mem::swap(&mut self.dense_stages, &mut self.stages);
            self.t = t_new;
            self.y = y_new;
            self.f = self.dense_stages[6].clone();
            self.h = h_new;
            stats.accepted_steps += 1;
            Ok(true)
        } else {
            self.h = h / (fac11 / SAFETY).min(1.0 / MIN_FACTOR);
            self.last_rejected = true;
            stats.rejected_steps += 1;
            trace!("dormand-prince: rejected h = {h:e} at t = {} (err = {err:.3})", self.t);
            Ok(false)
        }
    }

    fn interpolate(&self, t: f64) -> DVector<f64> {
        if t == self.t || self.h_last == 0.0 {
            return self.y.clone();
        }
        let x = (t - self.t_old) / self.h_last;
        let powers = [x, x * x, x * x * x, x * x * x * x];
        let mut y = self.y_old.clone();
        for (i, stage) in self.dense_stages.iter().enumerate() {
            let weight: f64 = (0..4).map(|j| P[i][j] * powers[j]).sum();
            if weight != 0.0 {
                y.axpy(self.h_last * weight, stage, 1.0);
            }
        }
        y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tableau_rows_are_consistent() {
        for s in 1..6 {
            let row_sum: f64 = A[s].iter().sum();
            assert!((row_sum - C[s]).abs() < 1e-14, "row {s}");
        }
        assert!((B.iter().sum::<f64>() - 1.0).abs() < 1e-14);
        assert!(E.iter().sum::<f64>().abs() < 1e-14);
    }

    #[test]
    fn dense_output_reaches_the_step_end() {
        // At x = 1 the continuous extension must reproduce the order 5 weights.
        for i in 0..6 {
            let weight: f64 = P[i].iter().sum();
            assert!((weight - B[i]).abs() < 1e-12, "stage {i}");
        }
        assert!(P[6].iter().sum::<f64>().abs() < 1e-12);
    }
}
