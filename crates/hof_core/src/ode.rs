mod bdf;
mod problem;
mod rk45;

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::adapter::OdeAdapter;
use crate::autodiff::{tangents, values, Param};
use crate::error::{ensure_finite, Error, Result};
use crate::settings::OdeSettings;
use crate::traits::{DataBlock, OdeSystem};

use bdf::Bdf;
use problem::{OdeProblem, PlainProblem, SensitivityProblem};
use rk45::DormandPrince;

/// Work counters for one integration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OdeStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub rhs_evaluations: usize,
    pub jacobian_evaluations: usize,
}

impl OdeStats {
    fn attempts(&self) -> usize {
        self.accepted_steps + self.rejected_steps
    }

    /// Integration failure at `t`, reporting every step attempted so far.
    pub(crate) fn failure(
        &self,
        operation: &'static str,
        t: f64,
        reason: impl Into<String>,
    ) -> Error {
        Error::Integration {
            operation,
            t,
            steps: self.attempts(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OdeSolution {
    pub times: Vec<f64>,
    /// One row per entry of `times`, each as long as the initial state.
    pub states: Vec<Vec<f64>>,
    pub stats: OdeStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OdeMethod {
    /// Dormand-Prince 5(4).
    NonStiff,
    /// Variable order BDF with a Newton corrector.
    Stiff,
}

impl OdeMethod {
    pub fn operation(self) -> &'static str {
        match self {
            OdeMethod::NonStiff => "integrate_ode_nonstiff",
            OdeMethod::Stiff => "integrate_ode_stiff",
        }
    }

    fn run<Q: OdeProblem>(
        self,
        problem: &Q,
        t0: f64,
        y0: DVector<f64>,
        ts: &[f64],
        settings: &OdeSettings,
        stats: &mut OdeStats,
    ) -> Result<Vec<DVector<f64>>> {
        debug_assert_eq!(y0.len(), problem.dimension());
        let t_final = ts[ts.len() - 1];
        match self {
            OdeMethod::NonStiff => {
                let stepper = DormandPrince::new(problem, t0, y0, t_final, settings, stats)?;
                drive(stepper, problem, ts, settings, stats)
            }
            OdeMethod::Stiff => {
                let stepper = Bdf::new(problem, t0, y0, t_final, settings, stats)?;
                drive(stepper, problem, ts, settings, stats)
            }
        }
    }
}

/// One adaptive integration scheme.
pub(crate) trait AdaptiveStepper {
    fn t(&self) -> f64;

    /// Tries one step that does not pass `t_bound`. Returns whether the step
    /// was accepted; a rejected attempt has already shrunk the step size.
    fn attempt<Q: OdeProblem>(
        &mut self,
        problem: &Q,
        t_bound: f64,
        stats: &mut OdeStats,
    ) -> Result<bool>;

    /// Dense output over the last accepted step.
    fn interpolate(&self, t: f64) -> DVector<f64>;
}

/// Steps until the last output time is passed. Output times never constrain
/// the step sequence; each row comes from the stepper's dense output.
fn drive<St: AdaptiveStepper, Q: OdeProblem>(
    mut stepper: St,
    problem: &Q,
    ts: &[f64],
    settings: &OdeSettings,
    stats: &mut OdeStats,
) -> Result<Vec<DVector<f64>>> {
    let t_final = ts[ts.len() - 1];
    let mut rows = Vec::with_capacity(ts.len());
    while rows.len() < ts.len() {
        if stats.attempts() >= settings.max_steps {
            return Err(stats.failure(
                problem.operation(),
                stepper.t(),
                format!("maximum number of steps ({}) exceeded", settings.max_steps),
            ));
        }
        if stepper.attempt(problem, t_final, stats)? {
            while let Some(&t) = ts.get(rows.len()) {
                if t > stepper.t() {
                    break;
                }
                rows.push(stepper.interpolate(t));
            }
        }
    }
    Ok(rows)
}

/// Root mean square of `v / scale`.
pub(crate) fn rms_norm(v: &DVector<f64>, scale: &DVector<f64>) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let sum: f64 = v
        .iter()
        .zip(scale.iter())
        .map(|(x, s)| (x / s) * (x / s))
        .sum();
    (sum / v.len() as f64).sqrt()
}

/// Starting step from two evaluations of `f` (Hairer, Norsett & Wanner, II.4).
#[allow(clippy::too_many_arguments)]
pub(crate) fn initial_step<Q: OdeProblem>(
    problem: &Q,
    t0: f64,
    y0: &DVector<f64>,
    f0: &DVector<f64>,
    t_bound: f64,
    order: usize,
    settings: &OdeSettings,
    stats: &mut OdeStats,
) -> Result<f64> {
    let interval = t_bound - t0;
    let scale = y0.map(|v| settings.absolute_tolerance + settings.relative_tolerance * v.abs());
    let d0 = rms_norm(y0, &scale);
    let d1 = rms_norm(f0, &scale);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    }
    .min(interval);

    let y1 = y0 + f0 * h0;
    let f1 = problem.rhs(t0 + h0, &y1)?;
    stats.rhs_evaluations += 1;
    let d2 = rms_norm(&(f1 - f0), &scale) / h0;

    let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / (order + 1) as f64)
    };
    Ok((100.0 * h0).min(h1).min(interval))
}

fn validate(
    operation: &'static str,
    y0: &[f64],
    t0: f64,
    ts: &[f64],
    theta: &[f64],
    data: &DataBlock,
    settings: &OdeSettings,
) -> Result<()> {
    settings.validate(operation)?;
    if y0.is_empty() {
        return Err(Error::invalid(operation, "initial state must not be empty"));
    }
    ensure_finite(operation, "y0", y0)?;
    if !t0.is_finite() {
        return Err(Error::invalid(operation, format!("t0 is not finite ({t0})")));
    }
    if ts.is_empty() {
        return Err(Error::invalid(operation, "output times must not be empty"));
    }
    ensure_finite(operation, "ts", ts)?;
    if ts[0] <= t0 {
        return Err(Error::invalid(
            operation,
            format!("first output time {} must be greater than t0 = {t0}", ts[0]),
        ));
    }
    if let Some(idx) = ts.windows(2).position(|w| w[1] <= w[0]) {
        return Err(Error::invalid(
            operation,
            format!("output times must be strictly increasing (ts[{}] = {})", idx + 1, ts[idx + 1]),
        ));
    }
    ensure_finite(operation, "theta", theta)?;
    ensure_finite(operation, "data.real", &data.real)
}

/// Integrates without sensitivities, returning rows and work counters.
#[allow(clippy::too_many_arguments)]
pub fn integrate_ode_with_diagnostics<S: OdeSystem>(
    method: OdeMethod,
    system: &S,
    y0: &[f64],
    t0: f64,
    ts: &[f64],
    theta: &[f64],
    data: &DataBlock,
    settings: &OdeSettings,
) -> Result<OdeSolution> {
    let operation = method.operation();
    validate(operation, y0, t0, ts, theta, data, settings)?;
    let adapter = OdeAdapter::new(system, theta, data, y0.len(), operation);
    adapter.probe(t0, y0)?;

    let mut stats = OdeStats::default();
    let problem = PlainProblem::new(adapter);
    let rows = method.run(
        &problem,
        t0,
        DVector::from_column_slice(y0),
        ts,
        settings,
        &mut stats,
    )?;
    debug!("{operation}: {stats:?}");
    Ok(OdeSolution {
        times: ts.to_vec(),
        states: rows.iter().map(|r| r.iter().copied().collect()).collect(),
        stats,
    })
}

/// Integrates the state together with `S(t) = dy(t)/d(direction)` where
/// `dS/dt = J_y S + J_theta theta_seeds` and `S(t0) = s0`.
///
/// `theta_seeds` is `len(theta) x k` and `s0` is `len(y0) x k`. Returns the
/// state rows and one `len(y0) x k` sensitivity matrix per output time.
#[allow(clippy::too_many_arguments)]
pub(crate) fn integrate_sensitivities<S: OdeSystem>(
    method: OdeMethod,
    system: &S,
    y0: &[f64],
    t0: f64,
    ts: &[f64],
    theta: &[f64],
    data: &DataBlock,
    settings: &OdeSettings,
    theta_seeds: DMatrix<f64>,
    s0: DMatrix<f64>,
) -> Result<(Vec<Vec<f64>>, Vec<DMatrix<f64>>)> {
    let operation = method.operation();
    validate(operation, y0, t0, ts, theta, data, settings)?;
    let adapter = OdeAdapter::new(system, theta, data, y0.len(), operation);
    adapter.probe(t0, y0)?;

    let problem = SensitivityProblem::new(adapter, theta_seeds);
    let initial = problem.initial_state(y0, &s0);
    let mut stats = OdeStats::default();
    let rows = method.run(&problem, t0, initial, ts, settings, &mut stats)?;
    debug!(
        "{operation}: {} sensitivity columns, {stats:?}",
        problem.columns()
    );
    Ok(rows.iter().map(|row| problem.split(row)).unzip())
}

#[allow(clippy::too_many_arguments)]
fn integrate<S: OdeSystem, P: Param>(
    method: OdeMethod,
    system: &S,
    y0: &[P],
    t0: f64,
    ts: &[f64],
    theta: &[P],
    data: &DataBlock,
    settings: &OdeSettings,
) -> Result<Vec<Vec<P>>> {
    let y0_values = values(y0);
    let theta_values = values(theta);
    if !P::TRACKED {
        let solution = integrate_ode_with_diagnostics(
            method,
            system,
            &y0_values,
            t0,
            ts,
            &theta_values,
            data,
            settings,
        )?;
        return Ok(solution
            .states
            .into_iter()
            .map(|row| row.into_iter().map(|v| P::from_parts(v, 0.0)).collect())
            .collect());
    }

    let theta_seeds = DMatrix::from_column_slice(theta.len(), 1, &tangents(theta));
    let s0 = DMatrix::from_column_slice(y0.len(), 1, &tangents(y0));
    let (rows, sens) = integrate_sensitivities(
        method,
        system,
        &y0_values,
        t0,
        ts,
        &theta_values,
        data,
        settings,
        theta_seeds,
        s0,
    )?;
    Ok(rows
        .into_iter()
        .zip(sens)
        .map(|(row, s)| {
            row.into_iter()
                .zip(s.iter())
                .map(|(v, &dv)| P::from_parts(v, dv))
                .collect()
        })
        .collect())
}

/// Solves the initial value problem with Dormand-Prince 5(4) and returns the
/// state at each time in `ts`.
pub fn integrate_ode_nonstiff<S, P>(
    system: &S,
    y0: &[P],
    t0: f64,
    ts: &[f64],
    theta: &[P],
    data: &DataBlock,
    settings: &OdeSettings,
) -> Result<Vec<Vec<P>>>
where
    S: OdeSystem,
    P: Param,
{
    integrate(OdeMethod::NonStiff, system, y0, t0, ts, theta, data, settings)
}

/// Same contract as [`integrate_ode_nonstiff`], using BDF for stiff systems.
pub fn integrate_ode_stiff<S, P>(
    system: &S,
    y0: &[P],
    t0: f64,
    ts: &[f64],
    theta: &[P],
    data: &DataBlock,
    settings: &OdeSettings,
) -> Result<Vec<Vec<P>>>
where
    S: OdeSystem,
    P: Param,
{
    integrate(OdeMethod::Stiff, system, y0, t0, ts, theta, data, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;
    use crate::traits::Scalar;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// dy/dt = [[-a, w], [-w, -a]] y: a decaying rotation.
    struct Spiral;

    impl OdeSystem for Spiral {
        fn derivative<T: Scalar>(
            &self,
            _t: f64,
            y: &[T],
            theta: &[T],
            _data: &DataBlock,
        ) -> anyhow::Result<Vec<T>> {
            let (a, w) = (theta[0], theta[1]);
            Ok(vec![-a * y[0] + w * y[1], -w * y[0] - a * y[1]])
        }
    }

    fn spiral_exact(t: f64, y0: [f64; 2], a: f64, w: f64) -> [f64; 2] {
        let decay = (-a * t).exp();
        let (s, c) = (w * t).sin_cos();
        [
            decay * (c * y0[0] + s * y0[1]),
            decay * (-s * y0[0] + c * y0[1]),
        ]
    }

    /// dy/dt = -k (y - 1) with a large k.
    struct Relaxation;

    impl OdeSystem for Relaxation {
        fn derivative<T: Scalar>(
            &self,
            _t: f64,
            y: &[T],
            theta: &[T],
            _data: &DataBlock,
        ) -> anyhow::Result<Vec<T>> {
            Ok(vec![-theta[0] * (y[0] - T::one())])
        }
    }

    struct Counting {
        calls: AtomicUsize,
        len: usize,
    }

    impl OdeSystem for Counting {
        fn derivative<T: Scalar>(
            &self,
            _t: f64,
            _y: &[T],
            _theta: &[T],
            _data: &DataBlock,
        ) -> anyhow::Result<Vec<T>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![T::zero(); self.len])
        }
    }

    fn tight(tol: f64) -> OdeSettings {
        OdeSettings {
            relative_tolerance: tol,
            absolute_tolerance: tol,
            ..OdeSettings::default()
        }
    }

    #[test]
    fn nonstiff_matches_linear_closed_form() {
        let theta = [0.3, 2.0];
        let ts = [0.1, 0.5, 1.0, 2.5, 4.0];
        let rows = integrate_ode_nonstiff(
            &Spiral,
            &[1.0, 0.5],
            0.0,
            &ts,
            &theta,
            &DataBlock::empty(),
            &tight(1e-10),
        )
        .unwrap();
        assert_eq!(rows.len(), ts.len());
        for (row, &t) in rows.iter().zip(&ts) {
            let exact = spiral_exact(t, [1.0, 0.5], 0.3, 2.0);
            assert!((row[0] - exact[0]).abs() < 1e-7, "t = {t}");
            assert!((row[1] - exact[1]).abs() < 1e-7, "t = {t}");
        }
    }

    #[test]
    fn stiff_matches_linear_closed_form() {
        let theta = [0.3, 2.0];
        let ts = [0.1, 0.5, 1.0, 2.5, 4.0];
        let rows = integrate_ode_stiff(
            &Spiral,
            &[1.0, 0.5],
            0.0,
            &ts,
            &theta,
            &DataBlock::empty(),
            &tight(1e-10),
        )
        .unwrap();
        for (row, &t) in rows.iter().zip(&ts) {
            let exact = spiral_exact(t, [1.0, 0.5], 0.3, 2.0);
            assert!((row[0] - exact[0]).abs() < 1e-6, "t = {t}");
            assert!((row[1] - exact[1]).abs() < 1e-6, "t = {t}");
        }
    }

    #[test]
    fn stiff_relaxation_takes_few_steps() {
        let solution = integrate_ode_with_diagnostics(
            OdeMethod::Stiff,
            &Relaxation,
            &[0.0],
            0.0,
            &[1.0, 10.0],
            &[1e4],
            &DataBlock::empty(),
            &OdeSettings::default(),
        )
        .unwrap();
        assert!((solution.states[0][0] - 1.0).abs() < 1e-5);
        assert!((solution.states[1][0] - 1.0).abs() < 1e-5);
        assert!(solution.stats.accepted_steps < 1000, "{:?}", solution.stats);
        assert!(solution.stats.jacobian_evaluations >= 1);
    }

    #[test]
    fn dense_output_fills_times_inside_one_step() {
        let ts: Vec<f64> = (1..=50).map(|i| i as f64 * 1e-3).collect();
        let solution = integrate_ode_with_diagnostics(
            OdeMethod::NonStiff,
            &Spiral,
            &[1.0, 0.0],
            0.0,
            &ts,
            &[0.0, 0.1],
            &DataBlock::empty(),
            &OdeSettings::default(),
        )
        .unwrap();
        assert!(solution.stats.accepted_steps < ts.len());
        for (row, &t) in solution.states.iter().zip(&ts) {
            let exact = spiral_exact(t, [1.0, 0.0], 0.0, 0.1);
            assert!((row[0] - exact[0]).abs() < 1e-6);
            assert!((row[1] - exact[1]).abs() < 1e-6);
        }
    }

    #[test]
    fn parameter_tangent_matches_analytic_derivative() {
        // d y(t) / d a = -t y(t) for the spiral.
        let theta = [Dual::new(0.3, 1.0), Dual::constant(2.0)];
        let y0 = [Dual::constant(1.0), Dual::constant(0.5)];
        let ts = [0.5, 2.0];
        for rows in [
            integrate_ode_nonstiff(&Spiral, &y0, 0.0, &ts, &theta, &DataBlock::empty(), &tight(1e-10))
                .unwrap(),
            integrate_ode_stiff(&Spiral, &y0, 0.0, &ts, &theta, &DataBlock::empty(), &tight(1e-10))
                .unwrap(),
        ] {
            for (row, &t) in rows.iter().zip(&ts) {
                let exact = spiral_exact(t, [1.0, 0.5], 0.3, 2.0);
                assert!((row[0].eps + t * exact[0]).abs() < 1e-5, "t = {t}");
                assert!((row[1].eps + t * exact[1]).abs() < 1e-5, "t = {t}");
            }
        }
    }

    #[test]
    fn initial_state_tangent_follows_the_flow() {
        let theta = [Dual::constant(0.3), Dual::constant(2.0)];
        let y0 = [Dual::new(1.0, 1.0), Dual::new(0.5, 0.0)];
        let rows = integrate_ode_nonstiff(
            &Spiral,
            &y0,
            0.0,
            &[1.5],
            &theta,
            &DataBlock::empty(),
            &tight(1e-10),
        )
        .unwrap();
        // Linear flow: the tangent is the solution started from e_0.
        let exact = spiral_exact(1.5, [1.0, 0.0], 0.3, 2.0);
        assert!((rows[0][0].eps - exact[0]).abs() < 1e-6);
        assert!((rows[0][1].eps - exact[1]).abs() < 1e-6);
    }

    #[test]
    fn rejects_bad_times_before_evaluating() {
        let system = Counting {
            calls: AtomicUsize::new(0),
            len: 1,
        };
        let data = DataBlock::empty();
        let settings = OdeSettings::default();
        let cases: [&[f64]; 4] = [&[], &[0.0, 1.0], &[1.0, 1.0], &[2.0, 1.0]];
        for ts in cases {
            let err = integrate_ode_nonstiff(&system, &[1.0], 0.0, ts, &[] as &[f64], &data, &settings)
                .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { .. }), "{ts:?}: {err}");
        }
        let err = integrate_ode_stiff(&system, &[f64::NAN], 0.0, &[1.0], &[] as &[f64], &data, &settings)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(system.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wrong_derivative_length_is_a_dimension_mismatch() {
        let system = Counting {
            calls: AtomicUsize::new(0),
            len: 3,
        };
        let err = integrate_ode_stiff(
            &system,
            &[1.0, 2.0],
            0.0,
            &[1.0],
            &[] as &[f64],
            &DataBlock::empty(),
            &OdeSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                found: 3,
                ..
            }
        ));
        assert_eq!(system.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausting_max_steps_is_an_integration_error() {
        let settings = OdeSettings {
            max_steps: 3,
            ..tight(1e-10)
        };
        let err = integrate_ode_nonstiff(
            &Spiral,
            &[1.0, 0.0],
            0.0,
            &[100.0],
            &[0.1, 5.0],
            &DataBlock::empty(),
            &settings,
        )
        .unwrap_err();
        match err {
            Error::Integration { steps, t, .. } => {
                assert_eq!(steps, 3);
                assert!(t < 100.0);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn failures_count_rejected_attempts() {
        let stats = OdeStats {
            accepted_steps: 7,
            rejected_steps: 2,
            ..OdeStats::default()
        };
        match stats.failure("integrate_ode_stiff", 1.5, "state became non-finite") {
            Error::Integration {
                operation,
                t,
                steps,
                reason,
            } => {
                assert_eq!(operation, "integrate_ode_stiff");
                assert_eq!(t, 1.5);
                assert_eq!(steps, 9);
                assert_eq!(reason, "state became non-finite");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn rms_norm_scales_componentwise() {
        let v = DVector::from_vec(vec![2.0, -4.0]);
        let scale = DVector::from_vec(vec![2.0, 4.0]);
        assert!((rms_norm(&v, &scale) - 1.0).abs() < 1e-15);
    }
}
