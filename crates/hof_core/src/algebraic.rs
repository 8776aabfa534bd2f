use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::adapter::RootAdapter;
use crate::autodiff::{tangents, values, Param};
use crate::error::{ensure_finite, Error, Result};
use crate::sensitivity;
use crate::settings::RootSettings;
use crate::traits::{AlgebraicSystem, DataBlock};

const OPERATION: &str = "solve_algebraic";

/// Minimum actual/predicted reduction ratio for accepting a trial step.
const ACCEPT_RATIO: f64 = 1e-4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootSolution {
    pub state: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
}

/// Solves `g(y; theta, data) = 0` starting from `guess`.
///
/// When `theta` carries sensitivities (`P = Dual`), the returned root carries
/// `dy*/dtheta * theta_dot` from the implicit function theorem, evaluated once
/// at the converged root.
pub fn solve_algebraic<S, P>(
    system: &S,
    guess: &[f64],
    theta: &[P],
    data: &DataBlock,
    settings: &RootSettings,
) -> Result<Vec<P>>
where
    S: AlgebraicSystem,
    P: Param,
{
    let theta_values = values(theta);
    let solution = solve_algebraic_with_diagnostics(system, guess, &theta_values, data, settings)?;
    if !P::TRACKED {
        return Ok(solution
            .state
            .iter()
            .map(|&v| P::from_parts(v, 0.0))
            .collect());
    }
    let tangent = sensitivity::algebraic_tangent(
        system,
        &solution.state,
        &theta_values,
        &tangents(theta),
        data,
    )?;
    Ok(solution
        .state
        .iter()
        .zip(tangent.iter())
        .map(|(&v, &dv)| P::from_parts(v, dv))
        .collect())
}

/// Powell's hybrid (dogleg trust-region) method with an exact Jacobian.
pub fn solve_algebraic_with_diagnostics<S: AlgebraicSystem>(
    system: &S,
    guess: &[f64],
    theta: &[f64],
    data: &DataBlock,
    settings: &RootSettings,
) -> Result<RootSolution> {
    settings.validate()?;
    let dim = guess.len();
    if dim == 0 {
        return Err(Error::invalid(OPERATION, "initial guess must not be empty"));
    }
    ensure_finite(OPERATION, "guess", guess)?;
    ensure_finite(OPERATION, "theta", theta)?;
    ensure_finite(OPERATION, "data.real", &data.real)?;

    let adapter = RootAdapter::new(system, theta, data, dim);
    let max_steps = settings.max_steps_for(dim);

    let mut y = DVector::from_column_slice(guess);
    let mut residual = adapter.probe(guess)?;
    let mut residual_norm = residual.norm();
    let mut jacobian = adapter.jacobian(y.as_slice())?;
    let mut newton = gauss_newton_step(&jacobian, &residual);
    let mut radius = 100.0 * y.norm().max(1.0);
    let mut iterations = 0usize;

    loop {
        let scale = y.norm().max(1.0);
        if residual_norm <= settings.function_tolerance
            && newton.norm() <= settings.relative_tolerance * scale
        {
            debug!(
                "{OPERATION}: converged after {iterations} steps (|f| = {residual_norm:e})"
            );
            return Ok(RootSolution {
                state: y.iter().copied().collect(),
                residual_norm,
                iterations,
            });
        }

        if iterations >= max_steps {
            return Err(Error::NonConvergence {
                steps: max_steps,
                residual_norm,
                reason: "maximum number of steps exceeded",
            });
        }
        iterations += 1;

        let step = dogleg_step(&jacobian, &residual, &newton, radius);
        let step_norm = step.norm();
        let trial = &y + &step;
        let trial_residual = adapter.evaluate(trial.as_slice())?;

        let current = residual.norm_squared();
        let predicted = current - (&residual + &jacobian * &step).norm_squared();
        let actual = current - trial_residual.norm_squared();
        let ratio = if predicted > 0.0 { actual / predicted } else { 0.0 };

        if ratio < 0.25 {
            radius = 0.25 * step_norm;
        } else if ratio > 0.75 && step_norm >= 0.99 * radius {
            radius *= 2.0;
        }
        trace!(
            "{OPERATION}: step {iterations} |p| = {step_norm:e}, ratio = {ratio:.3}, radius = {radius:e}"
        );

        if ratio > ACCEPT_RATIO {
            y = trial;
            (residual, jacobian) = adapter.evaluate_with_jacobian(y.as_slice())?;
            residual_norm = residual.norm();
            newton = gauss_newton_step(&jacobian, &residual);
        } else if radius <= f64::EPSILON * scale {
            return Err(Error::NonConvergence {
                steps: iterations,
                residual_norm,
                reason: "trust region collapsed without reducing the residual",
            });
        }
    }
}

/// Solves `J p = -f`, falling back to a least-squares step when `J` is
/// singular.
fn gauss_newton_step(jacobian: &DMatrix<f64>, residual: &DVector<f64>) -> DVector<f64> {
    let rhs = -residual;
    if let Some(step) = jacobian.clone().lu().solve(&rhs) {
        if step.iter().all(|v| v.is_finite()) {
            return step;
        }
    }
    let n = residual.len();
    let svd = jacobian.clone().svd(true, true);
    let cutoff = svd.singular_values.max() * (n as f64) * f64::EPSILON;
    svd.solve(&rhs, cutoff)
        .unwrap_or_else(|_| DVector::zeros(n))
}

/// Dogleg combination of the Gauss-Newton and Cauchy steps inside `radius`.
fn dogleg_step(
    jacobian: &DMatrix<f64>,
    residual: &DVector<f64>,
    newton: &DVector<f64>,
    radius: f64,
) -> DVector<f64> {
    let newton_norm = newton.norm();
    if newton_norm <= radius {
        return newton.clone();
    }

    let gradient = jacobian.transpose() * residual;
    let gradient_norm = gradient.norm();
    if gradient_norm == 0.0 {
        return newton * (radius / newton_norm);
    }
    let jg_norm_sq = (jacobian * &gradient).norm_squared();
    if jg_norm_sq == 0.0 {
        return gradient * (-radius / gradient_norm);
    }

    let cauchy = &gradient * (-(gradient_norm * gradient_norm) / jg_norm_sq);
    let cauchy_norm = cauchy.norm();
    if cauchy_norm >= radius {
        return cauchy * (radius / cauchy_norm);
    }

    // Point where the segment from the Cauchy point to the Newton point
    // crosses the trust-region boundary.
    let diff = newton - &cauchy;
    let a = diff.norm_squared();
    let b = 2.0 * cauchy.dot(&diff);
    let c = cauchy_norm * cauchy_norm - radius * radius;
    let tau = (-b + (b * b - 4.0 * a * c).max(0.0).sqrt()) / (2.0 * a);
    cauchy + diff * tau
}
