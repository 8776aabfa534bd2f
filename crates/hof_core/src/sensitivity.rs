//! Derivatives of solver outputs with respect to their inputs.
//!
//! None of these differentiate through the iterations of a solver. Each one
//! queries derivatives of the user function at specific points and combines
//! them analytically:
//!
//! - algebraic roots: implicit function theorem at the converged root,
//!   `dy*/dtheta = -(dg/dy)^-1 dg/dtheta`;
//! - ODE solutions: forward sensitivity equations integrated with the state;
//! - integrals: Leibniz rule, integrating `df/dtheta` with the same rule;
//! - map-reduce: per-shard Jacobians assembled into shared and local blocks.

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::adapter::{IntegrandAdapter, RootAdapter};
use crate::algebraic::solve_algebraic_with_diagnostics;
use crate::error::{ensure_finite, ensure_len, Error, Result};
use crate::map_rect::{check_shards, run_shards, shards, OPERATION as MAP_RECT};
use crate::ode::{integrate_sensitivities, OdeMethod};
use crate::quadrature::{check_limits, integrate_nodes};
use crate::settings::{OdeSettings, QuadratureSettings, RootSettings};
use crate::traits::{AlgebraicSystem, DataBlock, Integrand, OdeSystem, ShardWorker};

const ROOT: &str = "solve_algebraic";
const QUADRATURE: &str = "integrate_1d";

/// Solves `(dg/dy) X = -rhs` with one factorization of `dg/dy`.
fn implicit_solve(j_y: DMatrix<f64>, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let lu = j_y.lu();
    if !lu.is_invertible() {
        return Err(Error::SingularJacobian { operation: ROOT });
    }
    match lu.solve(&(-rhs)) {
        Some(x) if x.iter().all(|v| v.is_finite()) => Ok(x),
        _ => Err(Error::SingularJacobian { operation: ROOT }),
    }
}

/// `dy*/dtheta * theta_dot` at a converged root, using a single dual pass for
/// `(dg/dtheta) theta_dot`.
pub(crate) fn algebraic_tangent<S: AlgebraicSystem>(
    system: &S,
    root: &[f64],
    theta: &[f64],
    theta_dot: &[f64],
    data: &DataBlock,
) -> Result<DVector<f64>> {
    let adapter = RootAdapter::new(system, theta, data, root.len());
    let j_y = adapter.jacobian(root)?;
    let g_dot = adapter.theta_directional(root, theta_dot)?;
    let rhs = DMatrix::from_column_slice(root.len(), 1, g_dot.as_slice());
    let x = implicit_solve(j_y, &rhs)?;
    Ok(x.column(0).into_owned())
}

/// Solves `g(y; theta, data) = 0` and returns the root with the full
/// `len(y) x len(theta)` Jacobian `dy*/dtheta`.
pub fn algebraic_jacobian<S: AlgebraicSystem>(
    system: &S,
    guess: &[f64],
    theta: &[f64],
    data: &DataBlock,
    settings: &RootSettings,
) -> Result<(Vec<f64>, DMatrix<f64>)> {
    let solution = solve_algebraic_with_diagnostics(system, guess, theta, data, settings)?;
    let adapter = RootAdapter::new(system, theta, data, guess.len());
    let j_y = adapter.jacobian(&solution.state)?;
    let j_theta = adapter.theta_jacobian(&solution.state)?;
    let jacobian = implicit_solve(j_y, &j_theta)?;
    Ok((solution.state, jacobian))
}

/// State rows at each output time with `dy(t)/dtheta` (`len(y0) x len(theta)`)
/// for each of them.
#[allow(clippy::too_many_arguments)]
pub fn ode_parameter_jacobians<S: OdeSystem>(
    method: OdeMethod,
    system: &S,
    y0: &[f64],
    t0: f64,
    ts: &[f64],
    theta: &[f64],
    data: &DataBlock,
    settings: &OdeSettings,
) -> Result<(Vec<Vec<f64>>, Vec<DMatrix<f64>>)> {
    let p = theta.len();
    integrate_sensitivities(
        method,
        system,
        y0,
        t0,
        ts,
        theta,
        data,
        settings,
        DMatrix::identity(p, p),
        DMatrix::zeros(y0.len(), p),
    )
}

/// State rows at each output time with `dy(t)/dy0` (`len(y0) x len(y0)`) for
/// each of them.
#[allow(clippy::too_many_arguments)]
pub fn ode_initial_state_jacobians<S: OdeSystem>(
    method: OdeMethod,
    system: &S,
    y0: &[f64],
    t0: f64,
    ts: &[f64],
    theta: &[f64],
    data: &DataBlock,
    settings: &OdeSettings,
) -> Result<(Vec<Vec<f64>>, Vec<DMatrix<f64>>)> {
    let n = y0.len();
    integrate_sensitivities(
        method,
        system,
        y0,
        t0,
        ts,
        theta,
        data,
        settings,
        DMatrix::zeros(theta.len(), n),
        DMatrix::identity(n, n),
    )
}

/// Integrand value at a finite limit for the Leibniz boundary term.
fn endpoint_value<F: Integrand>(
    adapter: &IntegrandAdapter<'_, F>,
    limit: f64,
    tangent: f64,
    xc: f64,
) -> Result<f64> {
    if tangent == 0.0 {
        return Ok(0.0);
    }
    if !limit.is_finite() {
        return Err(Error::invalid(
            QUADRATURE,
            "an infinite limit cannot carry a sensitivity",
        ));
    }
    adapter.evaluate(limit, xc)
}

/// Tangent of `int_a^b f(x; theta) dx` along `(a_dot, b_dot, theta_dot)`.
pub(crate) fn integral_tangent<F: Integrand>(
    integrand: &F,
    (a, a_dot): (f64, f64),
    (b, b_dot): (f64, f64),
    theta: &[f64],
    theta_dot: &[f64],
    data: &DataBlock,
    settings: &QuadratureSettings,
) -> Result<f64> {
    // An empty interval still moves with its limits.
    let non_empty = check_limits(a, b)?;
    let adapter = IntegrandAdapter::new(integrand, theta, data);
    let interior = if non_empty && theta_dot.iter().any(|&v| v != 0.0) {
        integrate_nodes(a, b, settings, |x, xc| adapter.directional(x, xc, theta_dot))?.value
    } else {
        0.0
    };
    let xc = if a.is_finite() && b.is_finite() {
        0.0
    } else {
        f64::NAN
    };
    let upper = endpoint_value(&adapter, b, b_dot, xc)?;
    let lower = endpoint_value(&adapter, a, a_dot, xc)?;
    Ok(interior + upper * b_dot - lower * a_dot)
}

/// Value of `int_a^b f(x; theta) dx` and its gradient with respect to
/// `theta`, one quadrature of `df/dtheta_j` per parameter.
pub fn integral_gradient<F: Integrand>(
    integrand: &F,
    a: f64,
    b: f64,
    theta: &[f64],
    data: &DataBlock,
    settings: &QuadratureSettings,
) -> Result<(f64, Vec<f64>)> {
    let value = crate::quadrature::integrate_1d_with_diagnostics(
        integrand, a, b, theta, data, settings,
    )?
    .value;
    let adapter = IntegrandAdapter::new(integrand, theta, data);
    let gradient = (0..adapter.num_params())
        .map(|j| {
            integrate_nodes(a, b, settings, |x, xc| adapter.partial(x, xc, j)).map(|e| e.value)
        })
        .collect::<Result<Vec<f64>>>()?;
    Ok((value, gradient))
}

/// Outputs of a `map_rect` call together with their Jacobian.
#[derive(Debug, Clone)]
pub struct MapRectJacobian {
    /// Concatenated outputs.
    pub value: Vec<f64>,
    /// `d value / d phi`, `len(value) x len(phi)`.
    pub shared: DMatrix<f64>,
    /// Per shard `d output_n / d theta_n`.
    pub local: Vec<DMatrix<f64>>,
    /// Start of each shard's rows in `value`.
    pub offsets: Vec<usize>,
}

impl MapRectJacobian {
    /// Pulls a cotangent on the outputs back to `(d/dphi, [d/dtheta_n])`.
    /// The `phi` part accumulates over all shards.
    pub fn gradient(&self, cotangent: &[f64]) -> Result<(Vec<f64>, Vec<Vec<f64>>)> {
        ensure_len(MAP_RECT, "cotangent", self.value.len(), cotangent.len())?;
        let w = DVector::from_column_slice(cotangent);
        let shared = self.shared.tr_mul(&w);
        let local = self
            .local
            .iter()
            .zip(&self.offsets)
            .map(|(block, &offset)| {
                block
                    .tr_mul(&w.rows(offset, block.nrows()))
                    .iter()
                    .copied()
                    .collect()
            })
            .collect();
        Ok((shared.iter().copied().collect(), local))
    }
}

/// Runs every shard with Jacobian evaluation and assembles the blocks.
pub fn map_rect_jacobian<W: ShardWorker>(
    worker: &W,
    phi: &[f64],
    thetas: &[Vec<f64>],
    x_r: &[Vec<f64>],
    x_i: &[Vec<i64>],
) -> Result<MapRectJacobian> {
    check_shards(phi, thetas, x_r, x_i)?;
    for theta in thetas {
        ensure_finite(MAP_RECT, "theta", theta)?;
    }
    let blocks = run_shards(&shards(thetas, x_r, x_i), |shard| {
        shard.adapter(worker, phi).evaluate_with_jacobian()
    })?;

    let total: usize = blocks.iter().map(|(value, _, _)| value.len()).sum();
    let mut value = Vec::with_capacity(total);
    let mut shared = DMatrix::zeros(total, phi.len());
    let mut local = Vec::with_capacity(blocks.len());
    let mut offsets = Vec::with_capacity(blocks.len());
    for (out, phi_block, theta_block) in blocks {
        let offset = value.len();
        shared
            .view_mut((offset, 0), (out.len(), phi.len()))
            .copy_from(&phi_block);
        offsets.push(offset);
        value.extend(out);
        local.push(theta_block);
    }
    debug!("{MAP_RECT}: jacobian with {} rows over {} shards", total, local.len());
    Ok(MapRectJacobian {
        value,
        shared,
        local,
        offsets,
    })
}
