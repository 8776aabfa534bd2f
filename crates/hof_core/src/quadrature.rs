use std::f64::consts::FRAC_PI_2;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::adapter::IntegrandAdapter;
use crate::autodiff::{tangents, values, Param};
use crate::error::{ensure_finite, Error, Result};
use crate::sensitivity;
use crate::settings::QuadratureSettings;
use crate::traits::{DataBlock, Integrand};

const OPERATION: &str = "integrate_1d";
const MAX_LEVELS: usize = 15;
/// Levels evaluated before the convergence test is trusted.
const MIN_LEVELS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuadratureEstimate {
    pub value: f64,
    /// Difference between the last two refinement levels.
    pub error: f64,
    /// Quadrature of `|f|` with the same nodes.
    pub l1: f64,
    pub levels: usize,
    pub evaluations: usize,
}

impl QuadratureEstimate {
    fn zero() -> Self {
        Self {
            value: 0.0,
            error: 0.0,
            l1: 0.0,
            levels: 0,
            evaluations: 0,
        }
    }

    fn combine(self, other: Self) -> Self {
        Self {
            value: self.value + other.value,
            error: self.error + other.error,
            l1: self.l1 + other.l1,
            levels: self.levels.max(other.levels),
            evaluations: self.evaluations + other.evaluations,
        }
    }
}

/// Double exponential rules. Each maps the interval onto the real line in `t`
/// and applies the trapezoidal rule there; every level halves the spacing and
/// only evaluates the new odd-indexed nodes.
#[derive(Debug, Clone, Copy)]
enum Rule {
    /// `(a, b)` both finite.
    TanhSinh { a: f64, b: f64 },
    /// `(a, inf)`.
    ExpSinhUpper { a: f64 },
    /// `(-inf, b)`.
    ExpSinhLower { b: f64 },
    /// `(-inf, inf)`.
    SinhSinh,
}

#[derive(Default)]
struct Sums {
    value: f64,
    abs: f64,
    evaluations: usize,
}

struct Node {
    x: f64,
    xc: f64,
    weight: f64,
}

impl Rule {
    fn select(a: f64, b: f64) -> Self {
        match (a.is_finite(), b.is_finite()) {
            (true, true) => Rule::TanhSinh { a, b },
            (true, false) => Rule::ExpSinhUpper { a },
            (false, true) => Rule::ExpSinhLower { b },
            (false, false) => Rule::SinhSinh,
        }
    }

    /// Range of `t` beyond which the weights are negligible or the
    /// abscissas leave floating point range.
    fn t_range(&self) -> (f64, f64) {
        match self {
            Rule::TanhSinh { .. } => (-6.0, 6.0),
            Rule::ExpSinhUpper { .. } => (-6.0, 4.5),
            Rule::ExpSinhLower { .. } => (-4.5, 6.0),
            Rule::SinhSinh => (-4.5, 4.5),
        }
    }

    fn node(&self, t: f64) -> Option<Node> {
        let u = FRAC_PI_2 * t.sinh();
        let dudt = FRAC_PI_2 * t.cosh();
        let node = match *self {
            Rule::TanhSinh { a, b } => {
                let half = 0.5 * (b - a);
                // Distance to the nearer endpoint, computed without cancellation.
                let dist = half * 2.0 / ((2.0 * u.abs()).exp() + 1.0);
                let weight = half * dudt / (u.cosh() * u.cosh());
                let (x, xc) = if t >= 0.0 {
                    (b - dist, dist)
                } else {
                    (a + dist, -dist)
                };
                if !(x > a && x < b) {
                    return None;
                }
                Node { x, xc, weight }
            }
            Rule::ExpSinhUpper { a } => {
                let e = u.exp();
                let x = a + e;
                if !(x > a) {
                    return None;
                }
                Node {
                    x,
                    xc: f64::NAN,
                    weight: dudt * e,
                }
            }
            Rule::ExpSinhLower { b } => {
                let e = (-u).exp();
                let x = b - e;
                if !(x < b) {
                    return None;
                }
                Node {
                    x,
                    xc: f64::NAN,
                    weight: dudt * e,
                }
            }
            Rule::SinhSinh => Node {
                x: u.sinh(),
                xc: f64::NAN,
                weight: dudt * u.cosh(),
            },
        };
        if node.x.is_finite() && node.weight.is_finite() && node.weight > 0.0 {
            Some(node)
        } else {
            None
        }
    }

    fn integrate<G>(&self, tolerance: f64, g: &mut G) -> Result<QuadratureEstimate>
    where
        G: FnMut(f64, f64) -> Result<f64>,
    {
        let (t_lo, t_hi) = self.t_range();
        let mut h = 1.0;
        let mut sums = Sums::default();
        let mut visit = |k: i64, h: f64, sums: &mut Sums| -> Result<()> {
            if let Some(node) = self.node(k as f64 * h) {
                let value = g(node.x, node.xc)? * node.weight;
                sums.value += value;
                sums.abs += value.abs();
                sums.evaluations += 1;
            }
            Ok(())
        };

        let k_lo = (t_lo / h).ceil() as i64;
        let k_hi = (t_hi / h).floor() as i64;
        for k in k_lo..=k_hi {
            visit(k, h, &mut sums)?;
        }
        let mut estimate = h * sums.value;
        let mut error = f64::INFINITY;

        for level in 1..MAX_LEVELS {
            h *= 0.5;
            let k_lo = (t_lo / h).ceil() as i64;
            let k_hi = (t_hi / h).floor() as i64;
            for k in k_lo..=k_hi {
                if k % 2 != 0 {
                    visit(k, h, &mut sums)?;
                }
            }
            let refined = h * sums.value;
            let l1 = h * sums.abs;
            error = (refined - estimate).abs();
            estimate = refined;
            trace!("{self:?}: level {level} estimate {estimate:e} error {error:e}");

            if level >= MIN_LEVELS && error <= tolerance * l1 {
                return Ok(QuadratureEstimate {
                    value: estimate,
                    error,
                    l1,
                    levels: level + 1,
                    evaluations: sums.evaluations,
                });
            }
        }

        Err(Error::QuadratureConvergence {
            estimate,
            error,
            l1: h * sums.abs,
        })
    }
}

/// Checks the limits and reports whether the interval is non-empty.
pub(crate) fn check_limits(a: f64, b: f64) -> Result<bool> {
    if a.is_nan() || b.is_nan() {
        return Err(Error::invalid(
            OPERATION,
            format!("integration limits must not be NaN (a = {a}, b = {b})"),
        ));
    }
    if a > b {
        return Err(Error::invalid(
            OPERATION,
            format!("lower limit {a} is greater than upper limit {b}"),
        ));
    }
    Ok(a != b)
}

/// Integrates `g(x, xc)` over `(a, b)`, splitting at zero when the interval
/// has a finite endpoint and straddles it.
pub(crate) fn integrate_nodes<G>(
    a: f64,
    b: f64,
    settings: &QuadratureSettings,
    mut g: G,
) -> Result<QuadratureEstimate>
where
    G: FnMut(f64, f64) -> Result<f64>,
{
    if !check_limits(a, b)? {
        return Ok(QuadratureEstimate::zero());
    }
    let tolerance = settings.relative_tolerance;
    let straddles = a < 0.0 && b > 0.0 && (a.is_finite() || b.is_finite());
    if straddles {
        let left = Rule::select(a, 0.0).integrate(tolerance, &mut g)?;
        let right = Rule::select(0.0, b).integrate(tolerance, &mut g)?;
        Ok(left.combine(right))
    } else {
        Rule::select(a, b).integrate(tolerance, &mut g)
    }
}

/// Integrates `f(x; theta, data)` over `(a, b)` and reports the error
/// estimate alongside the value.
pub fn integrate_1d_with_diagnostics<F: Integrand>(
    integrand: &F,
    a: f64,
    b: f64,
    theta: &[f64],
    data: &DataBlock,
    settings: &QuadratureSettings,
) -> Result<QuadratureEstimate> {
    settings.validate()?;
    ensure_finite(OPERATION, "theta", theta)?;
    ensure_finite(OPERATION, "data.real", &data.real)?;
    let adapter = IntegrandAdapter::new(integrand, theta, data);
    let estimate = integrate_nodes(a, b, settings, |x, xc| adapter.evaluate(x, xc))?;
    debug!(
        "{OPERATION}: ({a}, {b}) = {:e} (error {:e}, {} evaluations)",
        estimate.value, estimate.error, estimate.evaluations
    );
    Ok(estimate)
}

/// Integrates `f(x, xc; theta, data)` over `(a, b)`.
///
/// `xc` is the distance to the nearer finite endpoint: `a - x` in the left
/// half of a finite interval, `b - x` in the right half, and NaN when either
/// limit is infinite. Integrands with endpoint singularities should use it
/// instead of `x` near the endpoints.
///
/// With dual inputs the tangent follows the Leibniz rule: the integral of
/// `(df/dtheta) theta_dot` plus `f(b) b_dot - f(a) a_dot`.
pub fn integrate_1d<F, P>(
    integrand: &F,
    a: P,
    b: P,
    theta: &[P],
    data: &DataBlock,
    settings: &QuadratureSettings,
) -> Result<P>
where
    F: Integrand,
    P: Param,
{
    let theta_values = values(theta);
    let estimate = integrate_1d_with_diagnostics(
        integrand,
        a.value(),
        b.value(),
        &theta_values,
        data,
        settings,
    )?;
    if !P::TRACKED {
        return Ok(P::from_parts(estimate.value, 0.0));
    }
    let tangent = sensitivity::integral_tangent(
        integrand,
        (a.value(), a.tangent()),
        (b.value(), b.tangent()),
        &theta_values,
        &tangents(theta),
        data,
        settings,
    )?;
    Ok(P::from_parts(estimate.value, tangent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;
    use crate::traits::Scalar;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Cubic;

    impl Integrand for Cubic {
        fn value<T: Scalar>(&self, x: f64, _xc: f64, _theta: &[T], _data: &DataBlock) -> anyhow::Result<T> {
            Ok(T::from_f64(x * x * x - 2.0 * x).unwrap_or_else(T::nan))
        }
    }

    /// theta0 * exp(-theta1 * x^2)
    struct Gaussian;

    impl Integrand for Gaussian {
        fn value<T: Scalar>(&self, x: f64, _xc: f64, theta: &[T], _data: &DataBlock) -> anyhow::Result<T> {
            let x = T::from_f64(x).unwrap_or_else(T::nan);
            Ok(theta[0] * (-theta[1] * x * x).exp())
        }
    }

    /// 1 / sqrt(1 - x) evaluated through the complement near x = 1.
    struct EndpointSingular;

    impl Integrand for EndpointSingular {
        fn value<T: Scalar>(&self, x: f64, xc: f64, _theta: &[T], _data: &DataBlock) -> anyhow::Result<T> {
            let distance = if xc > 0.0 { xc } else { 1.0 - x };
            Ok(T::from_f64(1.0 / distance.sqrt()).unwrap_or_else(T::nan))
        }
    }

    struct Step;

    impl Integrand for Step {
        fn value<T: Scalar>(&self, x: f64, _xc: f64, _theta: &[T], _data: &DataBlock) -> anyhow::Result<T> {
            Ok(if x < 1.0 / 3.0 { T::zero() } else { T::one() })
        }
    }

    struct Recording {
        calls: AtomicUsize,
        nodes: Mutex<Vec<(f64, f64)>>,
    }

    impl Recording {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                nodes: Mutex::new(Vec::new()),
            }
        }
    }

    impl Integrand for Recording {
        fn value<T: Scalar>(&self, x: f64, xc: f64, _theta: &[T], _data: &DataBlock) -> anyhow::Result<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut nodes) = self.nodes.lock() {
                nodes.push((x, xc));
            }
            Ok(T::from_f64((-x * x).exp()).unwrap_or_else(T::nan))
        }
    }

    fn integrate(f: &impl Integrand, a: f64, b: f64, theta: &[f64]) -> Result<f64> {
        integrate_1d(f, a, b, theta, &DataBlock::empty(), &QuadratureSettings::default())
    }

    #[test]
    fn polynomial_matches_antiderivative() {
        let value = integrate(&Cubic, 1.0, 3.0, &[]).unwrap();
        assert_relative_eq!(value, 12.0, max_relative = 1e-10);
    }

    #[test]
    fn interval_straddling_zero_is_split() {
        // x^3 - 2x over (-1, 2): [x^4/4 - x^2] = (4 - 4) - (1/4 - 1)
        let value = integrate(&Cubic, -1.0, 2.0, &[]).unwrap();
        assert_relative_eq!(value, 0.75, max_relative = 1e-8);
    }

    #[test]
    fn complement_resolves_endpoint_singularity() {
        let value = integrate(&EndpointSingular, 0.0, 1.0, &[]).unwrap();
        assert_relative_eq!(value, 2.0, max_relative = 1e-7);
    }

    #[test]
    fn infinite_intervals_use_the_matching_rule() {
        let pi_sqrt = std::f64::consts::PI.sqrt();
        let full = integrate(&Gaussian, f64::NEG_INFINITY, f64::INFINITY, &[1.0, 1.0]).unwrap();
        assert_relative_eq!(full, pi_sqrt, max_relative = 1e-8);
        let upper = integrate(&Gaussian, 0.0, f64::INFINITY, &[1.0, 1.0]).unwrap();
        assert_relative_eq!(upper, 0.5 * pi_sqrt, max_relative = 1e-8);
        let lower = integrate(&Gaussian, f64::NEG_INFINITY, 0.0, &[2.0, 1.0]).unwrap();
        assert_relative_eq!(lower, pi_sqrt, max_relative = 1e-8);
        // Semi-infinite with a finite endpoint on the other side of zero.
        let shifted = integrate(&Gaussian, -1.0, f64::INFINITY, &[1.0, 1.0]).unwrap();
        let expected = 0.5 * pi_sqrt + 0.746_824_132_812_427;
        assert_relative_eq!(shifted, expected, max_relative = 1e-8);
    }

    #[test]
    fn complement_follows_the_nearer_endpoint() {
        let f = Recording::new();
        integrate(&f, 1.0, 4.0, &[]).unwrap();
        let nodes = f.nodes.lock().unwrap();
        assert!(!nodes.is_empty());
        for &(x, xc) in nodes.iter() {
            assert!(x > 1.0 && x < 4.0);
            if xc > 0.0 {
                assert!((4.0 - x - xc).abs() < 1e-12, "x = {x}, xc = {xc}");
            } else {
                assert!((1.0 - x - xc).abs() < 1e-12, "x = {x}, xc = {xc}");
            }
        }
        drop(nodes);

        let g = Recording::new();
        integrate(&g, 2.0, f64::INFINITY, &[]).unwrap();
        assert!(g.nodes.lock().unwrap().iter().all(|&(_, xc)| xc.is_nan()));
    }

    #[test]
    fn empty_interval_is_zero_without_evaluation() {
        let f = Recording::new();
        assert_eq!(integrate(&f, 2.5, 2.5, &[]).unwrap(), 0.0);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reversed_or_nan_limits_are_rejected() {
        let f = Recording::new();
        assert!(matches!(
            integrate(&f, 1.0, 0.0, &[]),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            integrate(&f, f64::NAN, 1.0, &[]),
            Err(Error::InvalidArgument { .. })
        ));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn discontinuous_integrand_fails_to_converge() {
        let settings = QuadratureSettings {
            relative_tolerance: 1e-12,
        };
        let err = integrate_1d(&Step, 0.0, 1.0, &[] as &[f64], &DataBlock::empty(), &settings)
            .unwrap_err();
        match err {
            Error::QuadratureConvergence { estimate, l1, .. } => {
                assert!((estimate - 2.0 / 3.0).abs() < 1e-3);
                assert!(l1 > 0.0);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn dual_limits_and_parameters_follow_leibniz_rule() {
        // I(c, s) = int_0^b c exp(-s x^2) dx
        let b = Dual::new(1.5, 1.0);
        let theta = [Dual::new(2.0, 0.0), Dual::new(0.5, 0.0)];
        let value = integrate_1d(
            &Gaussian,
            Dual::constant(0.0),
            b,
            &theta,
            &DataBlock::empty(),
            &QuadratureSettings::default(),
        )
        .unwrap();
        assert_relative_eq!(value.eps, 2.0 * (-0.5 * 1.5f64 * 1.5).exp(), max_relative = 1e-9);

        // dI/dc = I / c
        let theta = [Dual::new(2.0, 1.0), Dual::new(0.5, 0.0)];
        let value = integrate_1d(
            &Gaussian,
            Dual::constant(0.0),
            Dual::constant(1.5),
            &theta,
            &DataBlock::empty(),
            &QuadratureSettings::default(),
        )
        .unwrap();
        assert_relative_eq!(value.eps, value.val / 2.0, max_relative = 1e-8);
    }
}
