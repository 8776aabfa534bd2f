use thiserror::Error;

/// Errors raised by the numerical operations.
///
/// Every variant names the operation that failed. No operation recovers from
/// any of these internally, and no partial result accompanies them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{operation}: {what} has length {found}, expected {expected}")]
    DimensionMismatch {
        operation: &'static str,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{operation}: {reason}")]
    InvalidArgument {
        operation: &'static str,
        reason: String,
    },

    #[error("{operation}: user function evaluation failed: {reason}")]
    Evaluation {
        operation: &'static str,
        reason: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("algebraic solver failed to converge after {steps} steps (|f(y)| = {residual_norm}): {reason}")]
    NonConvergence {
        steps: usize,
        residual_norm: f64,
        reason: &'static str,
    },

    #[error("{operation}: integration failed at t = {t} after {steps} steps: {reason}")]
    Integration {
        operation: &'static str,
        t: f64,
        steps: usize,
        reason: String,
    },

    #[error(
        "integrate_1d: error estimate {error} of integral {estimate} exceeds the relative tolerance times the L1 norm {l1}"
    )]
    QuadratureConvergence { estimate: f64, error: f64, l1: f64 },

    #[error("{operation}: Jacobian with respect to the unknowns is singular")]
    SingularJacobian { operation: &'static str },

    #[error("map_rect: shard {shard} failed")]
    Shard {
        shard: usize,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn dimension(
        operation: &'static str,
        what: &'static str,
        expected: usize,
        found: usize,
    ) -> Self {
        Self::DimensionMismatch {
            operation,
            what,
            expected,
            found,
        }
    }

    pub(crate) fn invalid(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation,
            reason: reason.into(),
        }
    }

    pub(crate) fn evaluation(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Evaluation {
            operation,
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn user(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Evaluation {
            operation,
            reason: format!("{source}"),
            source: Some(source),
        }
    }
}

/// Checks a length before any numerical work runs.
pub(crate) fn ensure_len(
    operation: &'static str,
    what: &'static str,
    expected: usize,
    found: usize,
) -> Result<()> {
    if expected != found {
        return Err(Error::dimension(operation, what, expected, found));
    }
    Ok(())
}

pub(crate) fn ensure_finite(operation: &'static str, what: &str, values: &[f64]) -> Result<()> {
    if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
        return Err(Error::invalid(
            operation,
            format!("{what}[{idx}] is not finite ({})", values[idx]),
        ));
    }
    Ok(())
}
