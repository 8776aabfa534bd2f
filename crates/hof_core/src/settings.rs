use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings for the Powell hybrid root solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RootSettings {
    pub relative_tolerance: f64,
    pub function_tolerance: f64,
    /// `None` means `100 * (dimension + 1)` iterations.
    pub max_steps: Option<usize>,
}

impl Default for RootSettings {
    fn default() -> Self {
        Self {
            relative_tolerance: 1e-6,
            function_tolerance: 1e-6,
            max_steps: None,
        }
    }
}

impl RootSettings {
    pub fn max_steps_for(&self, dimension: usize) -> usize {
        self.max_steps.unwrap_or(100 * (dimension + 1))
    }

    pub fn validate(&self) -> Result<()> {
        positive("solve_algebraic", "relative_tolerance", self.relative_tolerance)?;
        positive("solve_algebraic", "function_tolerance", self.function_tolerance)?;
        if self.max_steps == Some(0) {
            return Err(Error::invalid(
                "solve_algebraic",
                "max_steps must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Settings shared by the non-stiff and stiff ODE integrators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OdeSettings {
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
    pub max_steps: usize,
}

impl Default for OdeSettings {
    fn default() -> Self {
        Self {
            relative_tolerance: 1e-6,
            absolute_tolerance: 1e-6,
            max_steps: 1_000_000,
        }
    }
}

impl OdeSettings {
    pub fn validate(&self, operation: &'static str) -> Result<()> {
        positive(operation, "relative_tolerance", self.relative_tolerance)?;
        positive(operation, "absolute_tolerance", self.absolute_tolerance)?;
        if self.max_steps == 0 {
            return Err(Error::invalid(operation, "max_steps must be greater than zero"));
        }
        Ok(())
    }
}

/// Settings for `integrate_1d`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuadratureSettings {
    pub relative_tolerance: f64,
}

impl Default for QuadratureSettings {
    fn default() -> Self {
        Self {
            relative_tolerance: 1e-8,
        }
    }
}

impl QuadratureSettings {
    pub fn validate(&self) -> Result<()> {
        positive("integrate_1d", "relative_tolerance", self.relative_tolerance)
    }
}

fn positive(operation: &'static str, name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::invalid(
            operation,
            format!("{name} must be finite and positive, got {value}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let root = RootSettings::default();
        assert_eq!(root.relative_tolerance, 1e-6);
        assert_eq!(root.function_tolerance, 1e-6);
        assert_eq!(root.max_steps_for(3), 400);

        let ode = OdeSettings::default();
        assert_eq!(ode.max_steps, 1_000_000);
        assert_eq!(QuadratureSettings::default().relative_tolerance, 1e-8);
    }

    #[test]
    fn validate_rejects_non_positive_tolerances() {
        let root = RootSettings {
            function_tolerance: 0.0,
            ..RootSettings::default()
        };
        assert!(matches!(root.validate(), Err(Error::InvalidArgument { .. })));

        let ode = OdeSettings {
            absolute_tolerance: f64::NAN,
            ..OdeSettings::default()
        };
        assert!(ode.validate("integrate_ode_stiff").is_err());

        let quad = QuadratureSettings {
            relative_tolerance: -1.0,
        };
        assert!(quad.validate().is_err());
    }
}
