/// The `hof_core` crate provides differentiable higher-order numerical functions:
/// operations that take a user function as an argument and solve, integrate or
/// map it, while propagating derivatives with respect to their parameters.
///
/// Key components:
/// - **Traits**: `Scalar` (numeric type abstraction) and one contract per user
///   function role (`AlgebraicSystem`, `OdeSystem`, `Integrand`, `ShardWorker`).
/// - **Autodiff**: `Dual` numbers and the `Param` tag that selects plain or
///   differentiable inputs.
/// - **Solvers**: Powell hybrid root finding, Dormand-Prince and BDF integrators,
///   double exponential quadrature, and a parallel sharded map.
/// - **Sensitivity**: implicit function theorem, forward sensitivity ODEs and
///   the Leibniz rule, exposed as full Jacobians.
pub mod traits;

pub mod adapter;
pub mod algebraic;
pub mod autodiff;
pub mod error;
pub mod map_rect;
pub mod ode;
pub mod quadrature;
pub mod sensitivity;
pub mod settings;

pub use algebraic::{solve_algebraic, solve_algebraic_with_diagnostics, RootSolution};
pub use autodiff::{Dual, Param};
pub use error::{Error, Result};
pub use map_rect::map_rect;
pub use ode::{
    integrate_ode_nonstiff, integrate_ode_stiff, integrate_ode_with_diagnostics, OdeMethod,
    OdeSolution, OdeStats,
};
pub use quadrature::{integrate_1d, integrate_1d_with_diagnostics, QuadratureEstimate};
pub use sensitivity::{
    algebraic_jacobian, integral_gradient, map_rect_jacobian, ode_initial_state_jacobians,
    ode_parameter_jacobians, MapRectJacobian,
};
pub use settings::{OdeSettings, QuadratureSettings, RootSettings};
pub use traits::{AlgebraicSystem, DataBlock, Integrand, OdeSystem, Scalar, ShardWorker};
