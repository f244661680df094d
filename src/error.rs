use thiserror::Error;

/// Errors reported by the model, grid and solver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    /// Invalid parameters, grid, initial condition or solver options.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The integrator could not advance the solution any further.
    #[error("numerical failure at t = {t_reached}: {reason}")]
    NumericalFailure { t_reached: f64, reason: String },
}

/// Convenience type for `Result<T, SimError>`.
pub type SimResult<T> = Result<T, SimError>;
