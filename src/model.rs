//! SIRV model definition.
//!
//! Four compartments (susceptible, infected, recovered, vaccinated) coupled by
//! births, natural mortality, vaccination, infection and recovery.

use crate::error::{SimError, SimResult};
use crate::solver::OdeSystem;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Number of compartments.
pub const N_COMP: usize = 4;

/// Compartment sizes at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PopulationState {
    pub s: f64,
    pub i: f64,
    pub r: f64,
    pub v: f64,
}

impl PopulationState {
    pub fn new(s: f64, i: f64, r: f64, v: f64) -> Self {
        Self { s, i, r, v }
    }

    /// Sum of all four compartments.
    pub fn total(&self) -> f64 {
        self.s + self.i + self.r + self.v
    }

    /// Smallest of the four compartments.
    pub fn min(&self) -> f64 {
        self.s.min(self.i).min(self.r).min(self.v)
    }

    pub fn to_array(self) -> [f64; N_COMP] {
        [self.s, self.i, self.r, self.v]
    }

    pub fn from_slice(y: &[f64]) -> Self {
        Self::new(y[0], y[1], y[2], y[3])
    }
}

impl From<[f64; N_COMP]> for PopulationState {
    fn from(y: [f64; N_COMP]) -> Self {
        Self::new(y[0], y[1], y[2], y[3])
    }
}

/// Model parameters, fixed for one simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelParameters {
    /// Total population.
    pub n_pop: f64,
    /// Contact rate.
    pub beta: f64,
    /// Recovery rate.
    pub gamma: f64,
    /// Vaccination rate.
    pub sigma: f64,
    /// Birth and mortality rate.
    pub mu: f64,
}

impl ModelParameters {
    /// Create validated parameters.
    ///
    /// # Errors
    /// Returns [`SimError::Configuration`] if any value is non-finite,
    /// `n_pop`, `beta` or `gamma` is not positive, or `sigma` or `mu` is negative.
    pub fn new(n_pop: f64, beta: f64, gamma: f64, sigma: f64, mu: f64) -> SimResult<Self> {
        let par = Self {
            n_pop,
            beta,
            gamma,
            sigma,
            mu,
        };
        par.validate()?;
        Ok(par)
    }

    pub fn validate(&self) -> SimResult<()> {
        check_rate("n_pop", self.n_pop, true)?;
        check_rate("beta", self.beta, true)?;
        check_rate("gamma", self.gamma, true)?;
        check_rate("sigma", self.sigma, false)?;
        check_rate("mu", self.mu, false)?;
        Ok(())
    }

    /// Basic reproduction number `beta / (gamma + mu)`.
    pub fn basic_reproduction_number(&self) -> f64 {
        self.beta / (self.gamma + self.mu)
    }
}

fn check_rate(name: &str, val: f64, strictly_positive: bool) -> SimResult<()> {
    let valid = val.is_finite() && if strictly_positive { val > 0.0 } else { val >= 0.0 };
    if !valid {
        let bound = if strictly_positive { "> 0" } else { ">= 0" };
        return Err(SimError::Configuration(format!(
            "{name} must be finite and {bound}, but is {val}"
        )));
    }
    Ok(())
}

/// Instantaneous rate of change of every compartment.
///
/// The vaccinated inflow is `sigma*S/N` while the recovered compartment
/// receives `sigma*S`, so `S+I+R+V` is not conserved. The equations are kept
/// exactly as formulated.
pub fn derivative(state: &PopulationState, par: &ModelParameters) -> PopulationState {
    let &PopulationState { s, i, r, v } = state;
    let &ModelParameters {
        n_pop,
        beta,
        gamma,
        sigma,
        mu,
    } = par;

    let infection = beta * s * i / n_pop;

    PopulationState {
        s: mu * n_pop - mu * s - sigma * s - infection,
        i: infection - gamma * i - mu * i,
        r: gamma * i + sigma * s - mu * r,
        v: sigma * s / n_pop - mu * v,
    }
}

/// Analytic Jacobian `∂f/∂y` of [`derivative`], rows and columns ordered `S, I, R, V`.
pub fn jacobian(state: &PopulationState, par: &ModelParameters) -> DMatrix<f64> {
    let &PopulationState { s, i, .. } = state;
    let &ModelParameters {
        n_pop,
        beta,
        gamma,
        sigma,
        mu,
    } = par;

    #[rustfmt::skip]
    let jac = DMatrix::from_row_slice(N_COMP, N_COMP, &[
        -mu - sigma - beta * i / n_pop, -beta * s / n_pop,              0.0, 0.0,
        beta * i / n_pop,               beta * s / n_pop - gamma - mu,  0.0, 0.0,
        sigma,                          gamma,                          -mu, 0.0,
        sigma / n_pop,                  0.0,                            0.0, -mu,
    ]);
    jac
}

/// The SIRV equations as an [`OdeSystem`].
#[derive(Debug, Clone, Copy)]
pub struct SirvModel {
    par: ModelParameters,
}

impl SirvModel {
    pub fn new(par: ModelParameters) -> Self {
        Self { par }
    }

    pub fn params(&self) -> &ModelParameters {
        &self.par
    }
}

impl OdeSystem for SirvModel {
    fn dimension(&self) -> usize {
        N_COMP
    }

    fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
        let rate = derivative(&PopulationState::from_slice(y), &self.par);
        dydt.copy_from_slice(&rate.to_array());
    }

    fn jacobian(&self, _t: f64, y: &[f64]) -> DMatrix<f64> {
        jacobian(&PopulationState::from_slice(y), &self.par)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reference_params() -> ModelParameters {
        ModelParameters::new(1000.0, 0.5, 0.01, 0.4, 0.2).unwrap()
    }

    #[test]
    fn derivative_matches_hand_computation() {
        let par = reference_params();
        let rate = derivative(&PopulationState::new(999.0, 1.0, 0.0, 0.0), &par);

        assert_relative_eq!(rate.s, 200.0 - 199.8 - 399.6 - 0.4995, epsilon = 1e-12);
        assert_relative_eq!(rate.i, 0.4995 - 0.01 - 0.2, epsilon = 1e-12);
        assert_relative_eq!(rate.r, 0.01 + 399.6, epsilon = 1e-12);
        assert_relative_eq!(rate.v, 0.3996, epsilon = 1e-12);
    }

    #[test]
    fn derivative_tolerates_negative_states() {
        let par = reference_params();
        let rate = derivative(&PopulationState::new(-1e-3, -2e-6, -5.0, -0.1), &par);
        assert!(rate.to_array().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn sir_limit_conserves_total() {
        let par = ModelParameters::new(500.0, 0.3, 0.1, 0.0, 0.0).unwrap();
        let rate = derivative(&PopulationState::new(400.0, 60.0, 40.0, 0.0), &par);
        assert_relative_eq!(rate.s + rate.i + rate.r, 0.0, epsilon = 1e-12);
        assert_eq!(rate.v, 0.0);
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let model = SirvModel::new(reference_params());
        let y = [700.0, 120.0, 150.0, 30.0];
        let jac = model.jacobian(0.0, &y);

        let mut f_plus = [0.0; N_COMP];
        let mut f_minus = [0.0; N_COMP];
        for col in 0..N_COMP {
            let step = 1e-4 * (1.0 + y[col].abs());
            let mut y_plus = y;
            let mut y_minus = y;
            y_plus[col] += step;
            y_minus[col] -= step;
            model.rhs(0.0, &y_plus, &mut f_plus);
            model.rhs(0.0, &y_minus, &mut f_minus);
            for row in 0..N_COMP {
                let fd = (f_plus[row] - f_minus[row]) / (2.0 * step);
                assert_relative_eq!(jac[(row, col)], fd, epsilon = 1e-8, max_relative = 1e-8);
            }
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(matches!(
            ModelParameters::new(0.0, 0.5, 0.1, 0.0, 0.0),
            Err(SimError::Configuration(_))
        ));
        assert!(ModelParameters::new(1000.0, -0.5, 0.1, 0.0, 0.0).is_err());
        assert!(ModelParameters::new(1000.0, 0.5, 0.0, 0.0, 0.0).is_err());
        assert!(ModelParameters::new(1000.0, 0.5, 0.1, -0.1, 0.0).is_err());
        assert!(ModelParameters::new(1000.0, 0.5, 0.1, 0.0, f64::NAN).is_err());
        assert!(ModelParameters::new(1000.0, 0.5, 0.1, 0.0, 0.0).is_ok());
    }

    #[test]
    fn reproduction_number() {
        let par = ModelParameters::new(1000.0, 0.5, 0.1, 0.0, 0.15).unwrap();
        assert_relative_eq!(par.basic_reproduction_number(), 2.0, epsilon = 1e-12);
    }
}
