//! Adaptive variable-order multistep ODE integrator.
//!
//! Adams–Moulton formulas (orders 1..=12, functional iteration) handle
//! non-stiff stretches and BDF formulas (orders 1..=5, modified Newton
//! iteration) handle stiff ones. Both share a Nordsieck history array, so the
//! integrator switches between them without restarting. Values are reported
//! only at the requested output times, interpolated from the history array.

mod method;
mod nordsieck;
mod stepper;

pub use method::Method;

use crate::error::{SimError, SimResult};
use crate::grid::TimeGrid;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use stepper::Stepper;

/// Right-hand side of an autonomous or non-autonomous system `dy/dt = f(t, y)`.
pub trait OdeSystem {
    /// Number of state variables.
    fn dimension(&self) -> usize;

    /// Evaluate `f(t, y)` into `dydt`.
    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]);

    /// Jacobian `∂f/∂y` at `(t, y)`.
    ///
    /// Defaults to central finite differences. Override for analytic Jacobians.
    fn jacobian(&self, t: f64, y: &[f64]) -> DMatrix<f64> {
        let n = self.dimension();
        let mut jac = DMatrix::zeros(n, n);
        let mut yp = y.to_vec();
        let mut fp = vec![0.0; n];
        let mut fm = vec![0.0; n];
        for col in 0..n {
            let orig = yp[col];
            let step = 1e-8 * (1.0 + orig.abs());
            yp[col] = orig + step;
            self.rhs(t, &yp, &mut fp);
            yp[col] = orig - step;
            self.rhs(t, &yp, &mut fm);
            yp[col] = orig;
            for row in 0..n {
                jac[(row, col)] = (fp[row] - fm[row]) / (2.0 * step);
            }
        }
        jac
    }
}

/// Integrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverOptions {
    /// Relative error tolerance.
    pub rtol: f64,
    /// Absolute error tolerance.
    pub atol: f64,
    /// Maximum number of internal steps between two output times.
    pub max_steps: usize,
    /// Initial step size. Chosen automatically when unset.
    pub first_step: Option<f64>,
    /// Upper bound on the step size.
    pub max_step: f64,
    /// Highest Adams–Moulton order (1..=12).
    pub max_order_adams: usize,
    /// Highest BDF order (1..=5).
    pub max_order_bdf: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-8,
            atol: 1e-8,
            max_steps: 500,
            first_step: None,
            max_step: f64::INFINITY,
            max_order_adams: Method::Adams.max_order(),
            max_order_bdf: Method::Bdf.max_order(),
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> SimResult<()> {
        if !self.rtol.is_finite() || self.rtol <= 0.0 {
            return Err(config_error(format!("rtol must be finite and > 0, but is {}", self.rtol)));
        }
        if !self.atol.is_finite() || self.atol <= 0.0 {
            return Err(config_error(format!("atol must be finite and > 0, but is {}", self.atol)));
        }
        if self.max_steps == 0 {
            return Err(config_error("max_steps must be at least 1".into()));
        }
        if let Some(h0) = self.first_step {
            if !h0.is_finite() || h0 <= 0.0 {
                return Err(config_error(format!("first_step must be finite and > 0, but is {h0}")));
            }
        }
        if self.max_step.is_nan() || self.max_step <= 0.0 {
            return Err(config_error(format!("max_step must be > 0, but is {}", self.max_step)));
        }
        for (method, order) in [
            (Method::Adams, self.max_order_adams),
            (Method::Bdf, self.max_order_bdf),
        ] {
            if !(1..=method.max_order()).contains(&order) {
                return Err(config_error(format!(
                    "maximum {method:?} order must be in 1..={}, but is {order}",
                    method.max_order()
                )));
            }
        }
        Ok(())
    }
}

fn config_error(msg: String) -> SimError {
    SimError::Configuration(msg)
}

/// Work counters of one integration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverStats {
    pub steps: usize,
    pub rejected_steps: usize,
    pub rhs_evals: usize,
    pub jac_evals: usize,
    pub lu_decomps: usize,
    pub method_switches: usize,
}

/// Solution values at the output times.
#[derive(Debug, Clone)]
pub struct Solution {
    /// One state vector per output time; the first is the initial state.
    pub ys: Vec<Vec<f64>>,
    pub stats: SolverStats,
}

/// Integrate `system` from `y0` at `grid[0]` and report the state at every grid time.
///
/// The first output is `y0` itself. A grid with a single time returns
/// immediately without evaluating the system.
///
/// # Errors
/// Returns [`SimError::Configuration`] for invalid options or a state of the
/// wrong dimension, and [`SimError::NumericalFailure`] when the integrator
/// cannot reach an output time.
pub fn integrate<S: OdeSystem>(
    system: &S,
    y0: &[f64],
    grid: &TimeGrid,
    opts: &SolverOptions,
) -> SimResult<Solution> {
    opts.validate()?;
    let dim = system.dimension();
    if y0.len() != dim {
        return Err(config_error(format!(
            "initial state must have {dim} components, but has {}",
            y0.len()
        )));
    }
    if let Some(idx) = y0.iter().position(|x| !x.is_finite()) {
        return Err(config_error(format!("initial state component {idx} is not finite")));
    }

    let times = grid.times();
    let mut ys = Vec::with_capacity(times.len());
    ys.push(y0.to_vec());
    if times.len() == 1 {
        return Ok(Solution {
            ys,
            stats: SolverStats::default(),
        });
    }

    let span = times[times.len() - 1] - times[0];
    let mut stepper = Stepper::new(system, opts, times[0], y0, span)?;
    for &t_out in &times[1..] {
        let mut y = vec![0.0; dim];
        stepper.advance_to(t_out, &mut y)?;
        ys.push(y);
    }

    let stats = stepper.into_stats();
    log::debug!("{stats:?}");

    Ok(Solution { ys, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Decay;

    impl OdeSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = -y[0];
        }
    }

    /// Harmonic oscillator written as a first-order system.
    struct Oscillator;

    impl OdeSystem for Oscillator {
        fn dimension(&self) -> usize {
            2
        }

        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = y[1];
            dydt[1] = -y[0];
        }
    }

    /// Robertson's chemical kinetics problem, a classic stiff benchmark.
    struct Robertson;

    impl OdeSystem for Robertson {
        fn dimension(&self) -> usize {
            3
        }

        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = -0.04 * y[0] + 1e4 * y[1] * y[2];
            dydt[1] = 0.04 * y[0] - 1e4 * y[1] * y[2] - 3e7 * y[1] * y[1];
            dydt[2] = 3e7 * y[1] * y[1];
        }

        fn jacobian(&self, _t: f64, y: &[f64]) -> DMatrix<f64> {
            DMatrix::from_row_slice(
                3,
                3,
                &[
                    -0.04,
                    1e4 * y[2],
                    1e4 * y[1],
                    0.04,
                    -1e4 * y[2] - 6e7 * y[1],
                    -1e4 * y[1],
                    0.0,
                    6e7 * y[1],
                    0.0,
                ],
            )
        }
    }

    /// `y' = cos t`, so `y = sin t` from `y(0) = 0`.
    struct Forced;

    impl OdeSystem for Forced {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&self, t: f64, _y: &[f64], dydt: &mut [f64]) {
            dydt[0] = t.cos();
        }
    }

    /// `y0' = cos t`, `y1' = y0`, optionally with `t` carried as the first state.
    struct ForcedChain {
        autonomous: bool,
    }

    impl OdeSystem for ForcedChain {
        fn dimension(&self) -> usize {
            if self.autonomous { 3 } else { 2 }
        }

        fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) {
            if self.autonomous {
                dydt[0] = 1.0;
                dydt[1] = y[0].cos();
                dydt[2] = y[1];
            } else {
                dydt[0] = t.cos();
                dydt[1] = y[0];
            }
        }
    }

    /// `y' = -1e4 e^-t (y - sin t)`: stiff at first, then relaxes to a plain
    /// forced problem once the coupling has decayed.
    struct FadingStiffness;

    impl OdeSystem for FadingStiffness {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = -1e4 * (-t).exp() * (y[0] - t.sin());
        }

        fn jacobian(&self, t: f64, _y: &[f64]) -> DMatrix<f64> {
            DMatrix::from_element(1, 1, -1e4 * (-t).exp())
        }
    }

    /// `y' = y²` blows up at `t = 1/y0`.
    struct BlowUp;

    impl OdeSystem for BlowUp {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = y[0] * y[0];
        }
    }

    #[test]
    fn exponential_decay_is_accurate() {
        let grid = TimeGrid::linspace(0.0, 5.0, 11).unwrap();
        let sol = integrate(&Decay, &[1.0], &grid, &SolverOptions::default()).unwrap();

        assert_eq!(sol.ys.len(), 11);
        for (t, y) in grid.times().iter().zip(&sol.ys) {
            assert_relative_eq!(y[0], (-t).exp(), epsilon = 1e-7, max_relative = 1e-6);
        }
        assert_eq!(sol.stats.method_switches, 0);
    }

    #[test]
    fn oscillator_keeps_phase() {
        let grid = TimeGrid::linspace(0.0, 20.0, 41).unwrap();
        let sol = integrate(&Oscillator, &[1.0, 0.0], &grid, &SolverOptions::default()).unwrap();

        for (t, y) in grid.times().iter().zip(&sol.ys) {
            assert_relative_eq!(y[0], t.cos(), epsilon = 1e-6);
            assert_relative_eq!(y[1], -t.sin(), epsilon = 1e-6);
        }
    }

    #[test]
    fn stiff_problem_switches_to_bdf() {
        let grid = TimeGrid::new(vec![0.0, 0.4, 4.0, 40.0, 400.0, 4e3, 4e4]).unwrap();
        let opts = SolverOptions {
            rtol: 1e-6,
            atol: 1e-10,
            ..Default::default()
        };
        let sol = integrate(&Robertson, &[1.0, 0.0, 0.0], &grid, &opts).unwrap();

        assert!(sol.stats.method_switches >= 1);
        assert!(sol.stats.jac_evals > 0);

        let at_04 = &sol.ys[1];
        assert_relative_eq!(at_04[0], 0.98517, max_relative = 1e-4);
        assert_relative_eq!(at_04[1], 3.3864e-5, max_relative = 1e-3);

        let last = &sol.ys[6];
        assert_relative_eq!(last[0], 0.038985, max_relative = 1e-3);
        for y in &sol.ys {
            assert_relative_eq!(y.iter().sum::<f64>(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn blow_up_is_reported() {
        let grid = TimeGrid::new(vec![0.0, 0.5, 2.0]).unwrap();
        let err = integrate(&BlowUp, &[1.0], &grid, &SolverOptions::default()).unwrap_err();

        match err {
            SimError::NumericalFailure { t_reached, .. } => {
                assert!(t_reached > 0.5 && t_reached <= 1.0 + 1e-6, "t_reached = {t_reached}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn single_time_returns_initial_state() {
        let grid = TimeGrid::new(vec![3.0]).unwrap();
        let sol = integrate(&BlowUp, &[7.5], &grid, &SolverOptions::default()).unwrap();
        assert_eq!(sol.ys, vec![vec![7.5]]);
        assert_eq!(sol.stats, SolverStats::default());
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let grid = TimeGrid::new(vec![0.0, 1.0]).unwrap();
        let err = integrate(&Oscillator, &[1.0], &grid, &SolverOptions::default()).unwrap_err();
        assert!(matches!(err, SimError::Configuration(_)));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let bad = [
            SolverOptions {
                rtol: 0.0,
                ..Default::default()
            },
            SolverOptions {
                atol: f64::NAN,
                ..Default::default()
            },
            SolverOptions {
                max_steps: 0,
                ..Default::default()
            },
            SolverOptions {
                first_step: Some(-1.0),
                ..Default::default()
            },
            SolverOptions {
                max_order_bdf: 6,
                ..Default::default()
            },
            SolverOptions {
                max_order_adams: 0,
                ..Default::default()
            },
        ];
        for opts in bad {
            assert!(opts.validate().is_err(), "{opts:?} should be invalid");
        }
        assert!(SolverOptions::default().validate().is_ok());
    }

    #[test]
    fn step_budget_is_enforced() {
        let grid = TimeGrid::new(vec![0.0, 100.0]).unwrap();
        let opts = SolverOptions {
            max_steps: 5,
            ..Default::default()
        };
        let err = integrate(&Oscillator, &[1.0, 0.0], &grid, &opts).unwrap_err();
        assert!(matches!(err, SimError::NumericalFailure { .. }));
    }

    #[test]
    fn low_order_caps_still_converge() {
        let grid = TimeGrid::linspace(0.0, 2.0, 5).unwrap();
        let opts = SolverOptions {
            rtol: 1e-6,
            atol: 1e-9,
            max_steps: 5000,
            max_order_adams: 2,
            max_order_bdf: 1,
            ..Default::default()
        };
        let sol = integrate(&Decay, &[2.0], &grid, &opts).unwrap();
        assert_relative_eq!(sol.ys[4][0], 2.0 * (-2.0f64).exp(), max_relative = 1e-3);
    }

    #[test]
    fn forced_cosine_over_long_horizon() {
        let grid = TimeGrid::linspace(0.0, 200.0, 201).unwrap();
        let sol = integrate(&Forced, &[0.0], &grid, &SolverOptions::default()).unwrap();

        for (t, y) in grid.times().iter().zip(&sol.ys) {
            assert_relative_eq!(y[0], t.sin(), epsilon = 1e-6);
        }
    }

    #[test]
    fn forced_chain_over_long_horizon() {
        let grid = TimeGrid::linspace(0.0, 200.0, 201).unwrap();
        let opts = SolverOptions::default();

        let sol = integrate(&ForcedChain { autonomous: false }, &[0.0, 0.0], &grid, &opts).unwrap();
        for (t, y) in grid.times().iter().zip(&sol.ys) {
            assert_relative_eq!(y[0], t.sin(), epsilon = 1e-5);
            assert_relative_eq!(y[1], 1.0 - t.cos(), epsilon = 1e-5);
        }

        let system = ForcedChain { autonomous: true };
        let sol = integrate(&system, &[0.0, 0.0, 0.0], &grid, &opts).unwrap();
        for (t, y) in grid.times().iter().zip(&sol.ys) {
            assert_relative_eq!(y[0], *t, epsilon = 1e-5);
            assert_relative_eq!(y[1], t.sin(), epsilon = 1e-5);
            assert_relative_eq!(y[2], 1.0 - t.cos(), epsilon = 1e-5);
        }
    }

    #[test]
    fn stiffness_fading_returns_to_adams() {
        let grid = TimeGrid::linspace(0.0, 200.0, 201).unwrap();
        let sol = integrate(&FadingStiffness, &[0.0], &grid, &SolverOptions::default()).unwrap();

        assert!(
            sol.stats.method_switches >= 2,
            "switches = {}",
            sol.stats.method_switches
        );
        // While the coupling is strong the solution tracks sin t.
        for (t, y) in grid.times().iter().zip(&sol.ys).take(6) {
            assert_relative_eq!(y[0], t.sin(), epsilon = 1e-2);
        }
        assert_relative_eq!(sol.ys[1][0], 1.0f64.sin(), epsilon = 1e-3);
        // Reference from a fine fixed-step Runge-Kutta run.
        assert_relative_eq!(sol.ys[200][0], -0.045424188530602115, epsilon = 1e-6);
    }
}
