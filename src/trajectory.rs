//! Integration of the SIRV model over a time grid.

use crate::error::SimResult;
use crate::grid::TimeGrid;
use crate::model::{ModelParameters, PopulationState, SirvModel};
use crate::solver::{self, SolverOptions, SolverStats};
use serde::Serialize;

/// Compartment values at every grid time, the first being the initial state.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    times: Vec<f64>,
    states: Vec<PopulationState>,
    n_pop: f64,
    stats: SolverStats,
}

/// The four compartments as parallel sequences aligned with the time axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompartmentSeries {
    pub t: Vec<f64>,
    pub s: Vec<f64>,
    pub i: Vec<f64>,
    pub r: Vec<f64>,
    pub v: Vec<f64>,
}

/// Key figures of a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    /// Largest number of infected individuals on the grid.
    pub peak_infected: f64,
    /// Grid time at which the peak occurs.
    pub peak_time: f64,
    pub final_state: PopulationState,
    /// Final state divided by the total population.
    pub final_fractions: PopulationState,
    /// Smallest compartment value on the grid.
    pub min_value: f64,
    /// Largest deviation of `S+I+R+V` from the total population.
    pub max_total_drift: f64,
    pub solver_stats: SolverStats,
}

/// Integrate the model from `initial` across `grid`.
///
/// # Errors
/// Returns a configuration error for invalid parameters or options and a
/// numerical failure if the integrator cannot reach the end of the grid.
pub fn integrate(
    initial: PopulationState,
    grid: &TimeGrid,
    par: &ModelParameters,
    opts: &SolverOptions,
) -> SimResult<Trajectory> {
    par.validate()?;
    let model = SirvModel::new(*par);
    let solution = solver::integrate(&model, &initial.to_array(), grid, opts)?;

    let states = solution
        .ys
        .iter()
        .map(|y| PopulationState::from_slice(y))
        .collect();

    Ok(Trajectory {
        times: grid.times().to_vec(),
        states,
        n_pop: model.params().n_pop,
        stats: solution.stats,
    })
}

impl Trajectory {
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> &[PopulationState] {
        &self.states
    }

    pub fn stats(&self) -> &SolverStats {
        &self.stats
    }

    pub fn final_state(&self) -> PopulationState {
        self.states[self.states.len() - 1]
    }

    pub fn series(&self) -> CompartmentSeries {
        CompartmentSeries {
            t: self.times.clone(),
            s: self.states.iter().map(|x| x.s).collect(),
            i: self.states.iter().map(|x| x.i).collect(),
            r: self.states.iter().map(|x| x.r).collect(),
            v: self.states.iter().map(|x| x.v).collect(),
        }
    }

    pub fn summary(&self) -> Summary {
        let (i_peak, peak) = self
            .states
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (idx, x)| {
                if x.i > acc.1 { (idx, x.i) } else { acc }
            });

        let final_state = self.final_state();
        let final_fractions = PopulationState::new(
            final_state.s / self.n_pop,
            final_state.i / self.n_pop,
            final_state.r / self.n_pop,
            final_state.v / self.n_pop,
        );

        let min_value = self
            .states
            .iter()
            .map(PopulationState::min)
            .fold(f64::INFINITY, f64::min);
        let max_total_drift = self
            .states
            .iter()
            .map(|x| (x.total() - self.n_pop).abs())
            .fold(0.0, f64::max);

        Summary {
            peak_infected: peak,
            peak_time: self.times[i_peak],
            final_state,
            final_fractions,
            min_value,
            max_total_drift,
            solver_stats: self.stats.clone(),
        }
    }
}
