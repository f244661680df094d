use crate::error::{SimError, SimResult};
use serde::Serialize;

/// Strictly increasing output times of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeGrid {
    times: Vec<f64>,
}

impl TimeGrid {
    /// Create a grid from explicit times.
    ///
    /// # Errors
    /// Returns [`SimError::Configuration`] if `times` is empty, contains a
    /// non-finite value, or is not strictly increasing.
    pub fn new(times: Vec<f64>) -> SimResult<Self> {
        if times.is_empty() {
            return Err(SimError::Configuration("time grid must not be empty".into()));
        }
        if let Some(idx) = times.iter().position(|t| !t.is_finite()) {
            return Err(SimError::Configuration(format!(
                "time grid point {idx} is not finite"
            )));
        }
        if let Some(idx) = times.windows(2).position(|w| w[1] <= w[0]) {
            return Err(SimError::Configuration(format!(
                "time grid must be strictly increasing, but t[{}] = {} follows t[{idx}] = {}",
                idx + 1,
                times[idx + 1],
                times[idx]
            )));
        }
        Ok(Self { times })
    }

    /// `n_samples` evenly spaced times from `t_start` to `t_end`, both included.
    pub fn linspace(t_start: f64, t_end: f64, n_samples: usize) -> SimResult<Self> {
        if n_samples == 0 {
            return Err(SimError::Configuration(
                "number of samples must be at least 1".into(),
            ));
        }
        if n_samples == 1 {
            return Self::new(vec![t_start]);
        }
        let step = (t_end - t_start) / (n_samples - 1) as f64;
        let mut times: Vec<f64> = (0..n_samples).map(|k| t_start + step * k as f64).collect();
        times[n_samples - 1] = t_end;
        Self::new(times)
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    pub fn start(&self) -> f64 {
        self.times[0]
    }

    pub fn end(&self) -> f64 {
        self.times[self.times.len() - 1]
    }
}
