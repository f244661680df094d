use crate::config::Config;
use crate::model::ModelParameters;
use crate::trajectory::{Summary, integrate};
use anyhow::{Context, Result};
use clap::ValueEnum;
use rayon::prelude::*;
use serde::Serialize;

/// Model parameter varied by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SweepParam {
    NPop,
    Beta,
    Gamma,
    Sigma,
    Mu,
}

impl SweepParam {
    /// Copy of `par` with this parameter set to `value`.
    pub fn apply(self, par: &ModelParameters, value: f64) -> ModelParameters {
        let mut par = *par;
        match self {
            SweepParam::NPop => par.n_pop = value,
            SweepParam::Beta => par.beta = value,
            SweepParam::Gamma => par.gamma = value,
            SweepParam::Sigma => par.sigma = value,
            SweepParam::Mu => par.mu = value,
        }
        par
    }
}

/// Outcome of one run of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    pub param: SweepParam,
    pub value: f64,
    pub summary: Summary,
}

/// Run one independent integration per value, in parallel.
///
/// Results keep the order of `values`. Every other setting is taken from `cfg`.
///
/// # Errors
/// Returns the first error encountered, with the offending value attached.
pub fn sweep(cfg: &Config, param: SweepParam, values: &[f64]) -> Result<Vec<SweepPoint>> {
    let grid = cfg.time_grid()?;

    values
        .par_iter()
        .map(|&value| {
            let par = param.apply(&cfg.model, value);
            let initial = cfg
                .init
                .initial_state(par.n_pop)
                .with_context(|| format!("invalid initial state with {param:?} = {value}"))?;

            let traj = integrate(initial, &grid, &par, &cfg.solver)
                .with_context(|| format!("failed to integrate with {param:?} = {value}"))?;
            log::debug!("finished run with {param:?} = {value}");

            Ok(SweepPoint {
                param,
                value,
                summary: traj.summary(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimError;

    fn config() -> Config {
        Config::from_toml(
            r#"
[model]
n_pop = 1000.0
beta = 0.5
gamma = 0.01
sigma = 0.4
mu = 0.2

[init]
n_inf = 1.0

[grid]
t_start = 0.0
t_end = 160.0
n_samples = 160
"#,
        )
        .unwrap()
    }

    #[test]
    fn apply_changes_one_parameter() {
        let par = config().model;
        let changed = SweepParam::Gamma.apply(&par, 0.3);
        assert_eq!(changed.gamma, 0.3);
        assert_eq!(changed.beta, par.beta);
        assert_eq!(SweepParam::NPop.apply(&par, 50.0).n_pop, 50.0);
    }

    #[test]
    fn results_keep_input_order() {
        let cfg = config();
        let values = [0.8, 0.2, 0.5];
        let points = sweep(&cfg, SweepParam::Beta, &values).unwrap();

        assert_eq!(points.len(), 3);
        for (point, value) in points.iter().zip(values) {
            assert_eq!(point.value, value);
        }
        assert!(points[0].summary.peak_infected > points[2].summary.peak_infected);
        assert!(points[2].summary.peak_infected > points[1].summary.peak_infected);
    }

    #[test]
    fn parallel_runs_match_sequential_runs() {
        let cfg = config();
        let points = sweep(&cfg, SweepParam::Mu, &[0.02, 0.2]).unwrap();
        for point in &points {
            let par = SweepParam::Mu.apply(&cfg.model, point.value);
            let initial = cfg.init.initial_state(par.n_pop).unwrap();
            let traj = integrate(initial, &cfg.time_grid().unwrap(), &par, &cfg.solver).unwrap();
            assert_eq!(point.summary, traj.summary());
        }
    }

    #[test]
    fn invalid_value_fails_the_sweep() {
        let cfg = config();
        let err = sweep(&cfg, SweepParam::Gamma, &[0.1, -1.0]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SimError>(),
            Some(SimError::Configuration(_))
        ));
    }

    #[test]
    fn population_below_initial_counts_fails() {
        let cfg = config();
        let err = sweep(&cfg, SweepParam::NPop, &[0.5]).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("NPop = 0.5"), "{message}");
        assert!(message.contains("exceed the total population"), "{message}");
    }
}
