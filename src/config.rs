use crate::grid::TimeGrid;
use crate::model::{ModelParameters, PopulationState};
use crate::solver::SolverOptions;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Model parameters.
    pub model: ModelParameters,
    /// Initial condition.
    pub init: InitConfig,
    /// Output time grid.
    pub grid: GridConfig,
    /// Integrator settings.
    #[serde(default)]
    pub solver: SolverOptions,
    /// Output settings.
    #[serde(default)]
    pub output: OutputConfig,
}

/// Initial compartment sizes. Everyone else starts susceptible.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitConfig {
    /// Initial number of infected individuals.
    pub n_inf: f64,
    /// Initial number of recovered individuals.
    #[serde(default)]
    pub n_rec: f64,
    /// Initial number of vaccinated individuals.
    #[serde(default)]
    pub n_vac: f64,
}

/// Uniform output grid.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridConfig {
    pub t_start: f64,
    pub t_end: f64,
    /// Number of grid points, both ends included.
    pub n_samples: usize,
}

/// How trajectories are written.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Compartment values are divided by this before writing.
    pub scale: f64,
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            scale: 1.0,
            format: OutputFormat::Csv,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Json,
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a [`Config`] from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.model.validate().context("invalid model parameters")?;

        self.init
            .initial_state(self.model.n_pop)
            .context("invalid initial condition")?;

        check_num(self.grid.n_samples, 1..=10_000_000).context("invalid number of samples")?;
        self.time_grid().context("invalid time grid")?;

        self.solver.validate().context("invalid solver options")?;

        if !self.output.scale.is_finite() || self.output.scale <= 0.0 {
            bail!("output scale must be finite and > 0, but is {}", self.output.scale);
        }

        Ok(())
    }

    /// Time grid described by the `[grid]` section.
    pub fn time_grid(&self) -> Result<TimeGrid> {
        let grid = TimeGrid::linspace(self.grid.t_start, self.grid.t_end, self.grid.n_samples)?;
        Ok(grid)
    }
}

impl InitConfig {
    /// Initial state for a total population of `n_pop`.
    ///
    /// # Errors
    /// Returns an error if a count is negative or non-finite, or if the
    /// counts leave a negative number of susceptible individuals.
    pub fn initial_state(&self, n_pop: f64) -> Result<PopulationState> {
        check_count(self.n_inf).context("invalid initial number of infected")?;
        check_count(self.n_rec).context("invalid initial number of recovered")?;
        check_count(self.n_vac).context("invalid initial number of vaccinated")?;

        let n_sus = n_pop - self.n_inf - self.n_rec - self.n_vac;
        if n_sus < 0.0 {
            bail!("initial counts exceed the total population {n_pop}");
        }

        Ok(PopulationState::new(n_sus, self.n_inf, self.n_rec, self.n_vac))
    }
}

fn check_count(num: f64) -> Result<()> {
    if !num.is_finite() {
        bail!("number must be finite, but is {num}");
    }
    check_num(num, 0.0..)
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}
