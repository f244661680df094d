use crate::config::Config;
use crate::sink::sink_for;
use crate::sweep::{SweepParam, sweep};
use crate::trajectory::{Trajectory, integrate};
use anyhow::{Context, Result};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

pub struct Manager {
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(config_file: P) -> Result<Self> {
        let cfg = Config::from_file(config_file).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { cfg })
    }

    /// Integrate the configured model and write the trajectory.
    pub fn run_trajectory<W: Write>(&self, writer: W) -> Result<()> {
        let traj = self.integrate()?;

        sink_for(&self.cfg.output, writer)
            .consume(&traj)
            .context("failed to write trajectory")?;

        Ok(())
    }

    /// Like [`Manager::run_trajectory`], writing to `file`.
    pub fn run_trajectory_to_file<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let writer = BufWriter::new(
            File::create(file).with_context(|| format!("failed to create {file:?}"))?,
        );

        self.run_trajectory(writer)?;
        log::info!("wrote {file:?}");

        Ok(())
    }

    /// Integrate the configured model and write its summary as JSON.
    pub fn write_summary<W: Write>(&self, mut writer: W) -> Result<()> {
        let summary = self.integrate()?.summary();
        log::info!(
            "peak of {} infected at t = {}",
            summary.peak_infected,
            summary.peak_time
        );

        serde_json::to_writer_pretty(&mut writer, &summary)
            .context("failed to serialize summary")?;
        writeln!(writer).context("failed to write summary")?;

        Ok(())
    }

    /// Run a parameter sweep and write one summary per value as JSON.
    pub fn run_sweep<W: Write>(
        &self,
        param: SweepParam,
        values: &[f64],
        mut writer: W,
    ) -> Result<()> {
        log::info!("sweeping {param:?} over {} values", values.len());

        let points = sweep(&self.cfg, param, values).context("failed to run sweep")?;

        serde_json::to_writer_pretty(&mut writer, &points)
            .context("failed to serialize sweep")?;
        writeln!(writer).context("failed to write sweep")?;

        Ok(())
    }

    fn integrate(&self) -> Result<Trajectory> {
        let grid = self.cfg.time_grid()?;
        let initial = self.cfg.init.initial_state(self.cfg.model.n_pop)?;

        log::info!(
            "integrating from t = {} to t = {} ({} samples)",
            grid.start(),
            grid.end(),
            grid.n_samples()
        );
        let traj = integrate(initial, &grid, &self.cfg.model, &self.cfg.solver)
            .context("failed to integrate model")?;
        log::info!("{:?}", traj.stats());

        Ok(traj)
    }
}
