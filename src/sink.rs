use crate::config::{OutputConfig, OutputFormat};
use crate::trajectory::{CompartmentSeries, Trajectory};
use anyhow::{Context, Result};
use std::io::Write;

/// Destination of a computed trajectory.
pub trait TrajectorySink {
    fn consume(&mut self, traj: &Trajectory) -> Result<()>;
}

/// Writes one `t,S,I,R,V` line per grid time after a header line.
pub struct CsvSink<W: Write> {
    writer: W,
    scale: f64,
}

/// Writes the trajectory as a JSON object of parallel arrays.
pub struct JsonSink<W: Write> {
    writer: W,
    scale: f64,
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W, scale: f64) -> Self {
        Self { writer, scale }
    }
}

impl<W: Write> JsonSink<W> {
    pub fn new(writer: W, scale: f64) -> Self {
        Self { writer, scale }
    }
}

impl<W: Write> TrajectorySink for CsvSink<W> {
    fn consume(&mut self, traj: &Trajectory) -> Result<()> {
        writeln!(self.writer, "t,S,I,R,V").context("failed to write header")?;
        for (t, x) in traj.times().iter().zip(traj.states()) {
            writeln!(
                self.writer,
                "{t},{},{},{},{}",
                x.s / self.scale,
                x.i / self.scale,
                x.r / self.scale,
                x.v / self.scale
            )
            .with_context(|| format!("failed to write row at t = {t}"))?;
        }
        self.writer.flush().context("failed to flush writer")?;
        Ok(())
    }
}

impl<W: Write> TrajectorySink for JsonSink<W> {
    fn consume(&mut self, traj: &Trajectory) -> Result<()> {
        let series = scaled(traj.series(), self.scale);
        serde_json::to_writer_pretty(&mut self.writer, &series)
            .context("failed to serialize trajectory")?;
        writeln!(self.writer).context("failed to write trailing newline")?;
        self.writer.flush().context("failed to flush writer")?;
        Ok(())
    }
}

/// Sink matching the configured output format.
pub fn sink_for<'a, W: Write + 'a>(
    output: &OutputConfig,
    writer: W,
) -> Box<dyn TrajectorySink + 'a> {
    match output.format {
        OutputFormat::Csv => Box::new(CsvSink::new(writer, output.scale)),
        OutputFormat::Json => Box::new(JsonSink::new(writer, output.scale)),
    }
}

fn scaled(mut series: CompartmentSeries, scale: f64) -> CompartmentSeries {
    for field in [&mut series.s, &mut series.i, &mut series.r, &mut series.v] {
        field.iter_mut().for_each(|x| *x /= scale);
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::TimeGrid;
    use crate::model::{ModelParameters, PopulationState};
    use crate::solver::SolverOptions;
    use crate::trajectory::integrate;

    fn trajectory() -> Trajectory {
        let par = ModelParameters::new(1000.0, 0.5, 0.01, 0.4, 0.2).unwrap();
        let grid = TimeGrid::linspace(0.0, 10.0, 11).unwrap();
        let initial = PopulationState::new(999.0, 1.0, 0.0, 0.0);
        integrate(initial, &grid, &par, &SolverOptions::default()).unwrap()
    }

    #[test]
    fn csv_has_header_and_one_row_per_time() {
        let traj = trajectory();
        let mut buf = Vec::new();
        CsvSink::new(&mut buf, 1000.0).consume(&traj).unwrap();

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 12);
        assert_eq!(lines[0], "t,S,I,R,V");
        assert_eq!(lines[1], "0,0.999,0.001,0,0");
        assert!(lines.iter().skip(1).all(|l| l.split(',').count() == 5));
    }

    #[test]
    fn json_holds_scaled_series() {
        let traj = trajectory();
        let mut buf = Vec::new();
        JsonSink::new(&mut buf, 1000.0).consume(&traj).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["t"].as_array().unwrap().len(), 11);
        assert_eq!(value["s"][0].as_f64().unwrap(), 0.999);
        assert_eq!(value["i"][0].as_f64().unwrap(), 0.001);
        let last = traj.final_state();
        assert_eq!(value["v"][10].as_f64().unwrap(), last.v / 1000.0);
    }

    #[test]
    fn sink_follows_output_format() {
        let traj = trajectory();
        let output = OutputConfig {
            scale: 1.0,
            format: OutputFormat::Json,
        };
        let mut buf = Vec::new();
        sink_for(&output, &mut buf).consume(&traj).unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&buf).is_ok());
    }
}
