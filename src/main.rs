use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sirv::manager::Manager;
use sirv::sweep::SweepParam;
use std::{io, path::PathBuf};

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the trajectory to stdout or to a file.
    Run {
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Write summary figures of the trajectory as JSON.
    Summary,

    /// Repeat the run for several values of one parameter.
    Sweep {
        #[arg(long, value_enum)]
        param: SweepParam,

        #[arg(long, value_delimiter = ',', required = true)]
        values: Vec<f64>,
    },
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.config).context("failed to construct mgr")?;

    match args.command {
        Command::Run { output: Some(file) } => mgr.run_trajectory_to_file(file)?,
        Command::Run { output: None } => mgr.run_trajectory(io::stdout().lock())?,
        Command::Summary => mgr.write_summary(io::stdout().lock())?,
        Command::Sweep { param, values } => {
            mgr.run_sweep(param, &values, io::stdout().lock())?
        }
    }

    Ok(())
}
