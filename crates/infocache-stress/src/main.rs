use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use infocache::Config;
use infocache::logging::ensure_log_error;

use crate::workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Run all logs through the JSON formatter, discarding the output.
    #[arg(long)]
    tracing: bool,

    /// Send metrics to a local statsd sink that discards them.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;
    workloads.validate()?;

    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    // SAFETY: no runtime has been started yet, so this is still single-threaded.
    let mut guard = unsafe {
        logging::init(
            logging::Config {
                tracing: cli.tracing,
                metrics: cli.metrics,
            },
            &config,
        )?
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("infocache-stress")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        if let Some(udp_sink) = guard.udp_sink.take() {
            tokio::spawn(udp_sink);
        }
        stresstest::perform_stresstest(config, workloads, cli.duration).await
    })
}
