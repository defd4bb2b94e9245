use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use cacheable::config::Config;

use crate::stresstest::perform_stresstest;
use crate::workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
#[command(about = "Drives memoized call sites with synthetic workloads")]
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

    /// Enable `sentry` reporting, using the DSN from the configuration file.
    #[arg(long)]
    sentry: bool,

    /// Enable `tracing` with a JSON formatter discarding its output.
    #[arg(long)]
    tracing: bool,

    /// Enable `metrics` reporting to a local sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = run() {
        cacheable::logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    let reporting = logging::Config {
        sentry: cli.sentry.then(|| config.sentry_dsn.clone()).flatten(),
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: the runtime and its worker threads are only started below.
    let mut logging_guard = unsafe { logging::init(reporting, &config) }?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    if let Some(udp_sink) = logging_guard.udp_sink.take() {
        runtime.spawn(udp_sink);
    }

    runtime.block_on(perform_stresstest(config, workloads, cli.duration))
}
