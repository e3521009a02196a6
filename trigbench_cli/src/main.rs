use trigbench_core::benchmark::{BenchmarkError, BenchmarkReport};
use trigbench_core::config::{ConfigError, TrigbenchConfig};
use trigbench_core::oracle::target_outcome;
use trigbench_core::program::RunMode;
use trigbench_core::session::{Session, SessionError};
use trigbench_core::trigger::RunResult;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Success,
    Fail,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Success => RunMode::Success,
            ModeArg::Fail => RunMode::Fail,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Debug logging (overridden by RUST_LOG).
    #[clap(short, long)]
    verbose: bool,
    /// Repeat each run under the benchmark policy instead of running it once.
    #[clap(long)]
    benchmark: bool,
    /// Print one JSON object per program instead of a summary line.
    #[clap(long)]
    json: bool,
    #[clap(value_enum)]
    mode: ModeArg,
    /// Program names from the configuration, or `all`.
    #[clap(required = true)]
    programs: Vec<String>,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "trigbench=debug" } else { "trigbench=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<TrigbenchConfig, ConfigError> {
    match path {
        Some(path) => {
            info!("Loading configuration from {path:?}");
            TrigbenchConfig::load_from_file(path)
        }
        None => {
            let default_path = PathBuf::from("config.toml");
            if default_path.exists() {
                info!("No config file specified, loading default {default_path:?}");
                TrigbenchConfig::load_from_file(&default_path)
            } else {
                warn!("No config file specified and 'config.toml' not found, using built-in defaults");
                Ok(TrigbenchConfig::default())
            }
        }
    }
}

fn print_result(result: &RunResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(result).context("Failed to serialize run result")?);
        return Ok(());
    }
    let status = match result.status {
        Some(status) => status.to_string(),
        None => "no exit status".to_string(),
    };
    println!(
        "{} [{}] {}: {} in {:.3}s, coredump: {}",
        result.program,
        result.mode,
        result.outcome,
        status,
        result.duration.as_secs_f64(),
        if result.coredump { "yes" } else { "no" }
    );
    if let Some(infra) = &result.infra {
        println!("  cause: {infra}");
    }
    for cleanup in &result.cleanup_errors {
        println!("  cleanup: {cleanup}");
    }
    Ok(())
}

fn print_report(report: &BenchmarkReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(report).context("Failed to serialize benchmark report")?);
        return Ok(());
    }
    println!(
        "{} [{}] {:?}: {} attempts, {} collected, {} discarded, {} kept",
        report.program,
        report.mode,
        report.termination,
        report.attempts,
        report.collected,
        report.discarded,
        report.kept.len()
    );
    if let Some(stats) = &report.statistics {
        println!(
            "  mean {:.6}s  median {:.6}s  stdev {:.6}s  min {:.6}s  max {:.6}s",
            stats.mean, stats.median, stats.stdev, stats.min, stats.max
        );
    }
    Ok(())
}

/// Returns whether every program reached its mode's target outcome.
fn run(cli: &Cli) -> anyhow::Result<bool> {
    let config = load_config(cli.config_file.as_ref())?;
    let runtime = config.validate()?;
    let mut session = Session::from_config(runtime)?;
    let mode = RunMode::from(cli.mode);

    let names: Vec<String> = if cli.programs.iter().any(|p| p == "all") {
        session.programs().map(|p| p.name.clone()).collect()
    } else {
        cli.programs.clone()
    };
    if names.is_empty() {
        warn!("No programs configured");
    }

    let mut all_ok = true;
    for name in &names {
        if cli.benchmark {
            match session.benchmark(name, mode) {
                Ok(report) => print_report(&report, cli.json)?,
                Err(SessionError::Benchmark(BenchmarkError::Exhausted(report))) => {
                    print_report(&report, cli.json)?;
                    all_ok = false;
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            let result = session.trigger(name, mode)?;
            print_result(&result, cli.json)?;
            all_ok &= result.outcome == target_outcome(mode);
        }
    }
    Ok(all_ok)
}

fn is_config_error(e: &anyhow::Error) -> bool {
    e.downcast_ref::<ConfigError>().is_some()
        || matches!(
            e.downcast_ref::<SessionError>(),
            Some(SessionError::Config(_) | SessionError::UnknownProgram(_))
        )
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{e:#}");
            if is_config_error(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
