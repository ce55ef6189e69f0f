// drift-sim: runs rebalancing scenarios against a scheduler.

use std::fs::OpenOptions;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use drift_analyzer::{append_result_line, result_line};
use drift_sched::scheduler::EmbeddedScheduler;
use drift_sim::{scenario, Driver, RunOutcome, SimConfig};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "drift-sim", about = "Scenario simulator for region rebalancing schedulers")]
struct Args {
    /// Scheduler address. Empty runs the embedded scheduler.
    #[arg(long, env = "DRIFT_SIM_PD", default_value = "")]
    pd: String,

    /// Simulator config file (TOML). Defaults apply when omitted.
    #[arg(long, env = "DRIFT_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Scenario to run. Empty runs the whole catalog.
    #[arg(long = "case", env = "DRIFT_SIM_CASE", default_value = "")]
    case: String,

    /// Log level of the simulator.
    #[arg(long = "simLog", env = "DRIFT_SIM_LOG", value_enum, default_value = "info")]
    sim_log: LogLevel,

    /// Log level of the scheduler.
    #[arg(long = "serverLog", env = "DRIFT_SIM_SERVER_LOG", value_enum, default_value = "warn")]
    server_log: LogLevel,

    /// Overrides `tick_interval` from the config file.
    #[arg(long, env = "DRIFT_SIM_TICK_INTERVAL")]
    tick_interval: Option<humantime::Duration>,

    /// Overrides `max_ticks` from the config file.
    #[arg(long, env = "DRIFT_SIM_MAX_TICKS")]
    max_ticks: Option<u64>,

    /// Append one JSON line per scenario to this file.
    #[arg(long, env = "DRIFT_SIM_REPORT")]
    report: Option<PathBuf>,

    /// Append the transfer analysis CSV line to this file.
    #[arg(long, env = "DRIFT_SIM_RESULT")]
    result: Option<PathBuf>,
}

fn init_tracing(args: &Args) {
    let ansi = io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let sim = args.sim_log.directive();
    let server = args.server_log.directive();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("warn,drift_sim={sim},drift_analyzer={sim},drift_sched={server}").into()
            }),
        )
        .init();
}

fn append_report(path: &Path, outcome: &RunOutcome) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open report {}", path.display()))?;
    let line = serde_json::to_string(&outcome.report())?;
    writeln!(file, "{line}")?;
    Ok(())
}

async fn run_case(
    name: &str,
    cfg: &SimConfig,
    args: &Args,
    cancel: &CancellationToken,
) -> anyhow::Result<bool> {
    let scenario = scenario::build(name, cfg)?;
    let connector = Arc::new(EmbeddedScheduler::new(cfg.scheduler.clone()));
    let mut driver = Driver::new(scenario, cfg, connector)?;
    driver
        .prepare()
        .await
        .with_context(|| format!("prepare scenario {name}"))?;
    let outcome = driver.run(cancel).await;
    driver.stop().await;
    let outcome = outcome.with_context(|| format!("run scenario {name}"))?;

    println!("{outcome}");
    println!("{}", outcome.stats);
    if let Some(summary) = &outcome.transfers {
        summary
            .write_report(&mut io::stdout().lock())
            .context("write transfer report")?;
        if let Some(path) = &args.result {
            let line = result_line(outcome.store_num, outcome.region_num, summary);
            append_result_line(path, &line)
                .with_context(|| format!("append result to {}", path.display()))?;
        }
    }
    if let Some(path) = &args.report {
        append_report(path, &outcome)?;
    }
    Ok(outcome.passed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    if !args.pd.is_empty() {
        anyhow::bail!(
            "no scheduler transport is built in; leave --pd empty to use the embedded scheduler (got {})",
            args.pd
        );
    }

    let mut cfg = SimConfig::load(args.config.as_deref())?;
    if let Some(interval) = args.tick_interval {
        cfg.tick_interval = interval.into();
    }
    if let Some(max_ticks) = args.max_ticks {
        cfg.max_ticks = max_ticks;
    }

    let cases: Vec<String> = if args.case.is_empty() {
        scenario::names().map(str::to_string).collect()
    } else {
        vec![args.case.clone()]
    };

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received");
            signal.cancel();
        }
    });

    let mut failed = 0;
    for case in &cases {
        if cancel.is_cancelled() {
            break;
        }
        match run_case(case, &cfg, &args, &cancel).await {
            Ok(true) => {}
            Ok(false) => failed += 1,
            Err(err) => {
                tracing::error!(case = %case, error = ?err, "scenario aborted");
                failed += 1;
            }
        }
    }

    if failed > 0 || cancel.is_cancelled() {
        tracing::error!(failed, total = cases.len(), "simulation failed");
        std::process::exit(1);
    }
    Ok(())
}
