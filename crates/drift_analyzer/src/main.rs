// drift-analyzer: measures redundant peer movement in an operator log.

use std::fs::File;
use std::io::{self, BufReader, IsTerminal};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use drift_analyzer::{append_result_line, result_line, LogIngester, Operator, TimeWindow, TransferCounter};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Style {
    TransferCounter,
}

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
            // tracing has no level above error.
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "drift-analyzer", about = "Redundant transfer analysis for scheduler logs")]
struct Args {
    /// Operator log to read.
    #[arg(long, env = "DRIFT_ANALYZER_INPUT")]
    input: PathBuf,

    /// File the `storeNum,regionNum,redundant,necessary` line is appended to.
    /// Printed to stdout when omitted.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Analysis style.
    #[arg(long, value_enum)]
    style: Style,

    /// Operator kind whose finished moves are counted.
    #[arg(long, value_enum)]
    operator: Operator,

    /// Inclusive lower time bound, `YYYY/MM/DD HH:MM:SS`. Empty means open.
    #[arg(long, default_value = "")]
    start: String,

    /// Exclusive upper time bound, `YYYY/MM/DD HH:MM:SS`. Empty means open.
    #[arg(long, default_value = "")]
    end: String,

    /// Log level; overridden by RUST_LOG when set.
    #[arg(long = "logLevel", value_enum, default_value = "info")]
    log_level: LogLevel,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let ansi = io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.directive().into()),
        )
        .init();

    let Style::TransferCounter = args.style;
    let window = TimeWindow::parse(&args.start, &args.end)?;
    let ingester = LogIngester::new(args.operator, window)?;

    let file = File::open(&args.input)
        .with_context(|| format!("open input log {}", args.input.display()))?;
    let counter = TransferCounter::new();
    let ingested = ingester
        .ingest(BufReader::new(file), &counter)
        .with_context(|| format!("ingest {}", args.input.display()))?;
    if counter.pending() > 0 {
        tracing::warn!(pending = counter.pending(), "staged moves without a source");
    }

    let summary = counter
        .print_result(&mut io::stdout().lock())
        .context("write report")?;
    let line = result_line(summary.stores.len(), summary.region_count, &summary);
    match &args.output {
        Some(path) => append_result_line(path, &line)
            .with_context(|| format!("append result to {}", path.display()))?,
        None => print!("{line}"),
    }
    tracing::info!(
        moves = ingested.moves,
        redundant = summary.redundant,
        necessary = summary.necessary,
        "analysis complete"
    );
    Ok(())
}
