use anyhow::{anyhow, Context};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use marketdata_collector::config::{Defaults, Preset, SinkSelection};
use marketdata_collector::supervisor::Supervisor;

/// Market-data collector: one preset per process.
#[derive(Debug, Parser)]
#[command(name = "marketdata-collector", version, about)]
struct Args {
    /// Preset identifier (agg, tape, book, book20, mark, klines, metrics)
    #[arg(long)]
    preset: String,

    /// Sink selection
    #[arg(long, value_enum, default_value_t = SinkArg::Both)]
    sinks: SinkArg,

    /// Instruments to subscribe, comma separated (e.g. BTCUSDT,ETHUSDT)
    #[arg(long, value_delimiter = ',', required = true)]
    symbols: Vec<String>,

    /// CPU core index to pin this process to
    #[arg(long)]
    core: Option<usize>,

    /// Override the preset's reporting interval in seconds
    #[arg(long)]
    log_interval_s: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkArg {
    Columnar,
    Cache,
    Both,
}

impl From<SinkArg> for SinkSelection {
    fn from(arg: SinkArg) -> Self {
        match arg {
            SinkArg::Columnar => SinkSelection::Columnar,
            SinkArg::Cache => SinkSelection::Cache,
            SinkArg::Both => SinkSelection::Both,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let defaults = Defaults::from_env().context("loading defaults")?;
    let mut preset = Preset::builtin(&args.preset).ok_or_else(|| {
        anyhow!(
            "unknown preset: {} (available: {})",
            args.preset,
            Preset::builtin_ids().join(", ")
        )
    })?;
    if let Some(interval) = args.log_interval_s {
        preset.log_interval_s = interval;
    }

    let mut symbols: Vec<String> = args
        .symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    symbols.sort();
    symbols.dedup();

    let supervisor = Supervisor {
        defaults,
        preset,
        sinks: args.sinks.into(),
        symbols,
        cpu_core: args.core,
    };
    supervisor.run().await?;
    Ok(())
}
