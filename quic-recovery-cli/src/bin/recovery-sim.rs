//! Recovery simulator - bulk transfer over a simulated lossy path
//!
//! Runs a sender and a receiver engine against each other and prints loss
//! recovery, flow control and link statistics.

use clap::Parser;
use quic_recovery::tracer::LogTracer;
use quic_recovery_cli::{display_report, CongestionKind, SimConfig, Simulation};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "recovery-sim")]
#[command(about = "QUIC loss recovery and flow control simulator", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    write_example: Option<PathBuf>,

    /// Bytes to transfer
    #[arg(short = 'n', long)]
    bytes: Option<u64>,

    /// One-way delay in milliseconds
    #[arg(short, long)]
    delay: Option<u64>,

    /// Jitter in milliseconds
    #[arg(short, long)]
    jitter: Option<u64>,

    /// Datagram loss probability (0.0 to 1.0)
    #[arg(short, long)]
    loss: Option<f64>,

    /// Bottleneck bandwidth in kbit/s
    #[arg(short, long)]
    bandwidth: Option<u64>,

    /// Congestion control (newreno, cubic)
    #[arg(long)]
    congestion: Option<String>,

    /// Disable pacing
    #[arg(long)]
    no_pacing: bool,

    /// Random seed of the link
    #[arg(long)]
    seed: Option<u64>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log every recovery event of the sender
    #[arg(short, long)]
    verbose: bool,
}

fn parse_congestion(name: &str) -> anyhow::Result<CongestionKind> {
    match name {
        "newreno" | "reno" => Ok(CongestionKind::NewReno),
        "cubic" => Ok(CongestionKind::Cubic),
        other => anyhow::bail!("unknown congestion control '{}'", other),
    }
}

fn apply_overrides(config: &mut SimConfig, args: &Args) -> anyhow::Result<()> {
    if let Some(bytes) = args.bytes {
        config.transfer_size = bytes;
    }
    if let Some(delay) = args.delay {
        config.link.delay_ms = delay;
    }
    if let Some(jitter) = args.jitter {
        config.link.jitter_ms = jitter;
    }
    if let Some(loss) = args.loss {
        config.link.loss_rate = loss;
    }
    if let Some(bandwidth) = args.bandwidth {
        config.link.bandwidth_kbps = bandwidth;
    }
    if let Some(seed) = args.seed {
        config.link.seed = seed;
    }
    if let Some(name) = &args.congestion {
        config.recovery.congestion = parse_congestion(name)?;
    }
    if args.no_pacing {
        config.recovery.pacing = false;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if args.verbose { "trace" } else { args.log_level.as_str() };
        EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(path) = &args.write_example {
        SimConfig::example().to_file(path)?;
        tracing::info!("Wrote example configuration to {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => SimConfig::from_file(path)?,
        None => SimConfig::default(),
    };
    apply_overrides(&mut config, &args)?;

    let mut simulation = Simulation::new(config)?;
    if args.verbose {
        simulation = simulation.with_tracer(Arc::new(LogTracer));
    }

    let report = simulation.run()?;
    display_report(&report);
    Ok(())
}
