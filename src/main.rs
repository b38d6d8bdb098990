use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use matroschka_prober::{Manager, RawConfig, Snapshot};

#[derive(Parser)]
#[command(name = "matroschka-prober", about = "Active network-path measurement via nested GRE tunnel probes")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "MATROSCHKA_CONFIG")]
    config: PathBuf,

    /// How often to log a metrics snapshot, in seconds.
    #[arg(long, default_value_t = 10)]
    snapshot_interval_secs: u64,
}

fn main() -> Result<()> {
    matroschka_prober::logging::init();

    let cli = Cli::parse();
    let raw = load_config(&cli.config)?;
    let compiled = raw.compile().context("configuration is invalid")?;

    let manager = Manager::new(raw.udp_base_port);
    manager.reconcile(compiled).context("failed to start worker pools")?;

    tracing::info!(
        targets = manager.total_targets(),
        "matroschka-prober running"
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("failed to install signal handler")?;
    }

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs(cli.snapshot_interval_secs));

        let snapshot = Snapshot::collect(&manager, wall_clock_ns());
        for (target, metrics) in snapshot.latest_per_target() {
            tracing::info!(
                path = %target.path,
                tos = %target.tos.name,
                sent = metrics.stats.sent,
                received = metrics.stats.received,
                loss = metrics.stats.loss(),
                late = metrics.stats.late,
                timed_out = metrics.stats.timed_out,
                rtt_min_ns = metrics.stats.rtt_min_ns,
                rtt_avg_ns = metrics.stats.rtt_avg_ns(),
                rtt_max_ns = metrics.stats.rtt_max_ns,
                "measurement snapshot"
            );
        }
    }

    tracing::info!("shutting down");
    Ok(())
}

fn wall_clock_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn load_config(path: &std::path::Path) -> Result<RawConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;

    toml::from_str(&contents)
        .with_context(|| format!("failed to parse configuration file {}", path.display()))
}
