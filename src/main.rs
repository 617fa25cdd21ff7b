// src/main.rs - drives the motion host against the software coprocessor
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use stepcore::{Config, MotionHost, SharedRegion};
use stepcore_simulator::{Simulator, SimulatorOptions};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Parser)]
#[command(name = "stepcore-host", version, about = "Look-ahead motion planner feeding a coprocessor ring")]
struct Args {
    /// Printer configuration (TOML). Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Moves to execute, one `x y z e feed [extruder]` line each; `M<code>` queues a command.
    #[arg(short, long)]
    moves: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Print the final status as JSON.
    #[arg(long)]
    json: bool,

    /// Write the executed record trace as CSV.
    #[arg(long)]
    trace_csv: Option<PathBuf>,
}

fn load(args: &Args) -> Result<Config, BoxError> {
    match &args.config {
        Some(path) => {
            let path = path.to_string_lossy();
            tracing::info!("Loading configuration from: {}", path);
            Ok(stepcore::config::load_config(&path)?)
        }
        None => {
            tracing::info!("No configuration given, using defaults");
            Ok(Config::default())
        }
    }
}

/// Feed a moves file into the host, returning how many lines were queued.
fn feed_moves(host: &MotionHost, path: &Path) -> Result<usize, BoxError> {
    let contents = std::fs::read_to_string(path)?;
    let mut queued = 0;
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let accepted = if let Some(code) = line.strip_prefix(['M', 'm']) {
            let code: u32 = code
                .trim()
                .parse()
                .map_err(|e| format!("line {}: bad command code: {}", number + 1, e))?;
            host.enqueue_command(code)?
        } else {
            let fields = line
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("line {}: {}", number + 1, e))?;
            let [x, y, z, e, feed, rest @ ..] = fields.as_slice() else {
                return Err(format!("line {}: expected `x y z e feed [extruder]`", number + 1).into());
            };
            let extruder = rest.first().map_or(0, |v| *v as u8);
            host.enqueue_move(*x, *y, *z, *e, *feed, extruder)?
        };
        if accepted {
            queued += 1;
        } else if host.status()?.stopped {
            tracing::warn!("Stopped at line {}", number + 1);
            break;
        }
    }
    Ok(queued)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    tracing::info!("Starting stepcore host {}", env!("CARGO_PKG_VERSION"));
    let config = load(&args).map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!(
        "Printer: {} ({:?})",
        config.printer.name.as_deref().unwrap_or("Unknown"),
        config.printer.kinematics
    );

    let region = Arc::new(SharedRegion::new(config.coprocessor.ring_slots));
    let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
    let simulator = Simulator::new(
        region.clone(),
        SimulatorOptions::from_config(&config).with_wake(wake_tx),
    )
    .spawn()?;
    let host = Arc::new(MotionHost::new(&config, region, Some(wake_rx))?);

    let stop = host.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping motion");
            if let Err(e) = stop.stop() {
                tracing::error!("Stop failed: {}", e);
            }
        }
    });

    host.start()?;
    if let Some(path) = args.moves.clone() {
        let feeder = host.clone();
        let queued = tokio::task::spawn_blocking(move || feed_moves(&feeder, &path)).await??;
        tracing::info!("Queued {} entries", queued);
    }

    let waiter = host.clone();
    let drained = tokio::task::spawn_blocking(move || waiter.sync()).await?;
    if !drained {
        tracing::warn!("Motion did not drain");
    }

    let status = host.status()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        tracing::info!(
            "Finished in {} at {:?} after {} records",
            status.run_state,
            status.position_mm,
            status.dispatched
        );
    }

    let closer = host.clone();
    tokio::task::spawn_blocking(move || closer.shutdown()).await??;

    if let Some(path) = &args.trace_csv {
        simulator.write_trace_csv(path)?;
        tracing::info!("Trace written to {}", path.display());
    }
    if let Some(finished) = simulator.join() {
        tracing::info!("Coprocessor executed {} records", finished.executed());
    }
    Ok(())
}
