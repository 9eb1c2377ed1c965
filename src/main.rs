//! TTSAM Realtime - earthquake shaking-intensity forecaster.
//!
//! # Usage
//!
//! ```bash
//! # Production: waveforms and picks over TCP from the transport bridge
//! ttsam --wave-tcp wavehost:6000 --pick-tcp pickhost:6001
//!
//! # Simulation: waveforms from stdin, picks over TCP
//! python wave_simulator.py | ttsam --stdin-wave --pick-tcp localhost:6001
//! ```
//!
//! # Environment Variables
//!
//! - `TTSAM_WINDOW_SECONDS`, `TTSAM_N_STATIONS_MAX`, `TTSAM_TICK_INTERVAL`,
//!   `TTSAM_ALARM_MIN_INTENSITY`, `TTSAM_INTENSITY_CUTOFF`: pipeline tuning
//! - `RUST_LOG`: logging level (default: info)
//!
//! # Exit codes
//!
//! 0 clean shutdown, 1 catalog load failure, 2 predictor initialization
//! failure, 3 unrecoverable transport error.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ttsam_realtime::bus::{self, LogPublisher};
use ttsam_realtime::config::{self, defaults, Config};
use ttsam_realtime::dispatch::InferenceDispatcher;
use ttsam_realtime::ingest::{
    PickSource, StdinPickSource, StdinWaveSource, TcpPickSource, TcpWaveSource, WaveSource,
};
use ttsam_realtime::picks::{PickAggregator, TickQueue};
use ttsam_realtime::pipeline::{PickLoop, WaveIngestLoop};
use ttsam_realtime::predict::{NullPredictor, PredictError, Predictor};
use ttsam_realtime::report::PickLog;
use ttsam_realtime::{Catalogs, TensorAssembler, WaveBuffer};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "ttsam")]
#[command(about = "Real-time earthquake shaking-intensity forecaster")]
#[command(version)]
struct CliArgs {
    /// Waveform transport address (JSON packet per line over TCP)
    #[arg(long, value_name = "HOST:PORT")]
    wave_tcp: Option<String>,

    /// Pick transport address (picker text lines over TCP)
    #[arg(long, value_name = "HOST:PORT")]
    pick_tcp: Option<String>,

    /// Read waveform packets from stdin instead of TCP
    #[arg(long)]
    stdin_wave: bool,

    /// Read pick lines from stdin instead of TCP
    #[arg(long)]
    stdin_pick: bool,

    /// Directory holding site_info.csv, eew_target.csv, vs30_grid.csv
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory for report and pick logs
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

fn parse_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid address {addr:?}, expected HOST:PORT"))?;
    Ok((host.to_string(), port.parse()?))
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    WaveIngest,
    PickLoop,
    Dispatcher,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::WaveIngest => write!(f, "WaveIngest"),
            TaskName::PickLoop => write!(f, "PickLoop"),
            TaskName::Dispatcher => write!(f, "Dispatcher"),
        }
    }
}

// ============================================================================
// Predictor wiring
// ============================================================================

/// Construct the trained network handle.
///
/// The weights are an external artifact wired in by the deployment; this
/// build runs the pipeline against the quiet stand-in and says so loudly.
fn build_predictor() -> Result<Box<dyn Predictor>, PredictError> {
    warn!("no trained network attached - reports will carry floor intensities");
    Ok(Box::new(NullPredictor))
}

// ============================================================================
// Pipeline assembly
// ============================================================================

/// Run the full pipeline with the chosen sources until shutdown.
async fn run_pipeline<W, P>(
    mut wave_source: W,
    mut pick_source: P,
    catalogs: Arc<Catalogs>,
    predictor: Box<dyn Predictor>,
    log_dir: PathBuf,
    cancel: CancellationToken,
) -> Result<()>
where
    W: WaveSource,
    P: PickSource,
{
    let cfg = config::get();

    let wave_buffer = Arc::new(WaveBuffer::new(cfg));
    let tick_queue = Arc::new(TickQueue::new(defaults::TICK_QUEUE_CAPACITY));
    let (view_tx, _view_rx) = bus::view_channel(defaults::VIEW_CHANNEL_CAPACITY);

    let aggregator = PickAggregator::new(cfg, Arc::new(catalogs.stations.clone()));
    let assembler = TensorAssembler::new(
        Arc::clone(&wave_buffer),
        Arc::clone(&catalogs),
        cfg.n_stations_max,
    );
    let dispatcher = InferenceDispatcher::new(
        cfg,
        assembler,
        predictor,
        Arc::clone(&catalogs),
        Arc::new(LogPublisher),
        view_tx,
        log_dir.clone(),
    );

    info!("starting pipeline tasks");
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task 1: Wave Ingestor
    let wave_cancel = cancel.clone();
    let ingest_buffer = Arc::clone(&wave_buffer);
    task_set.spawn(async move {
        info!("[WaveIngest] task starting");
        WaveIngestLoop::new(ingest_buffer, wave_cancel)
            .run(&mut wave_source)
            .await?;
        Ok(TaskName::WaveIngest)
    });

    // Task 2: Pick Aggregator
    let pick_cancel = cancel.clone();
    let pick_queue = Arc::clone(&tick_queue);
    let pick_log = PickLog::new(&log_dir);
    task_set.spawn(async move {
        info!("[PickLoop] task starting");
        PickLoop::new(aggregator, pick_queue, pick_log, pick_cancel)
            .run(&mut pick_source)
            .await?;
        Ok(TaskName::PickLoop)
    });

    // Task 3: Inference Dispatcher
    let dispatch_cancel = cancel.clone();
    let dispatch_queue = Arc::clone(&tick_queue);
    task_set.spawn(async move {
        dispatcher.run(dispatch_queue, dispatch_cancel).await;
        Ok(TaskName::Dispatcher)
    });

    run_supervisor(&mut task_set, cancel).await
}

/// Monitor tasks; any failure cancels the rest.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("supervisor: shutdown signal received, draining tasks");
                while let Some(result) = task_set.join_next().await {
                    match result {
                        Ok(Ok(name)) => info!("supervisor: task {name} finished"),
                        Ok(Err(e)) => warn!("supervisor: task error during shutdown: {e}"),
                        Err(e) => warn!("supervisor: task panicked during shutdown: {e}"),
                    }
                }
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(name))) => {
                        info!("supervisor: task {name} completed normally");
                    }
                    Some(Ok(Err(e))) => {
                        error!("supervisor: task failed: {e}");
                        cancel.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("supervisor: task panicked: {e}");
                        cancel.cancel();
                        return Err(anyhow::anyhow!("task panicked: {e}"));
                    }
                    None => {
                        info!("supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    config::init(Config::from_env());

    info!("TTSAM Realtime starting");

    // Catalogs are load-bearing: bail out with a distinct exit code.
    let catalogs = match Catalogs::load(&args.data_dir) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("catalog load failed: {e}");
            return ExitCode::from(1);
        }
    };

    let predictor = match build_predictor() {
        Ok(p) => p,
        Err(e) => {
            error!("predictor initialization failed: {e}");
            return ExitCode::from(2);
        }
    };

    // Graceful shutdown via Ctrl+C.
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received Ctrl+C, initiating shutdown");
        shutdown.cancel();
    });

    let result = dispatch_sources(args, catalogs, predictor, cancel).await;

    match result {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("pipeline failed: {e}");
            ExitCode::from(3)
        }
    }
}

/// Resolve the CLI source flags and launch the pipeline.
async fn dispatch_sources(
    args: CliArgs,
    catalogs: Arc<Catalogs>,
    predictor: Box<dyn Predictor>,
    cancel: CancellationToken,
) -> Result<()> {
    if args.stdin_wave && args.stdin_pick {
        anyhow::bail!("--stdin-wave and --stdin-pick cannot share one stdin");
    }

    match (
        &args.wave_tcp,
        args.stdin_wave,
        &args.pick_tcp,
        args.stdin_pick,
    ) {
        (Some(wave_addr), false, Some(pick_addr), false) => {
            let (wh, wp) = parse_host_port(wave_addr)?;
            let (ph, pp) = parse_host_port(pick_addr)?;
            let wave = TcpWaveSource::connect(&wh, wp).await?;
            let pick = TcpPickSource::connect(&ph, pp).await?;
            run_pipeline(wave, pick, catalogs, predictor, args.log_dir, cancel).await
        }
        (None, true, Some(pick_addr), false) => {
            let (ph, pp) = parse_host_port(pick_addr)?;
            let pick = TcpPickSource::connect(&ph, pp).await?;
            run_pipeline(
                StdinWaveSource::new(),
                pick,
                catalogs,
                predictor,
                args.log_dir,
                cancel,
            )
            .await
        }
        (Some(wave_addr), false, None, true) => {
            let (wh, wp) = parse_host_port(wave_addr)?;
            let wave = TcpWaveSource::connect(&wh, wp).await?;
            run_pipeline(
                wave,
                StdinPickSource::new(),
                catalogs,
                predictor,
                args.log_dir,
                cancel,
            )
            .await
        }
        _ => anyhow::bail!(
            "choose one waveform source (--wave-tcp or --stdin-wave) and one pick source (--pick-tcp or --stdin-pick)"
        ),
    }
}
