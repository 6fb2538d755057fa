//! Biostation
//!
//! Records an EEG headband and a pair of fNIRS glasses at the same time,
//! either into CSV logs or into a live rolling display.
//!
//! # Usage
//!
//! ```bash
//! # Log both devices under ./eeg and ./fnirs
//! biostation 00:55:DA:B0:00:01 A0:B1:C2:D3:E4:F5
//!
//! # Live display, redrawn every 500 ms
//! biostation 00:55:DA:B0:00:01 A0:B1:C2:D3:E4:F5 --mode live --redraw-ms 500
//!
//! # Dry run without hardware
//! biostation 00:55:DA:B0:00:01 A0:B1:C2:D3:E4:F5 --simulate
//! ```

mod monitor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use biostation_core::PacketLayout;
use biostation_native::bridge::{EegDevice, FnirsPeripheral, SimulatedHeadset, SimulatedPeripheral};
use biostation_native::sink::{EegLiveSink, EegLog, FnirsLiveSink, FnirsLog, RunStamp};
use biostation_native::{
    EegSession, FnirsSession, LiveBuffers, SinkMode, StationConfig, StreamCoordinator,
};
use clap::{Parser, ValueEnum};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Biostation dual-device acquisition
#[derive(Parser, Debug)]
#[command(name = "biostation")]
#[command(author, version, about = "EEG headband + fNIRS glasses acquisition station", long_about = None)]
struct Cli {
    /// BLE address of the EEG headband
    eeg_address: String,

    /// BLE address of the fNIRS glasses
    fnirs_address: String,

    /// Where samples go
    #[arg(short, long, value_enum, default_value = "log")]
    mode: Mode,

    /// fNIRS packet layout (defaults to `logging` in log mode, `display` in live mode)
    #[arg(long, value_enum)]
    layout: Option<Layout>,

    /// Root directory for log files
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Per-session shutdown deadline in milliseconds
    #[arg(long, default_value = "5000")]
    shutdown_timeout_ms: u64,

    /// fNIRS notification wait in milliseconds
    #[arg(long, default_value = "1000")]
    notification_wait_ms: u64,

    /// Live display redraw period in milliseconds
    #[arg(long, default_value = "1000")]
    redraw_ms: u64,

    /// Device scan deadline in milliseconds
    #[arg(long, default_value = "10000")]
    scan_timeout_ms: u64,

    /// Use simulated devices instead of Bluetooth hardware
    #[arg(long)]
    simulate: bool,

    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    Log,
    Live,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Layout {
    Logging,
    Display,
}

impl From<Mode> for SinkMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Log => Self::Log,
            Mode::Live => Self::Live,
        }
    }
}

impl From<Layout> for PacketLayout {
    fn from(layout: Layout) -> Self {
        match layout {
            Layout::Logging => Self::Logging,
            Layout::Display => Self::Display,
        }
    }
}

impl Cli {
    fn into_config(self) -> StationConfig {
        let mode = SinkMode::from(self.mode);
        let mut config = StationConfig::new(self.eeg_address, self.fnirs_address);
        config.mode = mode;
        config.layout = self.layout.map_or_else(|| mode.default_layout(), PacketLayout::from);
        config.output_dir = self.output_dir;
        config.shutdown_timeout = Duration::from_millis(self.shutdown_timeout_ms);
        config.notification_wait = Duration::from_millis(self.notification_wait_ms);
        config.redraw_period = Duration::from_millis(self.redraw_ms);
        config.scan_timeout = Duration::from_millis(self.scan_timeout_ms);
        config.simulate = self.simulate;
        config
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Biostation v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.into_config();
    config.validate()?;

    let rt = Runtime::new()?;
    rt.block_on(run(config))
}

/// Device handles for one run.
fn devices(config: &StationConfig) -> (Arc<dyn EegDevice>, Arc<dyn FnirsPeripheral>) {
    #[cfg(feature = "ble")]
    if !config.simulate {
        use biostation_native::bridge::{BlePeripheral, MuseHeadset};

        return (
            Arc::new(MuseHeadset::new(config.eeg_address.clone(), config.scan_timeout)),
            Arc::new(BlePeripheral::new(config.fnirs_address.clone(), config.scan_timeout)),
        );
    }

    #[cfg(not(feature = "ble"))]
    if !config.simulate {
        warn!("Built without Bluetooth support, using simulated devices");
    }

    (
        Arc::new(SimulatedHeadset::new(config.eeg_address.clone())),
        Arc::new(SimulatedPeripheral::new(config.fnirs_address.clone(), config.layout)),
    )
}

async fn run(config: StationConfig) -> anyhow::Result<()> {
    info!(
        eeg = %config.eeg_address,
        fnirs = %config.fnirs_address,
        mode = ?config.mode,
        layout = %config.layout,
        simulate = config.simulate,
        "Starting station"
    );

    let (headset, glasses) = devices(&config);
    let redraw = CancellationToken::new();
    let mut redraw_task = None;

    let (eeg, fnirs) = match config.mode {
        SinkMode::Log => {
            let stamp = RunStamp::now();
            (
                EegSession::new(headset, Box::new(EegLog::create(&config.output_dir, stamp)?)),
                FnirsSession::new(
                    glasses,
                    config.layout,
                    Box::new(FnirsLog::create(&config.output_dir, stamp)?),
                ),
            )
        }
        SinkMode::Live => {
            let buffers = LiveBuffers::new()?;
            let sessions = (
                EegSession::new(headset, Box::new(EegLiveSink::new(buffers.eeg.clone()))),
                FnirsSession::new(glasses, config.layout, Box::new(FnirsLiveSink::new(&buffers))),
            );
            redraw_task = Some(monitor::spawn(buffers, config.redraw_period, redraw.clone()));
            sessions
        }
    };

    let mut coordinator = StreamCoordinator::new(
        Box::new(eeg),
        Box::new(fnirs.with_notification_wait(config.notification_wait)),
        config.shutdown_timeout,
    );

    if let Err(e) = coordinator.start().await {
        redraw.cancel();
        return Err(e.into());
    }
    info!("Press Ctrl+C to stop");

    let fault = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl+C: {e}");
            }
            info!("Interrupted");
            None
        }
        fault = coordinator.next_fault() => fault,
    };

    redraw.cancel();
    let report = coordinator.stop().await?;
    if let Some(handle) = redraw_task {
        let _ = handle.await;
    }

    for summary in &report.summaries {
        info!(
            session = summary.session,
            forwarded = summary.forwarded,
            malformed = summary.malformed,
            overflowed = summary.overflowed,
            records = summary.sink.records,
            "Session summary"
        );
    }
    for (session, reason) in &report.errors {
        error!(session, "{reason}");
    }

    match fault {
        Some(fault) => anyhow::bail!("{} session failed: {}", fault.session, fault.reason),
        None => Ok(()),
    }
}
