//! Station configuration.
//!
//! The command line builds a [`StationConfig`]; [`StationConfig::validate`]
//! runs before any device I/O so that a bad invocation never touches the
//! radios or the output directory.

use std::path::PathBuf;
use std::time::Duration;

use biostation_core::PacketLayout;

use crate::error::{AcquisitionError, AcquisitionResult};

/// How samples are consumed once decoded.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SinkMode {
    /// Append every sample to timestamped CSV files
    #[default]
    Log,
    /// Push samples into rolling buffers for live display
    Live,
}

impl SinkMode {
    /// Packet layout the glasses firmware uses in this mode by default.
    pub const fn default_layout(self) -> PacketLayout {
        match self {
            Self::Log => PacketLayout::Logging,
            Self::Live => PacketLayout::Display,
        }
    }
}

/// Complete station configuration.
#[derive(Clone, Debug)]
pub struct StationConfig {
    /// BLE address of the EEG headband
    pub eeg_address: String,
    /// BLE address of the fNIRS glasses
    pub fnirs_address: String,
    /// Sink mode
    pub mode: SinkMode,
    /// fNIRS packet layout
    pub layout: PacketLayout,
    /// Root directory for `eeg/` and `fnirs/` logs
    pub output_dir: PathBuf,
    /// Deadline for each session to finish after stop is requested
    pub shutdown_timeout: Duration,
    /// How long the fNIRS loop waits for one notification
    pub notification_wait: Duration,
    /// Live display refresh period
    pub redraw_period: Duration,
    /// Device scan deadline
    pub scan_timeout: Duration,
    /// Use simulated devices instead of BLE hardware
    pub simulate: bool,
}

impl StationConfig {
    /// Create a configuration for two device addresses with default settings.
    pub fn new(eeg_address: impl Into<String>, fnirs_address: impl Into<String>) -> Self {
        Self {
            eeg_address: eeg_address.into(),
            fnirs_address: fnirs_address.into(),
            mode: SinkMode::Log,
            layout: SinkMode::Log.default_layout(),
            output_dir: PathBuf::from("."),
            shutdown_timeout: Duration::from_secs(5),
            notification_wait: Duration::from_secs(1),
            redraw_period: Duration::from_secs(1),
            scan_timeout: Duration::from_secs(10),
            simulate: false,
        }
    }

    /// Validate configuration values.
    ///
    /// Address syntax is left to the transport, which reports malformed
    /// addresses as connection failures.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::ConfigurationError`] for empty addresses,
    /// identical addresses, or zero durations.
    pub fn validate(&self) -> AcquisitionResult<()> {
        if self.eeg_address.trim().is_empty() {
            return Err(AcquisitionError::ConfigurationError(
                "EEG device address is required".to_string(),
            ));
        }
        if self.fnirs_address.trim().is_empty() {
            return Err(AcquisitionError::ConfigurationError(
                "fNIRS device address is required".to_string(),
            ));
        }
        if self.eeg_address.eq_ignore_ascii_case(&self.fnirs_address) {
            return Err(AcquisitionError::ConfigurationError(format!(
                "EEG and fNIRS devices must differ (both are {})",
                self.eeg_address
            )));
        }

        for (name, value) in [
            ("shutdown timeout", self.shutdown_timeout),
            ("notification wait", self.notification_wait),
            ("redraw period", self.redraw_period),
            ("scan timeout", self.scan_timeout),
        ] {
            if value.is_zero() {
                return Err(AcquisitionError::ConfigurationError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        Ok(())
    }
}
