//! Biostation Native - Host runtime for dual-device acquisition
//!
//! This crate runs one acquisition session per device (an EEG headband and a
//! pair of fNIRS glasses), forwards their samples into sinks, and coordinates
//! a shared start/stop signal across both sessions.
//!
//! # Modules
//!
//! - [`bridge`]: Device transports (BLE, simulated)
//! - [`session`]: Per-device acquisition loops
//! - [`coordinator`]: Stream state and orchestrated start/stop
//! - [`sink`]: CSV logs and live display buffers
//! - [`buffer`]: Fixed-capacity rolling buffers for live display
//! - [`config`]: Station configuration
//! - [`clock`]: Capture timestamps
//! - [`error`]: Acquisition errors

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod session;
pub mod sink;

// Re-export key types
pub use buffer::{BufferSummary, CircularBuffer, LiveBuffers, SharedBuffer};
pub use config::{SinkMode, StationConfig};
pub use coordinator::{
    CoordinatorState, ShutdownReport, StreamCoordinator, StreamSignal, StreamState,
};
pub use error::{AcquisitionError, AcquisitionResult};
pub use session::{DeviceSession, EegSession, FnirsSession, SessionFault, SessionSummary};
pub use sink::DataSink;
