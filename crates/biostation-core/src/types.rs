//! Sample records passed from device sessions to sinks
//!
//! Capture times are wall-clock seconds since the Unix epoch, stamped on the
//! host when the data arrives. They are monotone enough for logging but are
//! not device timestamps.

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::protocol::FnirsPacket;

// ============================================================================
// fNIRS
// ============================================================================

/// Optical wavelength of an fNIRS channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Wavelength {
    /// 880 nm (channel A)
    Nm880,
    /// 940 nm (channel B)
    Nm940,
}

impl Wavelength {
    /// Wavelength in nanometres.
    #[must_use]
    pub const fn nm(self) -> u16 {
        match self {
            Self::Nm880 => 880,
            Self::Nm940 => 940,
        }
    }

    /// Display label, e.g. `fNIRS, 880nm`.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Nm880 => "fNIRS, 880nm",
            Self::Nm940 => "fNIRS, 940nm",
        }
    }
}

/// One fNIRS packet with the host time it was received.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodedSample {
    /// Host wall-clock seconds at receipt
    pub capture_time: f64,
    /// The decoded packet
    pub packet: FnirsPacket,
}

impl DecodedSample {
    /// Create a sample.
    #[must_use]
    pub const fn new(capture_time: f64, packet: FnirsPacket) -> Self {
        Self { capture_time, packet }
    }

    /// Value for the given wavelength channel.
    #[must_use]
    pub fn channel(&self, wavelength: Wavelength) -> i64 {
        match wavelength {
            Wavelength::Nm880 => self.packet.channel_a(),
            Wavelength::Nm940 => self.packet.channel_b(),
        }
    }
}

// ============================================================================
// EEG
// ============================================================================

/// Samples per EEG frame (one electrode notification).
pub const EEG_FRAME_WIDTH: usize = 12;

/// Twelve consecutive samples from one electrode, in microvolts.
pub type EegFrame = [f32; EEG_FRAME_WIDTH];

/// A batch of EEG frames delivered together by the headset driver.
///
/// `frames[i]` is the frame of the `i`-th electrode in the driver's order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EegSampleBatch {
    /// Host wall-clock seconds at receipt
    pub capture_time: f64,
    /// One frame per electrode
    pub frames: Vec<EegFrame>,
}

impl EegSampleBatch {
    /// Create a batch.
    #[must_use]
    pub fn new(capture_time: f64, frames: Vec<EegFrame>) -> Self {
        Self { capture_time, frames }
    }

    /// Number of electrode frames in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the batch carries no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
