//! Wire protocol for the fNIRS glasses
//!
//! The glasses push one fixed-size packet per GATT notification on the data
//! characteristic. Two firmware builds exist and they lay the same 12 bytes
//! out differently:
//!
//! - **Logging** firmware sends a 16-bit packet index (or device time) and
//!   the raw short-path and long-path optical readings.
//! - **Display** firmware sends an 8-bit packet index and two signed
//!   hemodynamic values, meant for live plotting.
//!
//! All multi-byte integers are big-endian. Decoding is a pure function of
//! the layout and the payload bytes; the caller stamps the capture time.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PacketError;

// ============================================================================
// GATT Notification Constants
// ============================================================================

/// Value written to a Client Characteristic Configuration Descriptor to
/// enable notifications (little-endian `0x0001`).
pub const NOTIFY_ENABLE: [u8; 2] = [0x01, 0x00];

/// Handle of the CCCD that belongs to a characteristic value handle.
///
/// The glasses place the descriptor directly after the value attribute.
#[must_use]
pub const fn cccd_handle(value_handle: u16) -> u16 {
    value_handle.wrapping_add(1)
}

// ============================================================================
// Layouts
// ============================================================================

/// Packet layout selected by the firmware build running on the glasses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketLayout {
    /// Raw short/long path intensities for persistent logging
    #[default]
    Logging,
    /// Signed hemodynamic pair for live display
    Display,
}

impl PacketLayout {
    /// Exact payload size in bytes.
    #[must_use]
    pub const fn len(self) -> usize {
        match self {
            Self::Logging => LoggingPacket::SIZE,
            Self::Display => DisplayPacket::SIZE,
        }
    }

    /// Layouts never describe empty packets.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        false
    }

    /// Lowercase name used on the command line and in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Logging => "logging",
            Self::Display => "display",
        }
    }

    const fn wrong_length(self, received: usize) -> PacketError {
        PacketError::WrongLength { layout: self, expected: self.len(), received }
    }
}

impl fmt::Display for PacketLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Logging Layout
// ============================================================================

/// Packet produced by the logging firmware.
///
/// ```text
/// offset  size  field
/// 0       2     index_or_time  (u16, big-endian)
/// 2       4     short_path     (u32, big-endian)
/// 6       4     long_path      (u32, big-endian)
/// 10      2     trailer        (u16, big-endian)
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingPacket {
    /// Packet counter, or device time on firmware that reports it
    pub index_or_time: u16,
    /// Short source-detector path reading
    pub short_path: u32,
    /// Long source-detector path reading
    pub long_path: u32,
    /// Trailing field, not interpreted
    pub trailer: u16,
}

impl LoggingPacket {
    /// Packet size in bytes
    pub const SIZE: usize = 12;

    /// Parse a packet from exactly [`Self::SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::WrongLength`] for any other payload length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let b: &[u8; Self::SIZE] = bytes
            .try_into()
            .map_err(|_| PacketLayout::Logging.wrong_length(bytes.len()))?;

        Ok(Self {
            index_or_time: u16::from_be_bytes([b[0], b[1]]),
            short_path: u32::from_be_bytes([b[2], b[3], b[4], b[5]]),
            long_path: u32::from_be_bytes([b[6], b[7], b[8], b[9]]),
            trailer: u16::from_be_bytes([b[10], b[11]]),
        })
    }

    /// Serialize to the on-air representation.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.index_or_time.to_be_bytes());
        out[2..6].copy_from_slice(&self.short_path.to_be_bytes());
        out[6..10].copy_from_slice(&self.long_path.to_be_bytes());
        out[10..12].copy_from_slice(&self.trailer.to_be_bytes());
        out
    }
}

// ============================================================================
// Display Layout
// ============================================================================

/// Packet produced by the live-display firmware.
///
/// ```text
/// offset  size  field
/// 0       1     index      (u8)
/// 1       1     reserved   (u8, carried but not validated)
/// 2       4     hemo_1     (i32, big-endian)
/// 6       4     hemo_2     (i32, big-endian)
/// 10      1     trailer_a  (i8)
/// 11      1     trailer_b  (i8)
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayPacket {
    /// Packet counter (wraps at 255)
    pub index: u8,
    /// Reserved byte
    pub reserved: u8,
    /// First hemodynamic value (880 nm channel)
    pub hemo_1: i32,
    /// Second hemodynamic value (940 nm channel)
    pub hemo_2: i32,
    /// First trailing byte
    pub trailer_a: i8,
    /// Second trailing byte
    pub trailer_b: i8,
}

impl DisplayPacket {
    /// Packet size in bytes
    pub const SIZE: usize = 12;

    /// Parse a packet from exactly [`Self::SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::WrongLength`] for any other payload length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let b: &[u8; Self::SIZE] = bytes
            .try_into()
            .map_err(|_| PacketLayout::Display.wrong_length(bytes.len()))?;

        Ok(Self {
            index: b[0],
            reserved: b[1],
            hemo_1: i32::from_be_bytes([b[2], b[3], b[4], b[5]]),
            hemo_2: i32::from_be_bytes([b[6], b[7], b[8], b[9]]),
            trailer_a: i8::from_be_bytes([b[10]]),
            trailer_b: i8::from_be_bytes([b[11]]),
        })
    }

    /// Serialize to the on-air representation.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.index;
        out[1] = self.reserved;
        out[2..6].copy_from_slice(&self.hemo_1.to_be_bytes());
        out[6..10].copy_from_slice(&self.hemo_2.to_be_bytes());
        out[10] = self.trailer_a.to_be_bytes()[0];
        out[11] = self.trailer_b.to_be_bytes()[0];
        out
    }
}

// ============================================================================
// Decoded Packet
// ============================================================================

/// A decoded fNIRS packet of either layout.
///
/// The accessors give sinks a layout-independent view: an index or time
/// value plus two optical channels (A at 880 nm, B at 940 nm).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FnirsPacket {
    /// Logging firmware packet
    Logging(LoggingPacket),
    /// Display firmware packet
    Display(DisplayPacket),
}

impl FnirsPacket {
    /// Layout this packet was decoded from.
    #[must_use]
    pub const fn layout(&self) -> PacketLayout {
        match self {
            Self::Logging(_) => PacketLayout::Logging,
            Self::Display(_) => PacketLayout::Display,
        }
    }

    /// Packet counter or device time.
    #[must_use]
    pub fn index_or_time(&self) -> u32 {
        match self {
            Self::Logging(p) => u32::from(p.index_or_time),
            Self::Display(p) => u32::from(p.index),
        }
    }

    /// Channel A: short path (logging) or first hemodynamic value (display).
    #[must_use]
    pub fn channel_a(&self) -> i64 {
        match self {
            Self::Logging(p) => i64::from(p.short_path),
            Self::Display(p) => i64::from(p.hemo_1),
        }
    }

    /// Channel B: long path (logging) or second hemodynamic value (display).
    #[must_use]
    pub fn channel_b(&self) -> i64 {
        match self {
            Self::Logging(p) => i64::from(p.long_path),
            Self::Display(p) => i64::from(p.hemo_2),
        }
    }

    /// Serialize back to the on-air representation.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 12] {
        match self {
            Self::Logging(p) => p.to_bytes(),
            Self::Display(p) => p.to_bytes(),
        }
    }
}

/// Decode one notification payload with the given layout.
///
/// # Errors
///
/// Returns [`PacketError::WrongLength`] when `bytes` is not exactly
/// `layout.len()` bytes long. Every 12-byte payload decodes.
pub fn decode(layout: PacketLayout, bytes: &[u8]) -> Result<FnirsPacket, PacketError> {
    match layout {
        PacketLayout::Logging => LoggingPacket::from_bytes(bytes).map(FnirsPacket::Logging),
        PacketLayout::Display => DisplayPacket::from_bytes(bytes).map(FnirsPacket::Display),
    }
}

// ============================================================================
// Tests
// ============================================================================
