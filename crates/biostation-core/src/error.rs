//! Error types for packet decoding
//!
//! Decode errors carry enough context to be logged and counted by the
//! acquisition loop without allocating.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::PacketLayout;

// ============================================================================
// Packet Errors
// ============================================================================

/// Errors produced when a raw notification payload cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketError {
    /// Payload length does not match the fixed packet size of the layout
    WrongLength {
        /// Layout the payload was decoded against
        layout: PacketLayout,
        /// Exact number of bytes the layout requires
        expected: usize,
        /// Number of bytes actually received
        received: usize,
    },
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength { layout, expected, received } => {
                write!(
                    f,
                    "{layout} packet must be exactly {expected} bytes, received {received}"
                )
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PacketError {}
