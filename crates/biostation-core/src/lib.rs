//! Biostation Core - `no_std` wire formats and sample types
//!
//! This crate holds everything about the acquisition station that does not
//! need an operating system: the fNIRS glasses packet layouts and their
//! decoder, the GATT notification constants, and the sample records that
//! flow from the device sessions into the sinks.
//!
//! # Modules
//!
//! - [`protocol`]: fNIRS packet layouts, decoding, and GATT constants
//! - [`types`]: Decoded samples, EEG batches, and wavelength tags
//! - [`error`]: Packet decode errors
//!
//! # Features
//!
//! - `std`: Implement `std::error::Error` for the error types
//!
//! # Example
//!
//! ```rust
//! use biostation_core::protocol::{decode, PacketLayout};
//!
//! let raw = [0x00, 0x05, 0x00, 0x00, 0x01, 0x2C, 0x00, 0x00, 0x02, 0x58, 0x00, 0x00];
//! let packet = decode(PacketLayout::Logging, &raw).unwrap();
//!
//! assert_eq!(packet.index_or_time(), 5);
//! assert_eq!(packet.channel_a(), 300);
//! assert_eq!(packet.channel_b(), 600);
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod error;
pub mod protocol;
pub mod types;

// Re-export commonly used types at crate root
pub use error::PacketError;
pub use protocol::{decode, DisplayPacket, FnirsPacket, LoggingPacket, PacketLayout};
pub use types::{DecodedSample, EegFrame, EegSampleBatch, Wavelength, EEG_FRAME_WIDTH};
