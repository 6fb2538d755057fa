//! Device transports.
//!
//! The sessions talk to hardware only through two traits:
//!
//! - [`EegDevice`]: a headband driven by its own SDK, which pushes sample
//!   batches into a callback from its own context.
//! - [`FnirsPeripheral`]: a GATT peripheral the host polls for
//!   notifications with a bounded wait.
//!
//! Implementations:
//! - [`ble`]: `btleplug` backend for the fNIRS glasses (requires `ble` feature)
//! - [`muse`]: `btleplug` backend for a classic Muse headband (requires `ble` feature)
//! - [`sim`]: simulated devices for dry runs and tests
//!
//! # fNIRS GATT Layout
//!
//! - `0f0e0d0c-0b0a-0908-0706-050403020100` - fNIRS service
//! - `1f1e1d1c-1b1a-1918-1716-151413121110` - Command (write)
//! - `3f3e3d3c-3b3a-3938-3736-353433323130` - Data (notify)

use std::time::Duration;

use async_trait::async_trait;
use biostation_core::EegSampleBatch;
use uuid::Uuid;

use crate::error::{AcquisitionError, AcquisitionResult};

#[cfg(feature = "ble")]
pub mod ble;

#[cfg(feature = "ble")]
pub mod muse;

pub mod sim;

#[cfg(feature = "ble")]
pub use ble::BlePeripheral;

#[cfg(feature = "ble")]
pub use muse::MuseHeadset;

pub use sim::{SimulatedHeadset, SimulatedPeripheral};

/// fNIRS service UUID
pub const FNIRS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0f0e0d0c_0b0a_0908_0706_050403020100);

/// fNIRS command characteristic UUID (write)
pub const FNIRS_COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x1f1e1d1c_1b1a_1918_1716_151413121110);

/// fNIRS data characteristic UUID (notify)
pub const FNIRS_DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x3f3e3d3c_3b3a_3938_3736_353433323130);

/// Callback handed to an [`EegDevice`]; invoked once per batch from the
/// driver's context. Must not block.
pub type BatchCallback = Box<dyn Fn(EegSampleBatch) + Send + Sync>;

// ============================================================================
// Device Traits
// ============================================================================

/// A callback-driven EEG headband.
#[async_trait]
pub trait EegDevice: Send + Sync {
    /// Address the device was configured with.
    fn address(&self) -> &str;

    /// Connect to the headband.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::ConnectionFailure`] if the device cannot
    /// be reached or the address is malformed.
    async fn connect(&self) -> AcquisitionResult<()>;

    /// Start streaming; `on_batch` is invoked for every batch until
    /// [`disconnect`](Self::disconnect).
    ///
    /// # Errors
    ///
    /// Returns an error if the device is not connected or rejects the start
    /// command.
    async fn start(&self, on_batch: BatchCallback) -> AcquisitionResult<()>;

    /// Stop streaming and drop the connection. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Transport`] if the link fails to close.
    async fn disconnect(&self) -> AcquisitionResult<()>;
}

/// A notification-driven fNIRS peripheral.
#[async_trait]
pub trait FnirsPeripheral: Send + Sync {
    /// Address the peripheral was configured with.
    fn address(&self) -> &str;

    /// Connect to the peripheral and discover its services.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::ConnectionFailure`] if the peripheral
    /// cannot be reached or the address is malformed.
    async fn connect(&self) -> AcquisitionResult<()>;

    /// Enable notifications on the data characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::ConnectionFailure`] if the characteristic
    /// is missing or the descriptor write fails.
    async fn subscribe(&self) -> AcquisitionResult<()>;

    /// Wait up to `timeout` for the next notification payload.
    ///
    /// `Ok(None)` means nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Transport`] if the link is gone.
    async fn wait_for_notification(&self, timeout: Duration) -> AcquisitionResult<Option<Vec<u8>>>;

    /// Drop the connection. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Transport`] if the link fails to close.
    async fn disconnect(&self) -> AcquisitionResult<()>;
}

// ============================================================================
// Addresses
// ============================================================================

/// Parse a Bluetooth device address of six `:`-separated hex octets.
///
/// # Errors
///
/// Returns [`AcquisitionError::ConnectionFailure`] for anything else.
pub fn parse_address(address: &str) -> AcquisitionResult<[u8; 6]> {
    let malformed = || {
        AcquisitionError::connection(address, "malformed address, expected XX:XX:XX:XX:XX:XX")
    };

    let mut octets = [0u8; 6];
    let mut parts = address.split(':');
    for octet in &mut octets {
        let part = parts.next().ok_or_else(malformed)?;
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed());
        }
        *octet = u8::from_str_radix(part, 16).map_err(|_| malformed())?;
    }

    if parts.next().is_some() {
        return Err(malformed());
    }
    Ok(octets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("00:55:da:B0:0F:ff").unwrap(),
            [0x00, 0x55, 0xDA, 0xB0, 0x0F, 0xFF]
        );
    }

    #[test]
    fn test_parse_address_rejects_malformed() {
        for bad in ["", "00:55:DA:B0:0F", "00:55:DA:B0:0F:FF:11", "0:55:DA:B0:0F:FF", "zz:55:DA:B0:0F:FF", "+0:55:DA:B0:0F:FF", "muse"] {
            assert!(
                matches!(parse_address(bad), Err(AcquisitionError::ConnectionFailure { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_gatt_uuids() {
        assert_eq!(FNIRS_SERVICE_UUID.to_string(), "0f0e0d0c-0b0a-0908-0706-050403020100");
        assert_eq!(FNIRS_DATA_CHAR_UUID.to_string(), "3f3e3d3c-3b3a-3938-3736-353433323130");
    }
}
