//! Error types for the acquisition runtime.

use biostation_core::PacketError;
use thiserror::Error;

/// Errors raised while connecting to devices, streaming, or shutting down.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// A device could not be reached, connected, or subscribed
    #[error("Connection to {device} failed: {reason}")]
    ConnectionFailure {
        /// Address or name of the device
        device: String,
        /// What went wrong
        reason: String,
    },

    /// A notification payload could not be decoded
    #[error("Malformed packet: {0}")]
    MalformedPacket(#[from] PacketError),

    /// A sink failed to persist or publish a sample
    #[error("Sink {sink} write failed: {source}")]
    SinkWriteFailure {
        /// Sink name
        sink: &'static str,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A session did not finish within the shutdown deadline
    #[error("Session {session} did not stop within {timeout_ms} ms")]
    ShutdownTimeout {
        /// Session name
        session: &'static str,
        /// Deadline that was exceeded
        timeout_ms: u64,
    },

    /// The transport failed after the connection was established
    #[error("Transport error on {device}: {reason}")]
    Transport {
        /// Address or name of the device
        device: String,
        /// What went wrong
        reason: String,
    },
}

impl AcquisitionError {
    /// Shorthand for [`AcquisitionError::ConnectionFailure`].
    pub fn connection(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectionFailure { device: device.into(), reason: reason.to_string() }
    }

    /// Shorthand for [`AcquisitionError::Transport`].
    pub fn transport(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport { device: device.into(), reason: reason.to_string() }
    }

    /// Wrap an I/O error raised by the named sink.
    pub fn sink(sink: &'static str, source: std::io::Error) -> Self {
        Self::SinkWriteFailure { sink, source }
    }
}

/// Result type for acquisition operations.
pub type AcquisitionResult<T> = Result<T, AcquisitionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use biostation_core::PacketLayout;

    #[test]
    fn test_error_messages() {
        let err = AcquisitionError::connection("00:11:22:33:44:55", "not found");
        assert_eq!(err.to_string(), "Connection to 00:11:22:33:44:55 failed: not found");

        let err = AcquisitionError::ShutdownTimeout { session: "fnirs", timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Session fnirs did not stop within 5000 ms");
    }

    #[test]
    fn test_packet_error_converts() {
        let packet = PacketError::WrongLength { layout: PacketLayout::Logging, expected: 12, received: 3 };
        let err: AcquisitionError = packet.into();
        assert!(matches!(err, AcquisitionError::MalformedPacket(_)));
    }

    #[test]
    fn test_sink_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = AcquisitionError::sink("fnirs-log", io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
