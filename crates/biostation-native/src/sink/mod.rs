//! Consumers of decoded samples.
//!
//! Each session owns exactly one sink. Sinks are called from the session's
//! task, so `accept` must not block for long: the CSV logs write through a
//! `BufWriter` and the live sinks take a short buffer lock.
//!
//! - [`log`]: append-only CSV files per run
//! - [`live`]: rolling buffers for the live dashboard

pub mod live;
pub mod log;

pub use live::{EegLiveSink, FnirsLiveSink};
pub use log::{CsvLog, EegLog, FnirsLog, RunStamp};

use crate::error::AcquisitionResult;

/// A consumer of samples of type `T`.
pub trait DataSink<T>: Send {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Consume one item.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AcquisitionError::SinkWriteFailure`] when the item
    /// cannot be stored. The owning session ends on error.
    fn accept(&mut self, item: &T) -> AcquisitionResult<()>;

    /// Flush anything buffered. Called once when the session ends.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AcquisitionError::SinkWriteFailure`] on I/O failure.
    fn flush(&mut self) -> AcquisitionResult<()> {
        Ok(())
    }

    /// Counters accumulated so far.
    fn stats(&self) -> SinkStats;
}

/// Counters kept by every sink.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Items accepted
    pub accepted: u64,
    /// Records written (CSV rows or buffer pushes)
    pub records: u64,
}
