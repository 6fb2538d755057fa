//! Sinks that feed the live dashboard buffers.

use biostation_core::{DecodedSample, EegSampleBatch, Wavelength};
use tracing::debug;

use super::{DataSink, SinkStats};
use crate::buffer::{LiveBuffers, SharedBuffer};
use crate::error::AcquisitionResult;

/// Pushes one electrode's samples into the EEG display buffer.
#[derive(Debug)]
pub struct EegLiveSink {
    buffer: SharedBuffer,
    tracked_frame: usize,
    stats: SinkStats,
}

impl EegLiveSink {
    /// Track the first frame of every batch.
    pub fn new(buffer: SharedBuffer) -> Self {
        Self::tracking(buffer, 0)
    }

    /// Track the frame at `index` of every batch.
    pub fn tracking(buffer: SharedBuffer, index: usize) -> Self {
        Self { buffer, tracked_frame: index, stats: SinkStats::default() }
    }
}

impl DataSink<EegSampleBatch> for EegLiveSink {
    fn name(&self) -> &'static str {
        "eeg-live"
    }

    fn accept(&mut self, batch: &EegSampleBatch) -> AcquisitionResult<()> {
        self.stats.accepted += 1;
        let Some(frame) = batch.frames.get(self.tracked_frame) else {
            return Ok(());
        };

        let mut buffer = self.buffer.lock();
        for &value in frame {
            buffer.push(f64::from(value));
        }
        self.stats.records += frame.len() as u64;
        Ok(())
    }

    fn stats(&self) -> SinkStats {
        self.stats
    }
}

/// Pushes both optical channels into their wavelength buffers.
#[derive(Debug)]
pub struct FnirsLiveSink {
    nm880: SharedBuffer,
    nm940: SharedBuffer,
    stats: SinkStats,
}

impl FnirsLiveSink {
    /// Feed the optical buffers of the dashboard.
    pub fn new(buffers: &LiveBuffers) -> Self {
        Self {
            nm880: buffers.optical(Wavelength::Nm880).clone(),
            nm940: buffers.optical(Wavelength::Nm940).clone(),
            stats: SinkStats::default(),
        }
    }
}

impl DataSink<DecodedSample> for FnirsLiveSink {
    fn name(&self) -> &'static str {
        "fnirs-live"
    }

    #[allow(clippy::cast_precision_loss)]
    fn accept(&mut self, sample: &DecodedSample) -> AcquisitionResult<()> {
        let nm880 = sample.channel(Wavelength::Nm880);
        let nm940 = sample.channel(Wavelength::Nm940);
        debug!(index = sample.packet.index_or_time(), nm880, nm940, "fNIRS");

        self.nm880.lock().push(nm880 as f64);
        self.nm940.lock().push(nm940 as f64);

        self.stats.accepted += 1;
        self.stats.records += 2;
        Ok(())
    }

    fn stats(&self) -> SinkStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biostation_core::{DisplayPacket, FnirsPacket, EEG_FRAME_WIDTH};

    #[test]
    fn test_eeg_live_pushes_tracked_frame() {
        let buffers = LiveBuffers::new().unwrap();
        let mut sink = EegLiveSink::new(buffers.eeg.clone());

        let mut first = [0.0f32; EEG_FRAME_WIDTH];
        for (i, v) in first.iter_mut().enumerate() {
            *v = i as f32;
        }
        let batch = EegSampleBatch::new(0.0, vec![first, [99.0; EEG_FRAME_WIDTH]]);
        sink.accept(&batch).unwrap();

        let eeg = buffers.eeg.lock();
        let newest: Vec<f64> = eeg.values().take(3).collect();
        assert_eq!(newest, vec![11.0, 10.0, 9.0]);
        assert_eq!(sink.stats().records, 12);
    }

    #[test]
    fn test_eeg_live_ignores_missing_frame() {
        let buffers = LiveBuffers::new().unwrap();
        let mut sink = EegLiveSink::tracking(buffers.eeg.clone(), 3);

        sink.accept(&EegSampleBatch::new(0.0, vec![[1.0; EEG_FRAME_WIDTH]])).unwrap();

        assert_eq!(buffers.eeg.lock().latest(), 0.0);
        assert_eq!(sink.stats(), SinkStats { accepted: 1, records: 0 });
    }

    #[test]
    fn test_fnirs_live_splits_wavelengths() {
        let buffers = LiveBuffers::new().unwrap();
        let mut sink = FnirsLiveSink::new(&buffers);

        let packet = DisplayPacket { index: 3, hemo_1: -120, hemo_2: 450, ..Default::default() };
        sink.accept(&DecodedSample::new(1.0, FnirsPacket::Display(packet))).unwrap();

        assert_eq!(buffers.nm880.lock().latest(), -120.0);
        assert_eq!(buffers.nm940.lock().latest(), 450.0);
        assert_eq!(buffers.eeg.lock().latest(), 0.0);
    }
}
