//! Rolling buffers for live display.
//!
//! A [`CircularBuffer`] always holds exactly `capacity` values, newest first,
//! zero-padded until it has seen `capacity` pushes. Each buffer carries a
//! fixed x-axis for plotting.
//!
//! Buffers are written by one session and read by the redraw task, so they
//! are shared as [`SharedBuffer`] and every access goes through the mutex.

use std::collections::VecDeque;
use std::sync::Arc;

use biostation_core::Wavelength;
use parking_lot::Mutex;

use crate::error::{AcquisitionError, AcquisitionResult};

/// Buffer shared between a writer session and the redraw reader.
pub type SharedBuffer = Arc<Mutex<CircularBuffer>>;

/// Fixed-capacity, newest-first numeric ring.
#[derive(Clone, Debug)]
pub struct CircularBuffer {
    name: String,
    values: VecDeque<f64>,
    x_axis: Vec<f64>,
    capacity: usize,
}

impl CircularBuffer {
    /// Create a buffer of `capacity` zeros with `capacity` evenly spaced
    /// x-values from `x_start` to `x_stop` inclusive.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::ConfigurationError`] if `capacity` is zero.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        x_start: f64,
        x_stop: f64,
    ) -> AcquisitionResult<Self> {
        let name = name.into();
        if capacity == 0 {
            return Err(AcquisitionError::ConfigurationError(format!(
                "buffer '{name}' must have a non-zero capacity"
            )));
        }

        Ok(Self {
            name,
            values: VecDeque::from(vec![0.0; capacity]),
            x_axis: linspace(x_start, x_stop, capacity),
            capacity,
        })
    }

    /// Wrap the buffer for sharing.
    pub fn shared(self) -> SharedBuffer {
        Arc::new(Mutex::new(self))
    }

    /// Insert a value at the front, evicting the oldest.
    pub fn push(&mut self, value: f64) {
        self.values.pop_back();
        self.values.push_front(value);
    }

    /// Values, newest first. Always yields exactly `capacity` items.
    pub fn values(&self) -> impl ExactSizeIterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    /// Plot x-axis.
    pub fn x_axis(&self) -> &[f64] {
        &self.x_axis
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recently pushed value (zero before the first push).
    pub fn latest(&self) -> f64 {
        self.values.front().copied().unwrap_or_default()
    }

    /// Buffer name used as the plot title.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of latest, minimum, and maximum values.
    pub fn summary(&self) -> BufferSummary {
        let (min, max) = self
            .values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

        BufferSummary { latest: self.latest(), min, max }
    }
}

/// Point-in-time statistics of a buffer, used by the redraw task.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BufferSummary {
    /// Newest value
    pub latest: f64,
    /// Smallest value in the window
    pub min: f64,
    /// Largest value in the window
    pub max: f64,
}

/// `num` evenly spaced points over `[start, stop]`.
fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            #[allow(clippy::cast_precision_loss)]
            let step = (stop - start) / (num - 1) as f64;
            #[allow(clippy::cast_precision_loss)]
            let mut axis: Vec<f64> = (0..num).map(|i| start + step * i as f64).collect();
            axis[num - 1] = stop;
            axis
        }
    }
}

// ============================================================================
// Live Display Buffers
// ============================================================================

/// EEG display window (points).
pub const EEG_DISPLAY_POINTS: usize = 2560;
/// EEG display x-range end.
pub const EEG_DISPLAY_SPAN: f64 = 256.0;
/// fNIRS display window (points) per wavelength.
pub const FNIRS_DISPLAY_POINTS: usize = 50;
/// fNIRS display x-range end.
pub const FNIRS_DISPLAY_SPAN: f64 = 5.0;

/// The three buffers of the live dashboard.
#[derive(Clone, Debug)]
pub struct LiveBuffers {
    /// EEG trace
    pub eeg: SharedBuffer,
    /// 880 nm optical channel
    pub nm880: SharedBuffer,
    /// 940 nm optical channel
    pub nm940: SharedBuffer,
}

impl LiveBuffers {
    /// Create the dashboard buffers with their default windows.
    ///
    /// # Errors
    ///
    /// Propagates buffer construction errors.
    pub fn new() -> AcquisitionResult<Self> {
        Ok(Self {
            eeg: CircularBuffer::new("EEG", EEG_DISPLAY_POINTS, 0.0, EEG_DISPLAY_SPAN)?.shared(),
            nm880: CircularBuffer::new(
                Wavelength::Nm880.label(),
                FNIRS_DISPLAY_POINTS,
                0.0,
                FNIRS_DISPLAY_SPAN,
            )?
            .shared(),
            nm940: CircularBuffer::new(
                Wavelength::Nm940.label(),
                FNIRS_DISPLAY_POINTS,
                0.0,
                FNIRS_DISPLAY_SPAN,
            )?
            .shared(),
        })
    }

    /// Buffers in dashboard order.
    pub fn all(&self) -> [&SharedBuffer; 3] {
        [&self.eeg, &self.nm880, &self.nm940]
    }

    /// Buffer for an optical wavelength.
    pub fn optical(&self, wavelength: Wavelength) -> &SharedBuffer {
        match wavelength {
            Wavelength::Nm880 => &self.nm880,
            Wavelength::Nm940 => &self.nm940,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_zero_padded() {
        let buffer = CircularBuffer::new("test", 4, 0.0, 3.0).unwrap();

        assert_eq!(buffer.values().len(), 4);
        assert!(buffer.values().all(|v| v == 0.0));
        assert_eq!(buffer.x_axis(), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(buffer.latest(), 0.0);
    }

    #[test]
    fn test_push_is_newest_first() {
        let mut buffer = CircularBuffer::new("test", 2, 0.0, 1.0).unwrap();
        for v in [1.0, 2.0, 3.0] {
            buffer.push(v);
        }

        assert_eq!(buffer.values().collect::<Vec<_>>(), vec![3.0, 2.0]);
        assert_eq!(buffer.latest(), 3.0);
    }

    #[test]
    fn test_partial_fill_keeps_padding() {
        let mut buffer = CircularBuffer::new("test", 5, 0.0, 1.0).unwrap();
        buffer.push(7.0);
        buffer.push(8.0);

        assert_eq!(buffer.values().collect::<Vec<_>>(), vec![8.0, 7.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_length_is_invariant() {
        let mut buffer = CircularBuffer::new("test", 3, 0.0, 1.0).unwrap();
        for i in 0..100 {
            buffer.push(f64::from(i));
            assert_eq!(buffer.values().len(), 3);
        }
        assert_eq!(buffer.values().collect::<Vec<_>>(), vec![99.0, 98.0, 97.0]);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = CircularBuffer::new("empty", 0, 0.0, 1.0);
        assert!(matches!(result, Err(AcquisitionError::ConfigurationError(_))));
    }

    #[test]
    fn test_single_point_axis() {
        let buffer = CircularBuffer::new("one", 1, 2.5, 9.0).unwrap();
        assert_eq!(buffer.x_axis(), &[2.5]);
    }

    #[test]
    fn test_summary() {
        let mut buffer = CircularBuffer::new("test", 3, 0.0, 1.0).unwrap();
        buffer.push(-4.0);
        buffer.push(10.0);

        let summary = buffer.summary();
        assert_eq!(summary.latest, 10.0);
        assert_eq!(summary.min, -4.0);
        assert_eq!(summary.max, 10.0);
    }

    #[test]
    fn test_live_buffer_defaults() {
        let live = LiveBuffers::new().unwrap();

        let eeg = live.eeg.lock();
        assert_eq!(eeg.capacity(), 2560);
        assert_eq!(eeg.x_axis().last().copied(), Some(256.0));
        drop(eeg);

        let nm940 = live.optical(Wavelength::Nm940).lock();
        assert_eq!(nm940.capacity(), 50);
        assert_eq!(nm940.name(), "fNIRS, 940nm");
    }
}
