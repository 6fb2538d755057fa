//! Append-only CSV logs.
//!
//! One file per device per run:
//!
//! ```text
//! <output>/fnirs/<start>_fnirs.csv   capture_time,packet_index_or_time,field_a,field_b
//! <output>/eeg/<start>_eeg.csv       capture_time,channel_index_in_batch,c0,...,c11
//! ```
//!
//! `<start>` is the run start time in Unix seconds with millisecond
//! precision, shared by both files so they pair up on disk.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use biostation_core::{DecodedSample, EegSampleBatch};
use tracing::info;

use super::{DataSink, SinkStats};
use crate::clock::unix_time_secs;
use crate::error::{AcquisitionError, AcquisitionResult};

const FNIRS_SINK: &str = "fnirs-log";
const EEG_SINK: &str = "eeg-log";

/// Header of the fNIRS log.
pub const FNIRS_HEADER: &str = "capture_time,packet_index_or_time,field_a,field_b";

/// Header of the EEG log.
pub const EEG_HEADER: &str =
    "capture_time,channel_index_in_batch,c0,c1,c2,c3,c4,c5,c6,c7,c8,c9,c10,c11";

// ============================================================================
// Run Stamp
// ============================================================================

/// Start time of a run, used to name its log files.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RunStamp(f64);

impl RunStamp {
    /// Stamp for the current instant.
    pub fn now() -> Self {
        Self(unix_time_secs())
    }

    /// Stamp for a given Unix time in seconds.
    pub const fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    /// Unix time in seconds.
    pub const fn secs(self) -> f64 {
        self.0
    }

    /// Log path for a device kind (`"eeg"` or `"fnirs"`).
    pub fn log_path(self, output_dir: &Path, kind: &str) -> PathBuf {
        output_dir.join(kind).join(format!("{:.3}_{kind}.csv", self.0))
    }
}

// ============================================================================
// CSV Writer
// ============================================================================

/// Line-oriented CSV writer that maps I/O errors to sink failures.
#[derive(Debug)]
pub struct CsvLog<W: Write> {
    sink: &'static str,
    writer: W,
    rows: u64,
}

impl<W: Write> CsvLog<W> {
    /// Wrap a writer and emit the header row.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::SinkWriteFailure`] if the header cannot be written.
    pub fn new(sink: &'static str, mut writer: W, header: &str) -> AcquisitionResult<Self> {
        writeln!(writer, "{header}").map_err(|e| AcquisitionError::sink(sink, e))?;
        Ok(Self { sink, writer, rows: 0 })
    }

    /// Write one row; `fields` writes the row body without the line ending.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::SinkWriteFailure`] on I/O failure.
    pub fn write_row(
        &mut self,
        fields: impl FnOnce(&mut W) -> io::Result<()>,
    ) -> AcquisitionResult<()> {
        fields(&mut self.writer)
            .and_then(|()| self.writer.write_all(b"\n"))
            .map_err(|e| AcquisitionError::sink(self.sink, e))?;
        self.rows += 1;
        Ok(())
    }

    /// Flush the underlying writer.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::SinkWriteFailure`] on I/O failure.
    pub fn flush(&mut self) -> AcquisitionResult<()> {
        self.writer.flush().map_err(|e| AcquisitionError::sink(self.sink, e))
    }

    /// Data rows written (header excluded).
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn create_log_file(path: &Path, sink: &'static str) -> AcquisitionResult<BufWriter<File>> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| AcquisitionError::sink(sink, e))?;
    }
    let file = File::create(path).map_err(|e| AcquisitionError::sink(sink, e))?;
    info!(path = %path.display(), "Created {sink}");
    Ok(BufWriter::new(file))
}

// ============================================================================
// fNIRS Log
// ============================================================================

/// Persistent log of decoded fNIRS packets.
#[derive(Debug)]
pub struct FnirsLog<W: Write = BufWriter<File>> {
    csv: CsvLog<W>,
    accepted: u64,
}

impl FnirsLog {
    /// Create `<output_dir>/fnirs/<stamp>_fnirs.csv`.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::SinkWriteFailure`] if the directory or
    /// file cannot be created.
    pub fn create(output_dir: &Path, stamp: RunStamp) -> AcquisitionResult<Self> {
        let writer = create_log_file(&stamp.log_path(output_dir, "fnirs"), FNIRS_SINK)?;
        Self::from_writer(writer)
    }
}

impl<W: Write> FnirsLog<W> {
    /// Log into an arbitrary writer.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::SinkWriteFailure`] if the header cannot be written.
    pub fn from_writer(writer: W) -> AcquisitionResult<Self> {
        Ok(Self { csv: CsvLog::new(FNIRS_SINK, writer, FNIRS_HEADER)?, accepted: 0 })
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.csv.into_inner()
    }
}

impl<W: Write + Send> DataSink<DecodedSample> for FnirsLog<W> {
    fn name(&self) -> &'static str {
        FNIRS_SINK
    }

    fn accept(&mut self, sample: &DecodedSample) -> AcquisitionResult<()> {
        let packet = sample.packet;
        self.csv.write_row(|w| {
            write!(
                w,
                "{:.6},{},{},{}",
                sample.capture_time,
                packet.index_or_time(),
                packet.channel_a(),
                packet.channel_b()
            )
        })?;
        self.accepted += 1;
        Ok(())
    }

    fn flush(&mut self) -> AcquisitionResult<()> {
        self.csv.flush()
    }

    fn stats(&self) -> SinkStats {
        SinkStats { accepted: self.accepted, records: self.csv.rows() }
    }
}

// ============================================================================
// EEG Log
// ============================================================================

/// Persistent log of EEG batches, one row per frame.
#[derive(Debug)]
pub struct EegLog<W: Write = BufWriter<File>> {
    csv: CsvLog<W>,
    accepted: u64,
}

impl EegLog {
    /// Create `<output_dir>/eeg/<stamp>_eeg.csv`.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::SinkWriteFailure`] if the directory or
    /// file cannot be created.
    pub fn create(output_dir: &Path, stamp: RunStamp) -> AcquisitionResult<Self> {
        let writer = create_log_file(&stamp.log_path(output_dir, "eeg"), EEG_SINK)?;
        Self::from_writer(writer)
    }
}

impl<W: Write> EegLog<W> {
    /// Log into an arbitrary writer.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::SinkWriteFailure`] if the header cannot be written.
    pub fn from_writer(writer: W) -> AcquisitionResult<Self> {
        Ok(Self { csv: CsvLog::new(EEG_SINK, writer, EEG_HEADER)?, accepted: 0 })
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.csv.into_inner()
    }
}

impl<W: Write + Send> DataSink<EegSampleBatch> for EegLog<W> {
    fn name(&self) -> &'static str {
        EEG_SINK
    }

    fn accept(&mut self, batch: &EegSampleBatch) -> AcquisitionResult<()> {
        for (index, frame) in batch.frames.iter().enumerate() {
            self.csv.write_row(|w| {
                write!(w, "{:.6},{index}", batch.capture_time)?;
                for value in frame {
                    write!(w, ",{value}")?;
                }
                Ok(())
            })?;
        }
        self.accepted += 1;
        Ok(())
    }

    fn flush(&mut self) -> AcquisitionResult<()> {
        self.csv.flush()
    }

    fn stats(&self) -> SinkStats {
        SinkStats { accepted: self.accepted, records: self.csv.rows() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biostation_core::{decode, PacketLayout, EEG_FRAME_WIDTH};

    struct BrokenDisk;

    impl Write for BrokenDisk {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn sample(capture_time: f64) -> DecodedSample {
        let raw = [0x00, 0x05, 0x00, 0x00, 0x01, 0x2C, 0x00, 0x00, 0x02, 0x58, 0x00, 0x00];
        DecodedSample::new(capture_time, decode(PacketLayout::Logging, &raw).unwrap())
    }

    #[test]
    fn test_run_stamp_paths() {
        let stamp = RunStamp::from_secs(1_700_000_000.123_4);
        let path = stamp.log_path(Path::new("/data"), "fnirs");
        assert_eq!(path, PathBuf::from("/data/fnirs/1700000000.123_fnirs.csv"));
    }

    #[test]
    fn test_fnirs_log_rows() {
        let mut log = FnirsLog::from_writer(Vec::new()).unwrap();
        log.accept(&sample(12.5)).unwrap();
        log.accept(&sample(13.0)).unwrap();

        assert_eq!(log.stats(), SinkStats { accepted: 2, records: 2 });

        let text = String::from_utf8(log.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], FNIRS_HEADER);
        assert_eq!(lines[1], "12.500000,5,300,600");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_eeg_log_writes_every_frame() {
        let mut frame = [0.0f32; EEG_FRAME_WIDTH];
        frame[0] = 1.5;
        frame[11] = -2.0;
        let batch = EegSampleBatch::new(100.0, vec![frame; 5]);

        let mut log = EegLog::from_writer(Vec::new()).unwrap();
        log.accept(&batch).unwrap();

        assert_eq!(log.stats(), SinkStats { accepted: 1, records: 5 });

        let text = String::from_utf8(log.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], EEG_HEADER);
        assert_eq!(lines[1], "100.000000,0,1.5,0,0,0,0,0,0,0,0,0,0,-2");
        assert!(lines[5].starts_with("100.000000,4,"));
        assert_eq!(lines[1].split(',').count(), 2 + EEG_FRAME_WIDTH);
    }

    #[test]
    fn test_create_makes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = RunStamp::from_secs(42.0);

        let mut fnirs = FnirsLog::create(dir.path(), stamp).unwrap();
        fnirs.accept(&sample(42.5)).unwrap();
        fnirs.flush().unwrap();
        let _eeg = EegLog::create(dir.path(), stamp).unwrap();

        let fnirs_path = dir.path().join("fnirs").join("42.000_fnirs.csv");
        let text = fs::read_to_string(fnirs_path).unwrap();
        assert!(text.starts_with(FNIRS_HEADER));
        assert!(text.contains("42.500000,5,300,600"));
        assert!(dir.path().join("eeg").join("42.000_eeg.csv").exists());
    }

    #[test]
    fn test_io_error_is_sink_failure() {
        let result = FnirsLog::from_writer(BrokenDisk);
        assert!(matches!(
            result,
            Err(AcquisitionError::SinkWriteFailure { sink: "fnirs-log", .. })
        ));
    }
}
