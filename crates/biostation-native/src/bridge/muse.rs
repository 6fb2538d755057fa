//! BLE driver for classic Muse headbands
//!
//! Classic firmware exposes one notify characteristic per electrode. Each
//! notification is 20 bytes: a big-endian `u16` packet index followed by
//! twelve 12-bit samples packed big-endian. Samples are centred on 2048 and
//! scaled by 0.48828125 µV/LSB.
//!
//! The driver collects one frame per electrode for the same packet index and
//! hands the complete set to the callback as one batch. A packet index that
//! changes before the set is complete discards the partial batch.
//!
//! # Characteristics
//!
//! - `273e0001-...` - Control (write commands, notify responses)
//! - `273e0003-...` .. `273e0006-...` - TP9, AF7, AF8, TP10
//! - `273e0007-...` - Right AUX (optional)

use std::time::Duration;

use async_trait::async_trait;
use biostation_core::{EegFrame, EegSampleBatch, EEG_FRAME_WIDTH};
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::ble::{find_characteristic, open_link};
use super::{BatchCallback, EegDevice};
use crate::clock::unix_time_secs;
use crate::error::{AcquisitionError, AcquisitionResult};

/// Muse GATT service UUID
pub const MUSE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe8d_0000_1000_8000_00805f9b34fb);

/// Control characteristic UUID
pub const MUSE_CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x273e0001_4c4d_454d_96be_f03bac821358);

/// Electrode characteristics in batch order: TP9, AF7, AF8, TP10, AUX.
pub const MUSE_EEG_CHAR_UUIDS: [Uuid; 5] = [
    Uuid::from_u128(0x273e0003_4c4d_454d_96be_f03bac821358),
    Uuid::from_u128(0x273e0004_4c4d_454d_96be_f03bac821358),
    Uuid::from_u128(0x273e0005_4c4d_454d_96be_f03bac821358),
    Uuid::from_u128(0x273e0006_4c4d_454d_96be_f03bac821358),
    Uuid::from_u128(0x273e0007_4c4d_454d_96be_f03bac821358),
];

/// Electrode labels matching [`MUSE_EEG_CHAR_UUIDS`].
pub const MUSE_ELECTRODES: [&str; 5] = ["TP9", "AF7", "AF8", "TP10", "AUX"];

/// Microvolts per LSB of a classic sample.
const MICROVOLTS_PER_LSB: f32 = 0.488_281_25;

/// Length of a classic EEG notification.
const NOTIFICATION_LEN: usize = 2 + EEG_FRAME_WIDTH * 3 / 2;

/// Command sequence that starts streaming: halt, preset 21, start, resume.
const START_SEQUENCE: [&str; 4] = ["h", "p21", "s", "d"];

/// Delay between consecutive control commands.
const COMMAND_GAP: Duration = Duration::from_millis(50);

// ============================================================================
// Encoding
// ============================================================================

/// Frame a control command: length byte, ASCII command, newline.
pub fn encode_command(command: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(command.len() + 2);
    #[allow(clippy::cast_possible_truncation)]
    out.push(command.len() as u8 + 1);
    out.extend_from_slice(command.as_bytes());
    out.push(b'\n');
    out
}

/// Unpack twelve 12-bit big-endian samples into microvolts.
///
/// Returns `None` unless `data` is exactly 18 bytes.
pub fn decode_eeg_samples(data: &[u8]) -> Option<EegFrame> {
    if data.len() != EEG_FRAME_WIDTH * 3 / 2 {
        return None;
    }

    let mut frame = [0.0f32; EEG_FRAME_WIDTH];
    for (pair, chunk) in frame.chunks_exact_mut(2).zip(data.chunks_exact(3)) {
        let first = (u16::from(chunk[0]) << 4) | (u16::from(chunk[1]) >> 4);
        let second = (u16::from(chunk[1] & 0x0F) << 8) | u16::from(chunk[2]);
        pair[0] = (f32::from(first) - 2048.0) * MICROVOLTS_PER_LSB;
        pair[1] = (f32::from(second) - 2048.0) * MICROVOLTS_PER_LSB;
    }
    Some(frame)
}

/// Split a classic notification into its packet index and frame.
pub fn parse_eeg_notification(data: &[u8]) -> Option<(u16, EegFrame)> {
    if data.len() != NOTIFICATION_LEN {
        return None;
    }
    let index = u16::from_be_bytes([data[0], data[1]]);
    decode_eeg_samples(&data[2..]).map(|frame| (index, frame))
}

// ============================================================================
// Batch Assembly
// ============================================================================

/// Collects one frame per electrode for a packet index.
#[derive(Debug)]
pub struct BatchAssembler {
    index: Option<u16>,
    frames: Vec<Option<EegFrame>>,
    discarded: u64,
}

impl BatchAssembler {
    /// Assembler for `electrodes` channels.
    pub fn new(electrodes: usize) -> Self {
        Self { index: None, frames: vec![None; electrodes], discarded: 0 }
    }

    /// Add a frame; returns the complete batch once every electrode has
    /// reported for the same index.
    pub fn push(&mut self, electrode: usize, index: u16, frame: EegFrame) -> Option<Vec<EegFrame>> {
        if electrode >= self.frames.len() {
            return None;
        }

        if self.index != Some(index) {
            if self.frames.iter().any(Option::is_some) {
                self.discarded += 1;
                trace!(previous = ?self.index, index, "Discarding incomplete EEG batch");
            }
            self.frames.iter_mut().for_each(|slot| *slot = None);
            self.index = Some(index);
        }
        self.frames[electrode] = Some(frame);

        if self.frames.iter().all(Option::is_some) {
            self.index = None;
            return self.frames.iter_mut().map(Option::take).collect();
        }
        None
    }

    /// Incomplete batches thrown away so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

// ============================================================================
// Headset
// ============================================================================

struct MuseLink {
    peripheral: Peripheral,
    control: Characteristic,
    pump: Option<JoinHandle<()>>,
}

/// Classic Muse headband over BLE.
pub struct MuseHeadset {
    address: String,
    scan_timeout: Duration,
    electrodes: usize,
    link: Mutex<Option<MuseLink>>,
}

impl MuseHeadset {
    /// Headband at `address` streaming the four scalp electrodes.
    pub fn new(address: impl Into<String>, scan_timeout: Duration) -> Self {
        Self { address: address.into(), scan_timeout, electrodes: 4, link: Mutex::new(None) }
    }

    /// Also stream the right AUX electrode as a fifth frame.
    #[must_use]
    pub fn with_aux(mut self) -> Self {
        self.electrodes = 5;
        self
    }

    async fn send(&self, peripheral: &Peripheral, control: &Characteristic, command: &str) -> AcquisitionResult<()> {
        peripheral
            .write(control, &encode_command(command), WriteType::WithoutResponse)
            .await
            .map_err(|e| AcquisitionError::transport(&self.address, e))?;
        debug!(device = %self.address, command, "Sent control command");
        Ok(())
    }
}

#[async_trait]
impl EegDevice for MuseHeadset {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> AcquisitionResult<()> {
        let peripheral = open_link(&self.address, self.scan_timeout).await?;

        if !peripheral.services().iter().any(|s| s.uuid == MUSE_SERVICE_UUID) {
            let _ = peripheral.disconnect().await;
            return Err(AcquisitionError::connection(&self.address, "Muse service not found"));
        }

        let Some(control) = find_characteristic(&peripheral, MUSE_CONTROL_CHAR_UUID) else {
            let _ = peripheral.disconnect().await;
            return Err(AcquisitionError::connection(&self.address, "control characteristic not found"));
        };
        if let Err(e) = peripheral.subscribe(&control).await {
            let _ = peripheral.disconnect().await;
            return Err(AcquisitionError::connection(&self.address, e));
        }

        for (uuid, label) in MUSE_EEG_CHAR_UUIDS.iter().zip(MUSE_ELECTRODES).take(self.electrodes) {
            let Some(characteristic) = find_characteristic(&peripheral, *uuid) else {
                let _ = peripheral.disconnect().await;
                return Err(AcquisitionError::connection(
                    &self.address,
                    format!("{label} characteristic not found"),
                ));
            };
            if let Err(e) = peripheral.subscribe(&characteristic).await {
                let _ = peripheral.disconnect().await;
                return Err(AcquisitionError::connection(
                    &self.address,
                    format!("{label} subscribe failed: {e}"),
                ));
            }
        }
        info!(device = %self.address, electrodes = self.electrodes, "Subscribed to EEG notifications");

        *self.link.lock().await = Some(MuseLink { peripheral, control, pump: None });
        Ok(())
    }

    async fn start(&self, on_batch: BatchCallback) -> AcquisitionResult<()> {
        let mut guard = self.link.lock().await;
        let link = guard
            .as_mut()
            .ok_or_else(|| AcquisitionError::transport(&self.address, "not connected"))?;

        let mut stream = link
            .peripheral
            .notifications()
            .await
            .map_err(|e| AcquisitionError::transport(&self.address, e))?;

        let electrodes = self.electrodes;
        let device = self.address.clone();
        let pump = tokio::spawn(async move {
            let mut assembler = BatchAssembler::new(electrodes);
            while let Some(notification) = stream.next().await {
                let Some(electrode) = MUSE_EEG_CHAR_UUIDS.iter().position(|u| *u == notification.uuid) else {
                    continue;
                };
                let Some((index, frame)) = parse_eeg_notification(&notification.value) else {
                    trace!(device = %device, len = notification.value.len(), "Ignoring short EEG notification");
                    continue;
                };
                if let Some(frames) = assembler.push(electrode, index, frame) {
                    on_batch(EegSampleBatch::new(unix_time_secs(), frames));
                }
            }
            debug!(device = %device, discarded = assembler.discarded(), "EEG notification stream ended");
        });
        if let Some(previous) = link.pump.replace(pump) {
            previous.abort();
        }

        for command in START_SEQUENCE {
            self.send(&link.peripheral, &link.control, command).await?;
            tokio::time::sleep(COMMAND_GAP).await;
        }
        info!(device = %self.address, "EEG streaming started");
        Ok(())
    }

    async fn disconnect(&self) -> AcquisitionResult<()> {
        let Some(mut link) = self.link.lock().await.take() else {
            return Ok(());
        };
        if let Some(pump) = link.pump.take() {
            pump.abort();
        }

        if let Err(e) = self.send(&link.peripheral, &link.control, "h").await {
            debug!("Halt before disconnect failed: {e}");
        }
        let result = link
            .peripheral
            .disconnect()
            .await
            .map_err(|e| AcquisitionError::transport(&self.address, e));
        info!(device = %self.address, "Disconnected");
        result
    }
}
