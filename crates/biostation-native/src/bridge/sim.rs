//! Simulated devices.
//!
//! Both devices validate their address and go through the same
//! connect/subscribe/start sequence as the BLE backends, so a station run
//! with `--simulate` exercises every code path except the radio. They come
//! in two flavours:
//!
//! - synthetic: generate sine-wave data at the real devices' rates
//! - scripted: replay a fixed list of payloads or batches, then go idle

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use biostation_core::protocol::{cccd_handle, NOTIFY_ENABLE};
use biostation_core::{
    DisplayPacket, EegFrame, EegSampleBatch, LoggingPacket, PacketLayout, EEG_FRAME_WIDTH,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{parse_address, BatchCallback, EegDevice, FnirsPeripheral};
use crate::clock::unix_time_secs;
use crate::error::{AcquisitionError, AcquisitionResult};

/// Value handle of the simulated data characteristic.
pub const SIM_DATA_VALUE_HANDLE: u16 = 0x000E;

/// Packet period of the glasses (10 Hz).
const FNIRS_PERIOD: Duration = Duration::from_millis(100);

/// Batch period of the headband: 12 samples at 256 Hz.
const EEG_PERIOD: Duration = Duration::from_micros(46_875);

/// Electrodes produced by the synthetic headband.
const EEG_ELECTRODES: usize = 4;

// ============================================================================
// Simulated fNIRS Peripheral
// ============================================================================

/// A descriptor write recorded by [`SimulatedPeripheral::subscribe`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    /// Attribute handle written
    pub handle: u16,
    /// Value written
    pub value: [u8; 2],
}

#[derive(Debug)]
enum PeripheralSource {
    Synthetic { next_index: u32 },
    Scripted(VecDeque<Vec<u8>>),
}

/// Simulated fNIRS glasses.
#[derive(Debug)]
pub struct SimulatedPeripheral {
    address: String,
    layout: PacketLayout,
    source: Mutex<PeripheralSource>,
    subscription: Mutex<Option<DescriptorWrite>>,
    connected: AtomicBool,
    refuse_connect: Option<String>,
    refuse_subscribe: Option<String>,
    next_due: Mutex<Option<Instant>>,
    disconnects: AtomicU32,
}

impl SimulatedPeripheral {
    /// Glasses that emit synthetic packets at 10 Hz.
    pub fn new(address: impl Into<String>, layout: PacketLayout) -> Self {
        Self::with_source(address, layout, PeripheralSource::Synthetic { next_index: 0 })
    }

    /// Glasses that replay `payloads` in order, then stay idle.
    pub fn scripted(
        address: impl Into<String>,
        layout: PacketLayout,
        payloads: impl IntoIterator<Item = Vec<u8>>,
    ) -> Self {
        Self::with_source(
            address,
            layout,
            PeripheralSource::Scripted(payloads.into_iter().collect()),
        )
    }

    /// Glasses that refuse every connection attempt.
    #[must_use]
    pub fn refusing(mut self, reason: impl Into<String>) -> Self {
        self.refuse_connect = Some(reason.into());
        self
    }

    /// Glasses that connect but reject the notification subscription.
    #[must_use]
    pub fn refusing_subscribe(mut self, reason: impl Into<String>) -> Self {
        self.refuse_subscribe = Some(reason.into());
        self
    }

    fn with_source(address: impl Into<String>, layout: PacketLayout, source: PeripheralSource) -> Self {
        Self {
            address: address.into(),
            layout,
            source: Mutex::new(source),
            subscription: Mutex::new(None),
            connected: AtomicBool::new(false),
            refuse_connect: None,
            refuse_subscribe: None,
            next_due: Mutex::new(None),
            disconnects: AtomicU32::new(0),
        }
    }

    /// Queue another payload on a scripted peripheral.
    pub fn push(&self, payload: Vec<u8>) {
        if let PeripheralSource::Scripted(queue) = &mut *self.source.lock() {
            queue.push_back(payload);
        }
    }

    /// Whether the peripheral is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The CCCD write performed by the last subscribe, if any.
    pub fn descriptor_write(&self) -> Option<DescriptorWrite> {
        *self.subscription.lock()
    }

    /// Number of disconnects performed.
    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn next_payload(&self) -> Option<Vec<u8>> {
        match &mut *self.source.lock() {
            PeripheralSource::Scripted(queue) => queue.pop_front(),
            PeripheralSource::Synthetic { next_index } => {
                let index = *next_index;
                *next_index = next_index.wrapping_add(1);
                Some(synthetic_packet(self.layout, index).to_vec())
            }
        }
    }

    fn is_synthetic(&self) -> bool {
        matches!(*self.source.lock(), PeripheralSource::Synthetic { .. })
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn synthetic_packet(layout: PacketLayout, index: u32) -> [u8; 12] {
    let phase = TAU * f64::from(index % 100) / 100.0;
    match layout {
        PacketLayout::Logging => LoggingPacket {
            index_or_time: index as u16,
            short_path: (30_000.0 + 1_200.0 * phase.sin()) as u32,
            long_path: (18_000.0 + 900.0 * (phase + 0.4).sin()) as u32,
            trailer: 0,
        }
        .to_bytes(),
        PacketLayout::Display => DisplayPacket {
            index: index as u8,
            reserved: 0,
            hemo_1: (250.0 * phase.sin()) as i32,
            hemo_2: (180.0 * phase.cos()) as i32,
            trailer_a: 0,
            trailer_b: 0,
        }
        .to_bytes(),
    }
}

#[async_trait]
impl FnirsPeripheral for SimulatedPeripheral {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> AcquisitionResult<()> {
        parse_address(&self.address)?;
        if let Some(reason) = &self.refuse_connect {
            return Err(AcquisitionError::connection(&self.address, reason));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(device = %self.address, "Simulated fNIRS glasses connected");
        Ok(())
    }

    async fn subscribe(&self) -> AcquisitionResult<()> {
        if !self.is_connected() {
            return Err(AcquisitionError::connection(&self.address, "not connected"));
        }
        if let Some(reason) = &self.refuse_subscribe {
            return Err(AcquisitionError::connection(&self.address, reason));
        }
        let write = DescriptorWrite {
            handle: cccd_handle(SIM_DATA_VALUE_HANDLE),
            value: NOTIFY_ENABLE,
        };
        *self.subscription.lock() = Some(write);
        debug!(handle = write.handle, "Notifications enabled");
        Ok(())
    }

    async fn wait_for_notification(&self, timeout: Duration) -> AcquisitionResult<Option<Vec<u8>>> {
        if !self.is_connected() {
            return Err(AcquisitionError::transport(&self.address, "not connected"));
        }
        if self.descriptor_write().is_none() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }

        if self.is_synthetic() {
            // Packets keep a fixed cadence however short the wait is.
            let now = Instant::now();
            let due = *self.next_due.lock().get_or_insert(now + FNIRS_PERIOD);
            if due > now + timeout {
                tokio::time::sleep(timeout).await;
                return Ok(None);
            }
            tokio::time::sleep_until(due).await;
            *self.next_due.lock() = Some(due + FNIRS_PERIOD);
            return Ok(self.next_payload());
        }

        match self.next_payload() {
            Some(payload) => Ok(Some(payload)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn disconnect(&self) -> AcquisitionResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            info!(device = %self.address, "Simulated fNIRS glasses disconnected");
        }
        *self.subscription.lock() = None;
        *self.next_due.lock() = None;
        Ok(())
    }
}

// ============================================================================
// Simulated EEG Headset
// ============================================================================

#[derive(Debug)]
enum HeadsetSource {
    Synthetic,
    Scripted(Vec<Vec<EegFrame>>),
}

/// Simulated EEG headband.
#[derive(Debug)]
pub struct SimulatedHeadset {
    address: String,
    source: Mutex<HeadsetSource>,
    pump: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    refuse_connect: Option<String>,
    disconnects: AtomicU32,
}

impl SimulatedHeadset {
    /// Headband that emits four synthetic electrode frames every 46.875 ms.
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_source(address, HeadsetSource::Synthetic)
    }

    /// Headband that delivers `batches` once streaming starts, then stays
    /// idle until disconnected.
    pub fn scripted(address: impl Into<String>, batches: impl IntoIterator<Item = Vec<EegFrame>>) -> Self {
        Self::with_source(address, HeadsetSource::Scripted(batches.into_iter().collect()))
    }

    /// Headband that refuses every connection attempt.
    #[must_use]
    pub fn refusing(mut self, reason: impl Into<String>) -> Self {
        self.refuse_connect = Some(reason.into());
        self
    }

    fn with_source(address: impl Into<String>, source: HeadsetSource) -> Self {
        Self {
            address: address.into(),
            source: Mutex::new(source),
            pump: Mutex::new(None),
            connected: AtomicBool::new(false),
            refuse_connect: None,
            disconnects: AtomicU32::new(0),
        }
    }

    /// Whether the headband is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of disconnects performed.
    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn synthetic_frames(tick: u64) -> Vec<EegFrame> {
    (0..EEG_ELECTRODES)
        .map(|electrode| {
            let mut frame = [0.0f32; EEG_FRAME_WIDTH];
            for (i, value) in frame.iter_mut().enumerate() {
                let n = tick * EEG_FRAME_WIDTH as u64 + i as u64;
                let t = n as f64 / 256.0;
                let alpha = 20.0 * (TAU * 10.0 * t + electrode as f64).sin();
                *value = alpha as f32;
            }
            frame
        })
        .collect()
}

#[async_trait]
impl EegDevice for SimulatedHeadset {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> AcquisitionResult<()> {
        parse_address(&self.address)?;
        if let Some(reason) = &self.refuse_connect {
            return Err(AcquisitionError::connection(&self.address, reason));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(device = %self.address, "Simulated EEG headband connected");
        Ok(())
    }

    async fn start(&self, on_batch: BatchCallback) -> AcquisitionResult<()> {
        if !self.is_connected() {
            return Err(AcquisitionError::transport(&self.address, "not connected"));
        }

        let scripted = match &mut *self.source.lock() {
            HeadsetSource::Synthetic => None,
            HeadsetSource::Scripted(batches) => Some(std::mem::take(batches)),
        };

        let pump = tokio::spawn(async move {
            match scripted {
                Some(batches) => {
                    for frames in batches {
                        on_batch(EegSampleBatch::new(unix_time_secs(), frames));
                    }
                    // Keep the callback alive until disconnect.
                    std::future::pending::<()>().await;
                }
                None => {
                    let mut interval = tokio::time::interval(EEG_PERIOD);
                    let mut tick = 0u64;
                    loop {
                        interval.tick().await;
                        on_batch(EegSampleBatch::new(unix_time_secs(), synthetic_frames(tick)));
                        tick += 1;
                    }
                }
            }
        });

        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self) -> AcquisitionResult<()> {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            info!(device = %self.address, "Simulated EEG headband disconnected");
        }
        Ok(())
    }
}
