//! BLE bridge for the fNIRS glasses
//!
//! Connects to the glasses by address, discovers the fNIRS service, and
//! enables notifications on its data characteristic. The stack performs the
//! CCCD write (`0x01 0x00` at value handle + 1) as part of `subscribe`.
//!
//! Notifications are read by a background task and queued in a bounded
//! channel; [`BlePeripheral::wait_for_notification`] pops one payload at a
//! time with a deadline. When the queue is full the newest payload is
//! dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{
    parse_address, FnirsPeripheral, FNIRS_COMMAND_CHAR_UUID, FNIRS_DATA_CHAR_UUID,
    FNIRS_SERVICE_UUID,
};
use crate::error::{AcquisitionError, AcquisitionResult};

/// Connect deadline once the device has been found.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Service discovery deadline.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between peripheral list polls while scanning.
const SCAN_POLL: Duration = Duration::from_millis(250);

/// Capacity of the notification queue.
pub const NOTIFICATION_QUEUE: usize = 256;

// ============================================================================
// Link Setup
// ============================================================================

async fn first_adapter(device: &str) -> AcquisitionResult<Adapter> {
    let manager = Manager::new().await.map_err(|e| AcquisitionError::connection(device, e))?;
    manager
        .adapters()
        .await
        .map_err(|e| AcquisitionError::connection(device, e))?
        .into_iter()
        .next()
        .ok_or_else(|| AcquisitionError::connection(device, "no Bluetooth adapter found"))
}

async fn find_peripheral(
    adapter: &Adapter,
    device: &str,
    address: BDAddr,
    scan_timeout: Duration,
) -> AcquisitionResult<Peripheral> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| AcquisitionError::connection(device, e))?;

    let search = async {
        loop {
            let peripherals = adapter.peripherals().await?;
            if let Some(found) = peripherals.into_iter().find(|p| p.address() == address) {
                return Ok::<_, btleplug::Error>(found);
            }
            tokio::time::sleep(SCAN_POLL).await;
        }
    };
    let result = tokio::time::timeout(scan_timeout, search).await;

    if let Err(e) = adapter.stop_scan().await {
        debug!("Failed to stop scan: {e}");
    }

    match result {
        Ok(Ok(peripheral)) => Ok(peripheral),
        Ok(Err(e)) => Err(AcquisitionError::connection(device, e)),
        Err(_) => Err(AcquisitionError::connection(
            device,
            format!("device not found within {} ms", scan_timeout.as_millis()),
        )),
    }
}

/// Scan for `device`, connect, and discover its services.
pub(crate) async fn open_link(device: &str, scan_timeout: Duration) -> AcquisitionResult<Peripheral> {
    let address = BDAddr::from(parse_address(device)?);
    let adapter = first_adapter(device).await?;

    info!(device, "Scanning for device...");
    let peripheral = find_peripheral(&adapter, device, address, scan_timeout).await?;

    info!(device, "Connecting...");
    tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect())
        .await
        .map_err(|_| AcquisitionError::connection(device, "connect timed out"))?
        .map_err(|e| AcquisitionError::connection(device, e))?;

    // BlueZ reports the connection before its GATT cache is populated.
    #[cfg(target_os = "linux")]
    tokio::time::sleep(Duration::from_millis(600)).await;

    tokio::time::timeout(DISCOVERY_TIMEOUT, peripheral.discover_services())
        .await
        .map_err(|_| AcquisitionError::connection(device, "service discovery timed out"))?
        .map_err(|e| AcquisitionError::connection(device, e))?;

    info!(device, "Connected");
    Ok(peripheral)
}

/// Find a characteristic by UUID on a connected peripheral.
pub(crate) fn find_characteristic(peripheral: &Peripheral, uuid: uuid::Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

// ============================================================================
// fNIRS Peripheral
// ============================================================================

struct FnirsLink {
    peripheral: Peripheral,
    data: Characteristic,
    pump: Option<JoinHandle<()>>,
}

/// BLE connection to the fNIRS glasses.
pub struct BlePeripheral {
    address: String,
    scan_timeout: Duration,
    link: Mutex<Option<FnirsLink>>,
    notifications: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    overflowed: Arc<AtomicU64>,
}

impl BlePeripheral {
    /// Glasses at `address`, searched for up to `scan_timeout`.
    pub fn new(address: impl Into<String>, scan_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            scan_timeout,
            link: Mutex::new(None),
            notifications: Mutex::new(None),
            overflowed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Payloads dropped because the notification queue was full.
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FnirsPeripheral for BlePeripheral {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> AcquisitionResult<()> {
        let peripheral = open_link(&self.address, self.scan_timeout).await?;

        let has_service = peripheral.services().iter().any(|s| s.uuid == FNIRS_SERVICE_UUID);
        if !has_service {
            let _ = peripheral.disconnect().await;
            return Err(AcquisitionError::connection(&self.address, "fNIRS service not found"));
        }

        let Some(data) = find_characteristic(&peripheral, FNIRS_DATA_CHAR_UUID) else {
            let _ = peripheral.disconnect().await;
            return Err(AcquisitionError::connection(
                &self.address,
                "fNIRS data characteristic not found",
            ));
        };
        if find_characteristic(&peripheral, FNIRS_COMMAND_CHAR_UUID).is_none() {
            debug!(device = %self.address, "No command characteristic exposed");
        }

        *self.link.lock().await = Some(FnirsLink { peripheral, data, pump: None });
        Ok(())
    }

    async fn subscribe(&self) -> AcquisitionResult<()> {
        let mut link = self.link.lock().await;
        let link = link
            .as_mut()
            .ok_or_else(|| AcquisitionError::connection(&self.address, "not connected"))?;

        link.peripheral
            .subscribe(&link.data)
            .await
            .map_err(|e| AcquisitionError::connection(&self.address, e))?;
        let mut stream = link
            .peripheral
            .notifications()
            .await
            .map_err(|e| AcquisitionError::connection(&self.address, e))?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE);
        let overflowed = Arc::clone(&self.overflowed);
        let device = self.address.clone();
        let pump = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != FNIRS_DATA_CHAR_UUID {
                    continue;
                }
                match tx.try_send(notification.value) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        overflowed.fetch_add(1, Ordering::Relaxed);
                        warn!(device = %device, "Notification queue full, dropping packet");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            debug!(device = %device, "Notification stream ended");
        });

        if let Some(previous) = link.pump.replace(pump) {
            previous.abort();
        }
        *self.notifications.lock().await = Some(rx);

        info!(device = %self.address, "Subscribed to fNIRS notifications");
        Ok(())
    }

    async fn wait_for_notification(&self, timeout: Duration) -> AcquisitionResult<Option<Vec<u8>>> {
        let mut guard = self.notifications.lock().await;
        let rx = guard
            .as_mut()
            .ok_or_else(|| AcquisitionError::transport(&self.address, "not subscribed"))?;

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(AcquisitionError::transport(&self.address, "notification stream closed")),
            Err(_) => Ok(None),
        }
    }

    async fn disconnect(&self) -> AcquisitionResult<()> {
        let Some(mut link) = self.link.lock().await.take() else {
            return Ok(());
        };
        if let Some(pump) = link.pump.take() {
            pump.abort();
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
