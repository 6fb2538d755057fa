//! fNIRS glasses session.
//!
//! The task polls the peripheral with a bounded wait so that a stop request
//! is noticed within one wait period even when the glasses go quiet. Every
//! payload is decoded with the configured layout; payloads that fail to
//! decode are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use biostation_core::{decode, DecodedSample, FnirsPacket, PacketLayout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{wait_for_start, DeviceSession, SessionContext, SessionSummary, SessionTask};
use crate::bridge::FnirsPeripheral;
use crate::clock::unix_time_secs;
use crate::coordinator::StreamSignal;
use crate::error::{AcquisitionError, AcquisitionResult};
use crate::sink::DataSink;

/// Default bound on a single notification wait.
pub const NOTIFICATION_WAIT: Duration = Duration::from_secs(1);

/// Acquisition session for the fNIRS glasses.
pub struct FnirsSession {
    device: Arc<dyn FnirsPeripheral>,
    layout: PacketLayout,
    sink: Option<Box<dyn DataSink<DecodedSample>>>,
    wait: Duration,
    task: SessionTask,
}

impl FnirsSession {
    /// Session name.
    pub const NAME: &'static str = "fnirs";

    /// Session decoding `device` payloads with `layout` into `sink`.
    pub fn new(
        device: Arc<dyn FnirsPeripheral>,
        layout: PacketLayout,
        sink: Box<dyn DataSink<DecodedSample>>,
    ) -> Self {
        Self { device, layout, sink: Some(sink), wait: NOTIFICATION_WAIT, task: SessionTask::default() }
    }

    /// Override the notification wait.
    #[must_use]
    pub fn with_notification_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

#[async_trait]
impl DeviceSession for FnirsSession {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn connect(&mut self) -> AcquisitionResult<()> {
        info!(device = %self.device.address(), "Connecting to fNIRS glasses");
        self.device.connect().await?;
        info!(device = %self.device.address(), "fNIRS glasses connected");

        if let Err(e) = self.device.subscribe().await {
            if let Err(close) = self.device.disconnect().await {
                warn!(device = %self.device.address(), "Disconnect after failed subscribe: {close}");
            }
            return Err(e);
        }
        info!(device = %self.device.address(), layout = %self.layout, "fNIRS notifications subscribed");
        Ok(())
    }

    async fn start(&mut self, context: SessionContext) -> AcquisitionResult<()> {
        if self.task.is_started() {
            return Err(AcquisitionError::ConfigurationError("fNIRS session already started".into()));
        }
        let sink = self
            .sink
            .take()
            .ok_or_else(|| AcquisitionError::ConfigurationError("fNIRS session has no sink".into()))?;

        let task = run(
            Arc::clone(&self.device),
            self.layout,
            self.wait,
            sink,
            context.signal,
            self.task.token(),
        );
        self.task.spawn(Self::NAME, context.faults, task);
        Ok(())
    }

    fn request_stop(&self) {
        self.task.request_stop();
    }

    async fn disconnect(&mut self) -> AcquisitionResult<()> {
        self.device.disconnect().await?;
        info!(device = %self.device.address(), "fNIRS glasses disconnected");
        Ok(())
    }

    async fn join(&mut self, timeout: Duration) -> AcquisitionResult<SessionSummary> {
        self.task.join(Self::NAME, timeout).await
    }

    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Decode one notification payload.
fn decode_notification(layout: PacketLayout, raw: &[u8]) -> AcquisitionResult<FnirsPacket> {
    Ok(decode(layout, raw)?)
}

async fn run(
    device: Arc<dyn FnirsPeripheral>,
    layout: PacketLayout,
    wait: Duration,
    mut sink: Box<dyn DataSink<DecodedSample>>,
    mut signal: StreamSignal,
    stop: CancellationToken,
) -> AcquisitionResult<SessionSummary> {
    let mut summary = SessionSummary::new(FnirsSession::NAME);

    let streamed: AcquisitionResult<()> = async {
        if !wait_for_start(&mut signal, &stop).await {
            return Ok(());
        }
        debug!(device = %device.address(), "fNIRS session streaming");

        loop {
            if stop.is_cancelled() || !signal.is_streaming() {
                break;
            }

            let received = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                () = signal.stopped() => break,
                received = device.wait_for_notification(wait) => received,
            };
            if stop.is_cancelled() || !signal.is_streaming() {
                break;
            }

            let Some(raw) = received? else {
                trace!(device = %device.address(), "Nothing received");
                continue;
            };
            let capture_time = unix_time_secs();

            match decode_notification(layout, &raw) {
                Ok(packet) => {
                    sink.accept(&DecodedSample::new(capture_time, packet))?;
                    summary.forwarded += 1;
                }
                Err(e) => {
                    summary.malformed += 1;
                    warn!(device = %device.address(), "Dropping packet: {e}");
                }
            }
        }
        Ok(())
    }
    .await;

    let flushed = sink.flush();
    summary.sink = sink.stats();
    streamed?;
    flushed?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::SimulatedPeripheral;
    use crate::coordinator::StreamState;
    use crate::session::SessionFault;
    use crate::sink::SinkStats;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    const ADDR: &str = "A0:B1:C2:D3:E4:F5";

    fn logging_payload(index: u16, a: u32, b: u32) -> Vec<u8> {
        biostation_core::LoggingPacket { index_or_time: index, short_path: a, long_path: b, trailer: 0 }
            .to_bytes()
            .to_vec()
    }

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<DecodedSample>>>);

    impl DataSink<DecodedSample> for Collect {
        fn name(&self) -> &'static str {
            "collect"
        }

        fn accept(&mut self, sample: &DecodedSample) -> AcquisitionResult<()> {
            self.0.lock().push(*sample);
            Ok(())
        }

        fn stats(&self) -> SinkStats {
            SinkStats { accepted: self.0.lock().len() as u64, records: 0 }
        }
    }

    fn context(state: &StreamState) -> (SessionContext, mpsc::Receiver<SessionFault>) {
        let (faults, rx) = mpsc::channel(4);
        (SessionContext { signal: state.subscribe(), faults }, rx)
    }

    async fn started_session(
        glasses: Arc<SimulatedPeripheral>,
        sink: Box<dyn DataSink<DecodedSample>>,
        state: &StreamState,
    ) -> (FnirsSession, mpsc::Receiver<SessionFault>) {
        let mut session = FnirsSession::new(glasses, PacketLayout::Logging, sink)
            .with_notification_wait(Duration::from_millis(20));
        session.connect().await.unwrap();
        let (ctx, faults) = context(state);
        session.start(ctx).await.unwrap();
        (session, faults)
    }

    async fn wait_for(collected: &Collect, n: usize) {
        for _ in 0..200 {
            if collected.0.lock().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_decodes_and_forwards() {
        let state = StreamState::new();
        let collected = Collect::default();
        let glasses = Arc::new(SimulatedPeripheral::scripted(
            ADDR,
            PacketLayout::Logging,
            vec![logging_payload(5, 300, 600), logging_payload(6, 301, 601)],
        ));
        let (mut session, _faults) = started_session(glasses, Box::new(collected.clone()), &state).await;

        state.set(true);
        wait_for(&collected, 2).await;
        state.set(false);

        let summary = session.join(Duration::from_secs(1)).await.unwrap();
        assert_eq!(summary.forwarded, 2);

        let samples = collected.0.lock();
        assert_eq!(samples[0].packet.index_or_time(), 5);
        assert_eq!(samples[0].packet.channel_a(), 300);
        assert_eq!(samples[1].packet.channel_b(), 601);
        assert!(samples[0].capture_time > 0.0);
    }

    #[tokio::test]
    async fn test_malformed_packet_is_dropped_not_fatal() {
        let state = StreamState::new();
        let collected = Collect::default();
        let glasses = Arc::new(SimulatedPeripheral::scripted(
            ADDR,
            PacketLayout::Logging,
            vec![vec![0x00; 11], logging_payload(1, 10, 20)],
        ));
        let (mut session, _faults) = started_session(glasses, Box::new(collected.clone()), &state).await;

        state.set(true);
        wait_for(&collected, 1).await;
        state.set(false);

        let summary = session.join(Duration::from_secs(1)).await.unwrap();
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.forwarded, 1);
    }

    #[tokio::test]
    async fn test_idle_glasses_stop_within_one_wait() {
        let state = StreamState::new();
        let glasses = Arc::new(SimulatedPeripheral::scripted(ADDR, PacketLayout::Logging, Vec::new()));
        let (mut session, _faults) = started_session(glasses, Box::new(Collect::default()), &state).await;

        state.set(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.request_stop();

        let summary = session.join(Duration::from_millis(500)).await.unwrap();
        assert_eq!(summary.forwarded, 0);
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn test_no_samples_after_stop() {
        let state = StreamState::new();
        let collected = Collect::default();
        let glasses = Arc::new(SimulatedPeripheral::scripted(
            ADDR,
            PacketLayout::Logging,
            vec![logging_payload(1, 1, 1)],
        ));
        let (mut session, _faults) =
            started_session(glasses.clone(), Box::new(collected.clone()), &state).await;

        state.set(true);
        wait_for(&collected, 1).await;
        state.set(false);
        session.request_stop();
        glasses.push(logging_payload(2, 2, 2));

        session.join(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(collected.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_link_while_streaming_is_fault() {
        let state = StreamState::new();
        let glasses = Arc::new(SimulatedPeripheral::scripted(ADDR, PacketLayout::Logging, Vec::new()));
        let (mut session, mut faults) =
            started_session(glasses.clone(), Box::new(Collect::default()), &state).await;

        state.set(true);
        glasses.disconnect().await.unwrap();

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.session, "fnirs");
        let result = session.join(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(AcquisitionError::Transport { .. })));
    }

    #[test]
    fn test_undersized_payload_is_malformed_packet() {
        let result = decode_notification(PacketLayout::Logging, &[0x00; 11]);
        assert!(matches!(result, Err(AcquisitionError::MalformedPacket(_))));
        assert!(result.unwrap_err().to_string().starts_with("Malformed packet:"));

        let packet = decode_notification(PacketLayout::Logging, &logging_payload(5, 300, 600)).unwrap();
        assert_eq!(packet.channel_b(), 600);
    }

    #[tokio::test]
    async fn test_failed_subscribe_disconnects_glasses() {
        let glasses = Arc::new(
            SimulatedPeripheral::new(ADDR, PacketLayout::Logging).refusing_subscribe("no CCCD"),
        );
        let mut session =
            FnirsSession::new(glasses.clone(), PacketLayout::Logging, Box::new(Collect::default()));

        let result = session.connect().await;
        assert!(matches!(result, Err(AcquisitionError::ConnectionFailure { .. })));
        assert!(!glasses.is_connected());
        assert_eq!(glasses.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let glasses = Arc::new(SimulatedPeripheral::new("bogus", PacketLayout::Logging));
        let mut session = FnirsSession::new(glasses, PacketLayout::Logging, Box::new(Collect::default()));

        let result = session.connect().await;
        assert!(matches!(result, Err(AcquisitionError::ConnectionFailure { .. })));
        assert!(session.is_finished());
    }
}
