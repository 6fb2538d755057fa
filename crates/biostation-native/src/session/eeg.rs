//! EEG headband session.
//!
//! The headband driver calls back from its own context. The callback only
//! enqueues the batch into a bounded channel; the session task drains the
//! channel into the sink while streaming. A full queue drops the batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use biostation_core::EegSampleBatch;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{wait_for_start, DeviceSession, SessionContext, SessionSummary, SessionTask};
use crate::bridge::{BatchCallback, EegDevice};
use crate::coordinator::StreamSignal;
use crate::error::{AcquisitionError, AcquisitionResult};
use crate::sink::DataSink;

/// Default capacity of the callback queue (about 3 s at 21 batches/s).
pub const EEG_QUEUE_CAPACITY: usize = 64;

/// Acquisition session for the EEG headband.
pub struct EegSession {
    device: Arc<dyn EegDevice>,
    sink: Option<Box<dyn DataSink<EegSampleBatch>>>,
    queue_capacity: usize,
    task: SessionTask,
}

impl EegSession {
    /// Session name.
    pub const NAME: &'static str = "eeg";

    /// Session forwarding `device` batches into `sink`.
    pub fn new(device: Arc<dyn EegDevice>, sink: Box<dyn DataSink<EegSampleBatch>>) -> Self {
        Self { device, sink: Some(sink), queue_capacity: EEG_QUEUE_CAPACITY, task: SessionTask::default() }
    }

    /// Override the callback queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

#[async_trait]
impl DeviceSession for EegSession {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn connect(&mut self) -> AcquisitionResult<()> {
        info!(device = %self.device.address(), "Connecting to EEG headband");
        self.device.connect().await?;
        info!(device = %self.device.address(), "EEG headband connected");
        Ok(())
    }

    async fn start(&mut self, context: SessionContext) -> AcquisitionResult<()> {
        if self.task.is_started() {
            return Err(AcquisitionError::ConfigurationError("EEG session already started".into()));
        }
        let sink = self
            .sink
            .take()
            .ok_or_else(|| AcquisitionError::ConfigurationError("EEG session has no sink".into()))?;

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let overflowed = Arc::new(AtomicU64::new(0));
        let dropped = Arc::clone(&overflowed);
        let callback: BatchCallback = Box::new(move |batch| {
            if let Err(TrySendError::Full(_)) = tx.try_send(batch) {
                let count = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if count.is_power_of_two() {
                    warn!(dropped = count, "EEG queue full, dropping batch");
                }
            }
        });
        self.device.start(callback).await?;

        let task = run(
            self.device.address().to_string(),
            rx,
            sink,
            context.signal,
            self.task.token(),
            overflowed,
        );
        self.task.spawn(Self::NAME, context.faults, task);
        Ok(())
    }

    fn request_stop(&self) {
        self.task.request_stop();
    }

    async fn disconnect(&mut self) -> AcquisitionResult<()> {
        self.device.disconnect().await?;
        info!(device = %self.device.address(), "EEG headband disconnected");
        Ok(())
    }

    async fn join(&mut self, timeout: Duration) -> AcquisitionResult<SessionSummary> {
        self.task.join(Self::NAME, timeout).await
    }

    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn run(
    device: String,
    mut rx: mpsc::Receiver<EegSampleBatch>,
    mut sink: Box<dyn DataSink<EegSampleBatch>>,
    mut signal: StreamSignal,
    stop: CancellationToken,
    overflowed: Arc<AtomicU64>,
) -> AcquisitionResult<SessionSummary> {
    let mut summary = SessionSummary::new(EegSession::NAME);

    let streamed: AcquisitionResult<()> = async {
        if !wait_for_start(&mut signal, &stop).await {
            return Ok(());
        }
        debug!(device = %device, "EEG session streaming");

        loop {
            let batch = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                () = signal.stopped() => break,
                batch = rx.recv() => batch,
            };

            let Some(batch) = batch else {
                if signal.is_streaming() && !stop.is_cancelled() {
                    return Err(AcquisitionError::transport(&device, "headband stopped delivering batches"));
                }
                break;
            };
            if stop.is_cancelled() || !signal.is_streaming() {
                break;
            }

            sink.accept(&batch)?;
            summary.forwarded += 1;
        }
        Ok(())
    }
    .await;

    let flushed = sink.flush();
    summary.overflowed = overflowed.load(Ordering::Relaxed);
    summary.sink = sink.stats();
    streamed?;
    flushed?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::SimulatedHeadset;
    use crate::coordinator::StreamState;
    use crate::session::SessionFault;
    use crate::sink::SinkStats;
    use biostation_core::{EegFrame, EEG_FRAME_WIDTH};
    use parking_lot::Mutex;

    const ADDR: &str = "00:55:DA:B0:00:01";

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<EegSampleBatch>>>);

    impl DataSink<EegSampleBatch> for Collect {
        fn name(&self) -> &'static str {
            "collect"
        }

        fn accept(&mut self, batch: &EegSampleBatch) -> AcquisitionResult<()> {
            self.0.lock().push(batch.clone());
            Ok(())
        }

        fn stats(&self) -> SinkStats {
            SinkStats { accepted: self.0.lock().len() as u64, records: 0 }
        }
    }

    struct Broken;

    impl DataSink<EegSampleBatch> for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn accept(&mut self, _batch: &EegSampleBatch) -> AcquisitionResult<()> {
            Err(AcquisitionError::sink("broken", std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }

        fn stats(&self) -> SinkStats {
            SinkStats::default()
        }
    }

    fn batches(n: usize) -> Vec<Vec<EegFrame>> {
        (0..n).map(|i| vec![[i as f32; EEG_FRAME_WIDTH]; 4]).collect()
    }

    fn context(state: &StreamState) -> (SessionContext, mpsc::Receiver<SessionFault>) {
        let (faults, rx) = mpsc::channel(4);
        (SessionContext { signal: state.subscribe(), faults }, rx)
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
    async fn test_nothing_forwarded_before_streaming() {
        let state = StreamState::new();
        let collected = Collect::default();
        let headset = Arc::new(SimulatedHeadset::scripted(ADDR, batches(3)));
        let mut session = EegSession::new(headset, Box::new(collected.clone()));

        session.connect().await.unwrap();
        let (ctx, _faults) = context(&state);
        session.start(ctx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(collected.0.lock().is_empty());

        session.request_stop();
        let summary = session.join(Duration::from_secs(1)).await.unwrap();
        assert_eq!(summary.forwarded, 0);
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn test_forwards_queued_batches_once_streaming() {
        let state = StreamState::new();
        let collected = Collect::default();
        let headset = Arc::new(SimulatedHeadset::scripted(ADDR, batches(3)));
        let mut session = EegSession::new(headset.clone(), Box::new(collected.clone()));

        session.connect().await.unwrap();
        let (ctx, _faults) = context(&state);
        session.start(ctx).await.unwrap();
        state.set(true);

        wait_for(&collected, 3).await;
        state.set(false);
        session.request_stop();
        session.disconnect().await.unwrap();

        let summary = session.join(Duration::from_secs(1)).await.unwrap();
        assert_eq!(summary.forwarded, 3);
        assert_eq!(collected.0.lock()[2].frames[0][0], 2.0);
        assert_eq!(headset.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_request_stop_is_idempotent() {
        let state = StreamState::new();
        let headset = Arc::new(SimulatedHeadset::scripted(ADDR, batches(1)));
        let mut session = EegSession::new(headset, Box::new(Collect::default()));

        session.connect().await.unwrap();
        let (ctx, _faults) = context(&state);
        session.start(ctx).await.unwrap();
        state.set(true);

        session.request_stop();
        session.request_stop();
        let first = session.join(Duration::from_secs(1)).await.unwrap();
        let second = session.join(Duration::from_secs(1)).await.unwrap();

        assert_eq!(first, second);
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn test_sink_failure_reports_fault() {
        let state = StreamState::new();
        let headset = Arc::new(SimulatedHeadset::scripted(ADDR, batches(1)));
        let mut session = EegSession::new(headset, Box::new(Broken));

        session.connect().await.unwrap();
        let (ctx, mut faults) = context(&state);
        session.start(ctx).await.unwrap();
        state.set(true);

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.session, "eeg");

        let result = session.join(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(AcquisitionError::SinkWriteFailure { sink: "broken", .. })));

        // A repeated join reports the same failure instead of an empty summary.
        let again = session.join(Duration::from_secs(1)).await;
        match again {
            Err(AcquisitionError::Transport { device, reason }) => {
                assert_eq!(device, "eeg");
                assert!(reason.contains("disk full"));
            }
            other => panic!("expected replayed failure, got {other:?}"),
        }
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let state = StreamState::new();
        let headset = Arc::new(SimulatedHeadset::new(ADDR));
        let mut session = EegSession::new(headset, Box::new(Collect::default()));

        session.connect().await.unwrap();
        let (ctx, _faults) = context(&state);
        session.start(ctx).await.unwrap();
        let (ctx, _faults2) = context(&state);
        assert!(session.start(ctx).await.is_err());

        session.request_stop();
        session.disconnect().await.unwrap();
        session.join(Duration::from_secs(1)).await.unwrap();
    }
}
