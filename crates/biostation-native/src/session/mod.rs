//! Per-device acquisition sessions.
//!
//! A session owns one device handle and one sink. Its lifecycle is
//! `connect → start → (stream) → request_stop → disconnect → join`.
//!
//! `start` spawns the session's task, which waits for the shared
//! [`StreamSignal`] to go true before forwarding anything, and stops as soon
//! as either the signal goes false or the session's own stop token fires.
//! A task that ends with an error reports a [`SessionFault`] so the
//! coordinator can stop the other session too.
//!
//! - [`eeg`]: callback-driven EEG headband
//! - [`fnirs`]: notification-polling fNIRS glasses

pub mod eeg;
pub mod fnirs;

pub use eeg::EegSession;
pub use fnirs::FnirsSession;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::coordinator::StreamSignal;
use crate::error::{AcquisitionError, AcquisitionResult};
use crate::sink::SinkStats;

/// How long an aborted task gets to unwind after a shutdown timeout.
const ABORT_GRACE: Duration = Duration::from_millis(250);

/// Wiring handed to a session when it starts.
#[derive(Debug)]
pub struct SessionContext {
    /// Shared stream state
    pub signal: StreamSignal,
    /// Where a failing session reports
    pub faults: mpsc::Sender<SessionFault>,
}

/// A session that ended with an error while streaming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionFault {
    /// Session name
    pub session: &'static str,
    /// Error message
    pub reason: String,
}

/// Counters of a finished session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Session name
    pub session: &'static str,
    /// Samples handed to the sink
    pub forwarded: u64,
    /// Payloads dropped because they failed to decode
    pub malformed: u64,
    /// Samples dropped because the delivery queue was full
    pub overflowed: u64,
    /// Sink counters
    pub sink: SinkStats,
}

impl SessionSummary {
    /// Empty summary for a session.
    pub fn new(session: &'static str) -> Self {
        Self { session, ..Self::default() }
    }
}

/// One device's acquisition session.
#[async_trait]
pub trait DeviceSession: Send {
    /// Session name (`"eeg"`, `"fnirs"`).
    fn name(&self) -> &'static str;

    /// Connect the device and subscribe to its data.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::ConnectionFailure`] on failure.
    async fn connect(&mut self) -> AcquisitionResult<()>;

    /// Spawn the session task. Nothing reaches the sink until the stream
    /// signal goes true.
    ///
    /// # Errors
    ///
    /// Returns an error if the session was already started or the device
    /// refuses to start.
    async fn start(&mut self, context: SessionContext) -> AcquisitionResult<()>;

    /// Ask the task to stop. Idempotent.
    fn request_stop(&self);

    /// Disconnect the device. Errors are returned, not retried.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Transport`] if the device fails to close.
    async fn disconnect(&mut self) -> AcquisitionResult<()>;

    /// Wait up to `timeout` for the task to finish.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::ShutdownTimeout`] if the deadline passes,
    /// or the task's own error.
    async fn join(&mut self, timeout: Duration) -> AcquisitionResult<SessionSummary>;

    /// Whether no task is running for this session.
    fn is_finished(&self) -> bool;
}

// ============================================================================
// Task Handle
// ============================================================================

/// How a joined task ended, kept so later joins report the same outcome.
#[derive(Clone, Debug)]
enum Joined {
    Finished(SessionSummary),
    TimedOut { timeout_ms: u64 },
    Failed(String),
}

impl Joined {
    fn replay(&self, name: &'static str) -> AcquisitionResult<SessionSummary> {
        match self {
            Self::Finished(summary) => Ok(summary.clone()),
            Self::TimedOut { timeout_ms } => {
                Err(AcquisitionError::ShutdownTimeout { session: name, timeout_ms: *timeout_ms })
            }
            Self::Failed(reason) => Err(AcquisitionError::transport(name, reason)),
        }
    }
}

/// Spawned task plus its stop token, shared by both session kinds.
#[derive(Debug, Default)]
pub(crate) struct SessionTask {
    stop: CancellationToken,
    handle: Option<JoinHandle<AcquisitionResult<SessionSummary>>>,
    joined: Option<Joined>,
}

impl SessionTask {
    pub(crate) fn token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.handle.is_some() || self.joined.is_some()
    }

    pub(crate) fn spawn<F>(&mut self, name: &'static str, faults: mpsc::Sender<SessionFault>, run: F)
    where
        F: Future<Output = AcquisitionResult<SessionSummary>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let result = run.await;
            match &result {
                Ok(summary) => info!(
                    session = name,
                    forwarded = summary.forwarded,
                    malformed = summary.malformed,
                    overflowed = summary.overflowed,
                    "Session finished"
                ),
                Err(e) => {
                    error!(session = name, "Session failed: {e}");
                    let fault = SessionFault { session: name, reason: e.to_string() };
                    if faults.try_send(fault).is_err() {
                        warn!(session = name, "Fault channel unavailable");
                    }
                }
            }
            result
        });
        self.handle = Some(handle);
    }

    pub(crate) fn request_stop(&self) {
        self.stop.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the task. Later calls replay the first outcome; a failure is
    /// replayed as [`AcquisitionError::Transport`] carrying the original message.
    pub(crate) async fn join(
        &mut self,
        name: &'static str,
        timeout: Duration,
    ) -> AcquisitionResult<SessionSummary> {
        let Some(mut handle) = self.handle.take() else {
            return match &self.joined {
                Some(joined) => joined.replay(name),
                None => Ok(SessionSummary::new(name)),
            };
        };

        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(session = name, timeout_ms, "Session did not stop in time, aborting");
                handle.abort();
                let _ = tokio::time::timeout(ABORT_GRACE, handle).await;
                self.joined = Some(Joined::TimedOut { timeout_ms });
                return Err(AcquisitionError::ShutdownTimeout { session: name, timeout_ms });
            }
        };

        let result = outcome.unwrap_or_else(|e| Err(AcquisitionError::transport(name, e)));
        self.joined = Some(match &result {
            Ok(summary) => Joined::Finished(summary.clone()),
            Err(e) => Joined::Failed(e.to_string()),
        });
        result
    }
}

/// Wait until streaming starts. Returns `false` if the session should exit
/// without streaming.
pub(crate) async fn wait_for_start(signal: &mut StreamSignal, stop: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = stop.cancelled() => false,
        started = signal.started() => started && !stop.is_cancelled(),
    }
}
