//! Stream coordinator
//!
//! Owns the shared stream state and both device sessions. Starting connects
//! the EEG headband first, then the fNIRS glasses; only once both sessions
//! are running does the stream state go true. Stopping flips the state to
//! false before anything else, so neither sink accepts samples once a stop
//! has begun.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::error::{AcquisitionError, AcquisitionResult};
use crate::session::{DeviceSession, SessionContext, SessionFault, SessionSummary};

/// Capacity of the fault channel. One fault per session is enough.
const FAULT_CAPACITY: usize = 4;

// ============================================================================
// Stream State
// ============================================================================

/// Process-wide "currently streaming" flag.
///
/// Only the coordinator writes it. Sessions observe it through a
/// [`StreamSignal`].
#[derive(Debug)]
pub struct StreamState {
    tx: watch::Sender<bool>,
    writes: AtomicU32,
}

impl StreamState {
    /// New state, not streaming.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx, writes: AtomicU32::new(0) }
    }

    /// Read handle for a session.
    pub fn subscribe(&self) -> StreamSignal {
        StreamSignal { rx: self.tx.subscribe() }
    }

    /// Current value.
    pub fn is_streaming(&self) -> bool {
        *self.tx.borrow()
    }

    /// Number of writes so far.
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, streaming: bool) {
        self.tx.send_replace(streaming);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of [`StreamState`].
#[derive(Clone, Debug)]
pub struct StreamSignal {
    rx: watch::Receiver<bool>,
}

impl StreamSignal {
    /// Current value.
    pub fn is_streaming(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once streaming is true. Returns `false` if the state was
    /// dropped first.
    pub async fn started(&mut self) -> bool {
        self.rx.wait_for(|streaming| *streaming).await.is_ok()
    }

    /// Resolve once streaming is false, or the state is gone.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|streaming| !*streaming).await;
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Coordinator lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Constructed, nothing connected
    Idle,
    /// Both sessions running and the stream state is true
    Streaming,
    /// Stop in progress
    Stopping,
    /// Stopped; terminal
    Stopped,
}

/// Outcome of [`StreamCoordinator::stop`].
#[derive(Clone, Debug, Default)]
pub struct ShutdownReport {
    /// Summaries of sessions that finished cleanly
    pub summaries: Vec<SessionSummary>,
    /// `(session, error)` for sessions that failed or failed to disconnect
    pub errors: Vec<(&'static str, String)>,
    /// Sessions that missed the shutdown deadline
    pub timed_out: Vec<&'static str>,
}

impl ShutdownReport {
    /// Whether every session finished cleanly.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.timed_out.is_empty()
    }
}

/// Owns both sessions and sequences their startup and shutdown.
pub struct StreamCoordinator {
    eeg: Box<dyn DeviceSession>,
    fnirs: Box<dyn DeviceSession>,
    stream: StreamState,
    shutdown_timeout: Duration,
    state: CoordinatorState,
    fault_tx: mpsc::Sender<SessionFault>,
    fault_rx: mpsc::Receiver<SessionFault>,
    report: Option<ShutdownReport>,
}

impl StreamCoordinator {
    /// Coordinator for an EEG and an fNIRS session.
    pub fn new(eeg: Box<dyn DeviceSession>, fnirs: Box<dyn DeviceSession>, shutdown_timeout: Duration) -> Self {
        let (fault_tx, fault_rx) = mpsc::channel(FAULT_CAPACITY);
        Self {
            eeg,
            fnirs,
            stream: StreamState::new(),
            shutdown_timeout,
            state: CoordinatorState::Idle,
            fault_tx,
            fault_rx,
            report: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// The shared stream state.
    pub fn stream_state(&self) -> &StreamState {
        &self.stream
    }

    /// Connect both devices, start both sessions, then begin streaming.
    ///
    /// # Errors
    ///
    /// Returns the first connection or start error. Any device already
    /// connected is disconnected, the coordinator moves to
    /// [`CoordinatorState::Stopped`] and the stream state is never set.
    pub async fn start(&mut self) -> AcquisitionResult<()> {
        if self.state != CoordinatorState::Idle {
            return Err(AcquisitionError::ConfigurationError(format!(
                "cannot start coordinator in state {:?}",
                self.state
            )));
        }

        if let Err(e) = self.eeg.connect().await {
            self.abort_start(false, false).await;
            return Err(e);
        }
        if let Err(e) = self.fnirs.connect().await {
            self.abort_start(true, false).await;
            return Err(e);
        }

        let eeg_context = SessionContext { signal: self.stream.subscribe(), faults: self.fault_tx.clone() };
        if let Err(e) = self.eeg.start(eeg_context).await {
            self.abort_start(true, true).await;
            return Err(e);
        }
        let fnirs_context = SessionContext { signal: self.stream.subscribe(), faults: self.fault_tx.clone() };
        if let Err(e) = self.fnirs.start(fnirs_context).await {
            self.abort_start(true, true).await;
            return Err(e);
        }

        self.stream.set(true);
        self.state = CoordinatorState::Streaming;
        info!("Streaming started");
        Ok(())
    }

    async fn abort_start(&mut self, eeg_connected: bool, fnirs_connected: bool) {
        warn!("Startup failed, releasing devices");
        for (session, connected) in [(&mut self.eeg, eeg_connected), (&mut self.fnirs, fnirs_connected)] {
            session.request_stop();
            if connected {
                if let Err(e) = session.disconnect().await {
                    warn!(session = session.name(), "Disconnect after failed start: {e}");
                }
            }
            if let Err(e) = session.join(self.shutdown_timeout).await {
                warn!(session = session.name(), "Join after failed start: {e}");
            }
        }
        self.state = CoordinatorState::Stopped;
        self.report = Some(ShutdownReport::default());
    }

    /// Wait for the next session fault.
    ///
    /// Returns `None` only once the coordinator has stopped and every
    /// pending fault has been read.
    pub async fn next_fault(&mut self) -> Option<SessionFault> {
        if matches!(self.state, CoordinatorState::Stopped) {
            return self.fault_rx.try_recv().ok();
        }
        self.fault_rx.recv().await
    }

    /// Stop streaming, stop and disconnect both sessions, and wait for their
    /// tasks within the shutdown timeout.
    ///
    /// Calling `stop` again returns the first report without doing anything.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::ShutdownTimeout`] naming the first session
    /// that missed the deadline. That session's task has been aborted.
    pub async fn stop(&mut self) -> AcquisitionResult<ShutdownReport> {
        match self.state {
            CoordinatorState::Stopping | CoordinatorState::Stopped => {
                return Ok(self.report.clone().unwrap_or_default());
            }
            CoordinatorState::Idle => {
                self.state = CoordinatorState::Stopped;
                let report = ShutdownReport::default();
                self.report = Some(report.clone());
                return Ok(report);
            }
            CoordinatorState::Streaming => {}
        }

        self.state = CoordinatorState::Stopping;
        self.stream.set(false);
        info!("Stopping stream");

        self.eeg.request_stop();
        self.fnirs.request_stop();

        let mut report = ShutdownReport::default();
        for session in [&mut self.eeg, &mut self.fnirs] {
            if let Err(e) = session.disconnect().await {
                warn!(session = session.name(), "Disconnect failed: {e}");
                report.errors.push((session.name(), e.to_string()));
            }
        }

        let mut first_timeout = None;
        for session in [&mut self.eeg, &mut self.fnirs] {
            match session.join(self.shutdown_timeout).await {
                Ok(summary) => report.summaries.push(summary),
                Err(e @ AcquisitionError::ShutdownTimeout { .. }) => {
                    report.timed_out.push(session.name());
                    first_timeout.get_or_insert(e);
                }
                Err(e) => report.errors.push((session.name(), e.to_string())),
            }
        }

        self.state = CoordinatorState::Stopped;
        self.report = Some(report.clone());
        info!(
            clean = report.is_clean(),
            sessions = report.summaries.len(),
            "Stream stopped"
        );

        match first_timeout {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_stream_state_starts_false() {
        let state = StreamState::new();
        assert!(!state.is_streaming());
        assert!(!state.subscribe().is_streaming());
        assert_eq!(state.writes(), 0);
    }

    #[tokio::test]
    async fn test_signal_follows_state() {
        let state = StreamState::new();
        let mut signal = state.subscribe();

        state.set(true);
        assert!(signal.started().await);
        assert!(signal.is_streaming());

        state.set(false);
        signal.stopped().await;
        assert!(!signal.is_streaming());
        assert_eq!(state.writes(), 2);
    }

    #[tokio::test]
    async fn test_started_returns_false_when_state_dropped() {
        let state = StreamState::new();
        let mut signal = state.subscribe();
        drop(state);
        assert!(!signal.started().await);
    }

    /// Records every call in a shared journal.
    struct Scripted {
        name: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
        fail_connect: bool,
        hang: bool,
        signal: Option<StreamSignal>,
    }

    impl Scripted {
        fn boxed(name: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Box<Self> {
            Box::new(Self { name, journal: Arc::clone(journal), fail_connect: false, hang: false, signal: None })
        }

        fn log(&self, event: &str) {
            self.journal.lock().push(format!("{}:{event}", self.name));
        }
    }

    #[async_trait]
    impl DeviceSession for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn connect(&mut self) -> AcquisitionResult<()> {
            self.log("connect");
            if self.fail_connect {
                return Err(AcquisitionError::connection(self.name, "refused"));
            }
            Ok(())
        }

        async fn start(&mut self, context: SessionContext) -> AcquisitionResult<()> {
            self.log(if context.signal.is_streaming() { "start-live" } else { "start" });
            self.signal = Some(context.signal);
            Ok(())
        }

        fn request_stop(&self) {
            let streaming = self.signal.as_ref().is_some_and(StreamSignal::is_streaming);
            self.log(if streaming { "stop-live" } else { "stop" });
        }

        async fn disconnect(&mut self) -> AcquisitionResult<()> {
            self.log("disconnect");
            Ok(())
        }

        async fn join(&mut self, timeout: Duration) -> AcquisitionResult<SessionSummary> {
            self.log("join");
            if self.hang {
                return Err(AcquisitionError::ShutdownTimeout {
                    session: self.name,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            Ok(SessionSummary::new(self.name))
        }

        fn is_finished(&self) -> bool {
            true
        }
    }

    fn coordinator(eeg: Box<Scripted>, fnirs: Box<Scripted>) -> StreamCoordinator {
        StreamCoordinator::new(eeg, fnirs, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_start_order_and_stream_flag() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut coord = coordinator(Scripted::boxed("eeg", &journal), Scripted::boxed("fnirs", &journal));

        coord.start().await.unwrap();
        assert_eq!(coord.state(), CoordinatorState::Streaming);
        assert!(coord.stream_state().is_streaming());
        assert_eq!(
            *journal.lock(),
            ["eeg:connect", "fnirs:connect", "eeg:start", "fnirs:start"]
        );
    }

    #[tokio::test]
    async fn test_stop_clears_flag_before_sessions_stop() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut coord = coordinator(Scripted::boxed("eeg", &journal), Scripted::boxed("fnirs", &journal));

        coord.start().await.unwrap();
        journal.lock().clear();
        let report = coord.stop().await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.summaries.len(), 2);
        assert_eq!(coord.state(), CoordinatorState::Stopped);
        assert!(!coord.stream_state().is_streaming());
        assert_eq!(coord.stream_state().writes(), 2);
        assert_eq!(
            *journal.lock(),
            [
                "eeg:stop",
                "fnirs:stop",
                "eeg:disconnect",
                "fnirs:disconnect",
                "eeg:join",
                "fnirs:join"
            ]
        );
    }

    #[tokio::test]
    async fn test_fnirs_connect_failure_releases_eeg() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut fnirs = Scripted::boxed("fnirs", &journal);
        fnirs.fail_connect = true;
        let mut coord = coordinator(Scripted::boxed("eeg", &journal), fnirs);

        let result = coord.start().await;
        assert!(matches!(result, Err(AcquisitionError::ConnectionFailure { .. })));
        assert_eq!(coord.state(), CoordinatorState::Stopped);
        assert_eq!(coord.stream_state().writes(), 0);
        assert!(journal.lock().contains(&"eeg:disconnect".to_string()));
        assert!(!journal.lock().contains(&"fnirs:disconnect".to_string()));
        assert!(!journal.lock().contains(&"eeg:start".to_string()));
    }

    #[tokio::test]
    async fn test_eeg_connect_failure_skips_fnirs() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut eeg = Scripted::boxed("eeg", &journal);
        eeg.fail_connect = true;
        let mut coord = coordinator(eeg, Scripted::boxed("fnirs", &journal));

        assert!(coord.start().await.is_err());
        assert!(!journal.lock().contains(&"fnirs:connect".to_string()));
        assert!(!coord.stream_state().is_streaming());
    }

    #[tokio::test]
    async fn test_stop_is_reentrant() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut coord = coordinator(Scripted::boxed("eeg", &journal), Scripted::boxed("fnirs", &journal));

        coord.start().await.unwrap();
        coord.stop().await.unwrap();
        let events = journal.lock().len();

        let again = coord.stop().await.unwrap();
        assert_eq!(again.summaries.len(), 2);
        assert_eq!(journal.lock().len(), events);
        assert_eq!(coord.stream_state().writes(), 2);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut coord = coordinator(Scripted::boxed("eeg", &journal), Scripted::boxed("fnirs", &journal));

        let report = coord.stop().await.unwrap();
        assert!(report.summaries.is_empty());
        assert!(journal.lock().is_empty());
        assert_eq!(coord.stream_state().writes(), 0);
        assert!(coord.start().await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_timeout_is_reported() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut fnirs = Scripted::boxed("fnirs", &journal);
        fnirs.hang = true;
        let mut coord = coordinator(Scripted::boxed("eeg", &journal), fnirs);

        coord.start().await.unwrap();
        let result = coord.stop().await;
        assert!(matches!(result, Err(AcquisitionError::ShutdownTimeout { session: "fnirs", .. })));
        assert_eq!(coord.state(), CoordinatorState::Stopped);

        let report = coord.stop().await.unwrap();
        assert_eq!(report.timed_out, ["fnirs"]);
    }

    #[tokio::test]
    async fn test_next_fault_after_stop_is_none() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut coord = coordinator(Scripted::boxed("eeg", &journal), Scripted::boxed("fnirs", &journal));

        coord.start().await.unwrap();
        coord.stop().await.unwrap();
        assert!(coord.next_fault().await.is_none());
    }
}
