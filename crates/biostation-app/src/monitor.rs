//! Live dashboard refresh.
//!
//! Redraws are decoupled from sample arrival: a timer snapshots every
//! buffer once per period and reports its window.

use std::time::Duration;

use biostation_native::LiveBuffers;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Spawn the redraw task. It runs until `cancel` fires.
pub fn spawn(buffers: LiveBuffers, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => redraw(&buffers),
            }
        }
    })
}

fn redraw(buffers: &LiveBuffers) {
    for buffer in buffers.all() {
        let buffer = buffer.lock();
        let summary = buffer.summary();
        info!(
            trace = buffer.name(),
            points = buffer.capacity(),
            latest = summary.latest,
            min = summary.min,
            max = summary.max,
            "redraw"
        );
    }
}
