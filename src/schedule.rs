//! Periodic work units.
//!
//! The ingestion producer and the analysis pipeline are both polling loops:
//! do one pass, sleep, repeat. `spawn_periodic` owns that loop so each
//! component only has to say what one pass is.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// One pass of a polling loop.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    fn name(&self) -> &str;

    /// Run one full pass. Long passes should check `stop` between items and
    /// return early once it is set.
    async fn run_once(&self, stop: &AtomicBool);
}

/// Handle to a running periodic loop.
pub struct PeriodicHandle {
    pub name: String,
    pub handle: JoinHandle<()>,
    pub shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl PeriodicHandle {
    /// Ask the loop to stop after the current pass and wait for it.
    ///
    /// Returns `false` if the loop had already died, e.g. a pass panicked.
    pub async fn stop(self) -> bool {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        match self.handle.await {
            Ok(()) => true,
            Err(e) => {
                error!(unit = %self.name, error = %e, "Periodic task ended abnormally");
                false
            }
        }
    }
}

/// Spawn `unit` on a fixed cadence. The first pass starts immediately.
///
/// Passes never overlap: a pass that outlasts `interval` delays the next
/// tick instead of stacking a burst of catch-up runs.
pub fn spawn_periodic(unit: Arc<dyn WorkUnit>, interval: Duration) -> PeriodicHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let shutdown_flag = Arc::clone(&shutdown);
    let wake_signal = Arc::clone(&wake);
    let name = unit.name().to_string();

    let handle = tokio::spawn(async move {
        info!(
            unit = unit.name(),
            interval_secs = interval.as_secs(),
            "Periodic task started"
        );

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = wake.notified() => {}
            }

            if shutdown.load(Ordering::SeqCst) {
                info!(unit = unit.name(), "Periodic task shutting down");
                return;
            }

            debug!(unit = unit.name(), "Running pass");
            unit.run_once(&shutdown).await;
        }
    });

    PeriodicHandle {
        name,
        handle,
        shutdown: shutdown_flag,
        wake: wake_signal,
    }
}
