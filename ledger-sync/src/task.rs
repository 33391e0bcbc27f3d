//! Cooperative loops driving the sync engine's periodic work.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};

use crate::error::SyncError;

/// Returned by a loop step to decide when it runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    /// Run again after the delay. A zero delay yields to the runtime and runs again at once.
    Again(Duration),
    /// Run again after the full delay, a wake notification does not end it early.
    Backoff(Duration),
    /// Stop the loop for good.
    Stop,
}

/// Handle to a spawned loop.
///
/// Stopping is cooperative: the shutdown signal is only observed between steps, so an
/// in-flight step always finishes and persists its result.
pub struct TaskHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancels future runs of the loop.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels future runs and waits for the in-flight step to finish.
    pub async fn stop_and_join(self) {
        self.stop();
        if let Err(e) = self.handle.await {
            tracing::error!("{} loop panicked. {}", self.name, e);
        }
    }
}

/// Spawns a loop repeatedly running `step`.
///
/// A failed step is logged and retried after `error_delay`. When `wake` is given, a
/// notification ends the current wait early, unless the step asked for a backoff.
pub(crate) fn spawn_loop<F, Fut>(
    name: impl Into<String>,
    wake: Option<Arc<Notify>>,
    error_delay: Duration,
    mut step: F,
) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<LoopSignal, SyncError>> + Send + 'static,
{
    let name = name.into();
    let (shutdown, mut shutdown_receiver) = watch::channel(false);
    let loop_name = name.clone();

    let handle = tokio::spawn(async move {
        loop {
            if *shutdown_receiver.borrow() {
                break;
            }

            let (delay, wakeable) = match step().await {
                Ok(LoopSignal::Again(delay)) => (delay, true),
                Ok(LoopSignal::Backoff(delay)) => (delay, false),
                Ok(LoopSignal::Stop) => {
                    tracing::debug!("{} loop finished", loop_name);
                    break;
                }
                Err(e) => {
                    tracing::warn!("{} loop failed, retrying in {:?}. {}", loop_name, error_delay, e);
                    (error_delay, true)
                }
            };

            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            let woken = async {
                match &wake {
                    Some(notify) if wakeable => notify.notified().await,
                    _ => std::future::pending().await,
                }
            };

            tokio::select! {
                changed = shutdown_receiver.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => (),
                _ = woken => (),
            }
        }
    });

    TaskHandle {
        name,
        shutdown,
        handle,
    }
}
