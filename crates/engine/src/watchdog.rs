//! Per-job timeout guard.
//!
//! A job owns exactly one [`Watchdog`]. Arming it replaces whatever was
//! armed before, so a job never has two timers running.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Stage;

struct Armed {
    after: Duration,
    /// `None` while the timer is held.
    deadline: watch::Sender<Option<Instant>>,
    stop: CancellationToken,
}

/// Single-slot timer that runs a callback once unless disarmed first.
#[derive(Default)]
pub struct Watchdog {
    armed: Option<Armed>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a timer for `stage`; `on_fire` runs once if it expires.
    pub fn arm<F, Fut>(&mut self, stage: Stage, after: Duration, on_fire: F)
    where
        F: FnOnce(Stage) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();

        let (deadline_tx, mut deadline_rx) = watch::channel(Some(Instant::now() + after));
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        tokio::spawn(async move {
            loop {
                let deadline = *deadline_rx.borrow_and_update();
                let expiry = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => return,
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = expiry => break,
                }
            }
            debug!(?stage, "watchdog fired");
            on_fire(stage).await;
        });

        self.armed = Some(Armed {
            after,
            deadline: deadline_tx,
            stop,
        });
    }

    /// Restarts the armed timer with its full duration, also after a
    /// [`hold`](Self::hold). No-op when disarmed.
    pub fn kick(&self) {
        if let Some(armed) = &self.armed {
            armed.deadline.send_replace(Some(Instant::now() + armed.after));
        }
    }

    /// Stops the clock of the armed timer until the next
    /// [`kick`](Self::kick).
    pub fn hold(&self) {
        if let Some(armed) = &self.armed {
            armed.deadline.send_replace(None);
        }
    }

    /// Cancels the armed timer, if any.
    pub fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.stop.cancel();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}
