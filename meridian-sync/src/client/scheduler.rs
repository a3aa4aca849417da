//! Reconnect timers.
//!
//! The connection state machine never sleeps itself; it asks a
//! [`ReconnectScheduler`] to call back later with the socket generation that
//! failed. [`TokioScheduler`] uses real timers, [`ManualScheduler`] a virtual
//! clock so backoff behaviour can be tested deterministically.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// At most one pending timer; scheduling again replaces it.
pub trait ReconnectScheduler: Send {
    fn schedule(&mut self, delay: Duration, generation: u64);

    fn cancel(&mut self);

    fn is_pending(&self) -> bool;
}

/// Fires by pushing the generation into a channel read by the driver task.
pub struct TokioScheduler {
    due: mpsc::UnboundedSender<u64>,
    pending: Option<AbortHandle>,
}

impl TokioScheduler {
    pub fn new(due: mpsc::UnboundedSender<u64>) -> Self {
        Self { due, pending: None }
    }
}

impl ReconnectScheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration, generation: u64) {
        self.cancel();
        let due = self.due.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = due.send(generation);
        });
        self.pending = Some(handle.abort_handle());
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Virtual clock. Time only moves through [`ManualScheduler::advance`].
#[derive(Debug, Default)]
pub struct ManualScheduler {
    now: Duration,
    pending: Option<(Duration, u64)>,
    scheduled: Vec<Duration>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// When the pending timer fires, on the virtual clock.
    pub fn due_at(&self) -> Option<Duration> {
        self.pending.map(|(at, _)| at)
    }

    /// Every delay ever requested, in order.
    pub fn scheduled_delays(&self) -> &[Duration] {
        &self.scheduled
    }

    /// Move the clock forward. Returns the generation of the timer that fired,
    /// if one came due.
    pub fn advance(&mut self, by: Duration) -> Option<u64> {
        self.now += by;
        match self.pending {
            Some((at, generation)) if at <= self.now => {
                self.pending = None;
                Some(generation)
            }
            _ => None,
        }
    }
}

impl ReconnectScheduler for ManualScheduler {
    fn schedule(&mut self, delay: Duration, generation: u64) {
        self.scheduled.push(delay);
        self.pending = Some((self.now + delay, generation));
    }

    fn cancel(&mut self) {
        self.pending = None;
    }

    fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}
