//! Restart-on-event timer.
//!
//! ```text
//! arm() ──► deadline = now + period
//! arm() ──► deadline = now + period   (restarted, never stacked)
//!                 ...quiet for `period`...
//! fired().await ──► returns once, timer disarmed
//! ```
//!
//! Meant to sit in a `tokio::select!` loop next to the events that re-arm
//! it. Dropping an unfinished `fired()` future leaves the deadline as it was.

use std::future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// A cancellable timer whose deadline moves forward every time it is armed.
#[derive(Debug, Clone)]
pub struct Debouncer {
    period: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: None,
        }
    }

    /// Start the timer, or restart it if already running.
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.period);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Completes when the deadline passes; pending forever while disarmed.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => future::pending().await,
        }
    }
}
