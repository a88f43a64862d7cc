//! Keep-alive re-arm timer.

use std::time::{Duration, Instant};

/// Tracks when the next keep-alive is owed.
///
/// The requestor treats prolonged silence as a hung guest agent, so every
/// event sent re-arms this timer at 1/20 of the keep-alive period. If it
/// expires with no event in between, the state machine owes the requestor
/// an explicit keep-alive event.
#[derive(Debug)]
pub(crate) struct KeepAlive {
    interval: Duration,
    deadline: Instant,
}

impl KeepAlive {
    pub(crate) fn new(period: Duration) -> Self {
        let interval = period / 20;
        Self {
            interval,
            deadline: Instant::now() + interval,
        }
    }

    /// Push the deadline out; called whenever any event is sent
    pub(crate) fn rearm(&mut self) {
        self.deadline = Instant::now() + self.interval;
    }

    /// Whether the deadline has passed with no event in between
    pub(crate) fn due(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left until the deadline
    pub(crate) fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
