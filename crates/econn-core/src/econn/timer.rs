use std::fmt;
use std::time::{Duration, Instant};

/// A single-purpose timer owned by a state machine.
///
/// The timer is only a deadline: arming replaces any previous deadline, and
/// dropping the owner drops the timer, so an expiry can never be delivered to
/// a machine that no longer exists. The owner polls [`Timer::deadline`] and
/// calls [`Timer::take_expired`] when its clock passes it.
pub struct Timer {
    name: &'static str,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self { name, deadline: None }
    }

    /// Arm for `after` from `now`, replacing any pending deadline
    pub fn arm(&mut self, now: Instant, after: Duration) {
        self.deadline = Some(now + after);
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

    /// Disarm and return true if the deadline has passed
    pub fn take_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if at <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name)
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// Earliest of several optional deadlines
pub fn earliest(deadlines: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}
