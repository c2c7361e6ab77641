//! Compilation budgets.
//!
//! The driver asks its budget after every task step whether it may keep
//! going. Exhaustion with work left suspends the session.

use std::time::{Duration, Instant};

pub trait Budget {
    /// Called once per completed task step. `true` means stop.
    fn exhausted(&mut self) -> bool;
}

/// Wall-clock deadline measured from construction.
#[derive(Debug, Clone, Copy)]
pub struct TimeSlice {
    deadline: Instant,
}

impl TimeSlice {
    pub fn starting_now(slice: Duration) -> Self {
        Self {
            deadline: Instant::now() + slice,
        }
    }
}

impl Budget for TimeSlice {
    fn exhausted(&mut self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// A fixed number of task steps. Deterministic, so suspension points are
/// reproducible.
#[derive(Debug, Clone, Copy)]
pub struct TaskQuota {
    remaining: u32,
}

impl TaskQuota {
    /// Allow `steps` task steps; at least one step always runs.
    pub fn new(steps: u32) -> Self {
        Self { remaining: steps }
    }
}

impl Budget for TaskQuota {
    fn exhausted(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }
}

/// Never runs out.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl Budget for Unlimited {
    fn exhausted(&mut self) -> bool {
        false
    }
}
