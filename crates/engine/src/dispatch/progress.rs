// Run counters and periodic throughput snapshots

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::reliability::LimiterSnapshot;

/// Running counters of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTally {
    /// Attempts handed to workers, across all phases
    pub submitted: u64,
    pub succeeded: u64,
    /// Attempts that ended retryable and were requeued
    pub retried: u64,
    /// Items recorded as permanent failures
    pub failed: u64,
}

/// Execution phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Fast pass over every pending item
    Initial,
    /// Retry-queue drain iteration, starting at 1
    Drain(u32),
}

impl Phase {
    pub fn is_drain(&self) -> bool {
        matches!(self, Phase::Drain(_))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Initial => write!(f, "initial"),
            Phase::Drain(n) => write!(f, "drain-{n}"),
        }
    }
}

/// Throughput observed since the previous snapshot vs. what the limiter allows
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub elapsed: Duration,
    pub tally: RunTally,
    /// Attempts per second since the previous snapshot
    pub observed_rate: f64,
    pub limiter: LimiterSnapshot,
}

impl ProgressSnapshot {
    /// Observed throughput as a fraction of the limiter's rate
    pub fn utilization(&self) -> f64 {
        if self.limiter.current_rate > 0.0 {
            self.observed_rate / self.limiter.current_rate
        } else {
            0.0
        }
    }
}

#[derive(Debug)]
pub(crate) struct ProgressTracker {
    started: Instant,
    last_at: Instant,
    last_submitted: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_at: now,
            last_submitted: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn sample(&mut self, tally: RunTally, limiter: LimiterSnapshot) -> ProgressSnapshot {
        let now = Instant::now();
        let window = now.saturating_duration_since(self.last_at).as_secs_f64();
        let sent = tally.submitted.saturating_sub(self.last_submitted);
        let observed_rate = if window > 0.0 {
            sent as f64 / window
        } else {
            0.0
        };
        self.last_at = now;
        self.last_submitted = tally.submitted;

        ProgressSnapshot {
            elapsed: now.saturating_duration_since(self.started),
            tally,
            observed_rate,
            limiter,
        }
    }
}
