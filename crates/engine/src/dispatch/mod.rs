//! Dispatch orchestrator
//!
//! - [`Dispatcher`] - Phased schedule over a bounded worker pool
//! - [`RunReport`] / [`RunTally`] - Final and running counters
//! - [`ProgressSnapshot`] - Observed throughput against the limiter rate

mod orchestrator;
mod progress;

pub use orchestrator::{Dispatcher, RunReport};
pub use progress::{Phase, ProgressSnapshot, RunTally};
