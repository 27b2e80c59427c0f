//! Mutation worker
//!
//! - [`MutationWorker`] - Executes one classified attempt per work item
//! - [`Attempt`] / [`AttemptDiagnostics`] - Outcome plus structured detail

mod mutation;

pub use mutation::{Attempt, AttemptDiagnostics, MutationWorker};
