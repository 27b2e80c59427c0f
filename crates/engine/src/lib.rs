//! # Adaptive Bulk Mutation Engine
//!
//! Issues large batches of independent read-modify-write calls against a
//! rate-limited, OAuth-authenticated HTTP API and classifies every item as
//! succeeded, retried or permanently failed.
//!
//! ## Components
//!
//! - **Credential manager**: validates and refreshes the account's bearer token, single-flight
//! - **Adaptive rate limiter**: token bucket whose fill rate follows server backpressure
//! - **Mutation worker**: one classified attempt per item, with one refresh-and-resend on 401
//! - **Dispatcher**: fast pass, then drain iterations of the retry queue at reduced rate
//! - **Checkpoint ledger**: append-only file of completed ids for resumable runs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (phases, retry queue, counters, ledger + failure list)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ bounded JoinSet
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      MutationWorker                          │
//! │  (acquire permit, GET, build payload, PUT, classify)        │
//! └─────────────────────────────────────────────────────────────┘
//!              │                                    │
//!              ▼                                    ▼
//! ┌────────────────────────┐          ┌────────────────────────┐
//! │  AdaptiveRateLimiter   │          │   CredentialManager    │
//! │  (one per account)     │          │   (one per account)    │
//! └────────────────────────┘          └────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use bulkmut_engine::prelude::*;
//!
//! let credentials = Arc::new(CredentialManager::new(
//!     AccountCredentials::from_env("STORE"),
//!     CredentialConfig::new(token_url, validation_url),
//! )?);
//! let remote = RemoteApi::new(&api_url, config.request_timeout)?;
//! let ledger = CheckpointLedger::new("completed.txt");
//!
//! let report = Dispatcher::new(config, remote, credentials, ledger)?
//!     .run(candidates)
//!     .await?;
//! ```

pub mod config;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod model;
pub mod payload;
pub mod reliability;
pub mod remote;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{load_engine_config, EngineConfig};
    pub use crate::credential::{
        AccountCredentials, BearerToken, CredentialConfig, CredentialManager,
    };
    pub use crate::dispatch::{Dispatcher, RunReport, RunTally};
    pub use crate::error::{ConfigError, CredentialError, EngineError, LedgerError};
    pub use crate::ledger::CheckpointLedger;
    pub use crate::model::{FailureRecord, Outcome, RetryReason, WorkItem};
    pub use crate::payload::{MergeFields, PayloadBuilder, ReplaceWith};
    pub use crate::reliability::{AdaptiveRateLimiter, CircuitBreakerConfig, LimiterConfig};
    pub use crate::remote::RemoteApi;
    pub use crate::worker::{Attempt, MutationWorker};
}

// Re-export key types at crate root
pub use config::{load_engine_config, EngineConfig};
pub use credential::{AccountCredentials, BearerToken, CredentialConfig, CredentialManager};
pub use dispatch::{Dispatcher, RunReport, RunTally};
pub use error::{ConfigError, CredentialError, EngineError, LedgerError, Result};
pub use ledger::CheckpointLedger;
pub use model::{normalize_entity_id, FailureRecord, Outcome, RetryReason, WorkItem};
pub use payload::{MergeFields, PayloadBuilder, ReplaceWith};
pub use reliability::{
    AdaptiveRateLimiter, CircuitBreakerConfig, CircuitState, LimiterConfig, LimiterSnapshot,
};
pub use remote::RemoteApi;
pub use worker::{Attempt, AttemptDiagnostics, MutationWorker};
