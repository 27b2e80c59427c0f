// Error types for the mutation engine
//
// Per-item failures are never errors: they are carried as `Outcome` data.
// Only startup problems (credentials, config, ledger I/O) surface here.

use std::path::PathBuf;

use thiserror::Error;

use crate::dispatch::RunReport;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the credential manager
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Static client/secret/refresh material is absent or empty
    #[error("missing credential material: {0}")]
    Missing(&'static str),

    /// Transport failure talking to the token or validation endpoint
    #[error("network error during credential refresh: {0}")]
    Network(#[from] reqwest::Error),

    /// Token endpoint answered with a non-200 status
    #[error("OAuth token endpoint returned {status}: {body}")]
    OAuth { status: u16, body: String },

    /// Token endpoint answered 200 but the body could not be used
    #[error("malformed token response: {0}")]
    MalformedResponse(String),

    /// Too many consecutive refresh failures; manager is disabled until reset
    #[error("credential refresh failed {attempts} consecutive times; manager disabled")]
    RefreshExhausted { attempts: u32 },
}

impl CredentialError {
    /// Whether the failure is permanent for this process lifetime
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CredentialError::Missing(_) | CredentialError::RefreshExhausted { .. }
        )
    }
}

/// Invalid engine configuration
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid engine configuration: {0}")]
    Invalid(String),

    #[error("failed to read config file {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error("failed to parse config file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

/// Checkpoint ledger I/O failure
#[derive(Debug, Error)]
#[error("checkpoint ledger {}: {source}", path.display())]
pub struct LedgerError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl LedgerError {
    pub(crate) fn new(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }
}

/// Run-level errors returned by the dispatcher
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Ledger write failed after work started; `report` holds what was decided
    #[error("run stopped after a checkpoint write failed: {source}")]
    Checkpoint {
        #[source]
        source: LedgerError,
        report: Box<RunReport>,
    },

    /// HTTP client could not be constructed
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}
