//! One read-modify-write attempt for one entity
//!
//! A worker never loops: it makes one attempt (plus at most one retransmission
//! after a 401) and returns a classified [`Outcome`]. Retry scheduling belongs
//! to the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::credential::{BearerToken, CredentialManager};
use crate::error::CredentialError;
use crate::model::{Outcome, RetryReason, WorkItem};
use crate::payload::{parse_current, PayloadBuilder, PayloadError};
use crate::reliability::{parse_retry_after, AdaptiveRateLimiter};
use crate::remote::{excerpt, RemoteApi, RemoteResponse, BODY_EXCERPT_LEN};

const AUTH_FAILURE: &str = "auth failure";
const REJECTED: &str = "rejected";
const INVALID_PAYLOAD: &str = "invalid payload";

/// Structured detail of one attempt, for the dispatcher's logs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttemptDiagnostics {
    /// Last HTTP status seen, if any response arrived
    pub status: Option<u16>,
    /// Truncated response body
    pub body: String,
    /// Transport or credential error text
    pub error: Option<String>,
    /// Whether a 401 triggered a refresh and retransmission
    pub refreshed: bool,
}

/// Result of [`MutationWorker::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub outcome: Outcome,
    pub diagnostics: AttemptDiagnostics,
}

impl Attempt {
    fn new(outcome: Outcome, diagnostics: AttemptDiagnostics) -> Self {
        Self {
            outcome,
            diagnostics,
        }
    }
}

/// What one GET/PUT cycle produced
enum Exchange {
    Response(RemoteResponse),
    Transport(reqwest::Error),
    Invalid(PayloadError),
}

impl Exchange {
    fn is_unauthorized(&self) -> bool {
        matches!(self, Exchange::Response(r) if r.status == 401)
    }
}

/// Executes mutations against one remote account
///
/// Cheap to clone; all shared state sits behind `Arc`s.
#[derive(Clone)]
pub struct MutationWorker {
    remote: RemoteApi,
    credentials: Arc<CredentialManager>,
    limiter: Arc<AdaptiveRateLimiter>,
    payload: Arc<dyn PayloadBuilder>,
    default_throttle_pause: Duration,
}

impl MutationWorker {
    pub fn new(
        remote: RemoteApi,
        credentials: Arc<CredentialManager>,
        limiter: Arc<AdaptiveRateLimiter>,
        payload: Arc<dyn PayloadBuilder>,
    ) -> Self {
        Self {
            remote,
            credentials,
            limiter,
            payload,
            default_throttle_pause: Duration::from_secs(1),
        }
    }

    /// Pause applied on 429 when Retry-After is absent or unreadable
    pub fn with_default_throttle_pause(mut self, pause: Duration) -> Self {
        self.default_throttle_pause = pause;
        self
    }

    pub fn limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.limiter
    }

    /// Run one attempt for `item`
    #[instrument(skip(self, item), fields(entity_id = %item.entity_id))]
    pub async fn execute(&self, item: &WorkItem) -> Attempt {
        let mut diagnostics = AttemptDiagnostics::default();

        self.limiter.acquire().await;
        let token = match self.credentials.get_credential().await {
            Ok(token) => token,
            Err(e) => return credential_failure(e, diagnostics),
        };

        let mut exchange = self.send(item, &token).await;

        if exchange.is_unauthorized() {
            diagnostics.refreshed = true;
            debug!("Unauthorized, refreshing credential before retransmission");
            exchange = match self.resend_after_refresh(item, &token).await {
                Ok(exchange) => exchange,
                Err(e) => {
                    diagnostics.status = Some(401);
                    diagnostics.error = Some(e.to_string());
                    return Attempt::new(Outcome::terminal(AUTH_FAILURE, Some(401)), diagnostics);
                }
            };
        }

        self.classify(exchange, diagnostics)
    }

    async fn resend_after_refresh(
        &self,
        item: &WorkItem,
        stale: &BearerToken,
    ) -> Result<Exchange, CredentialError> {
        self.credentials.refresh_stale(stale).await?;
        self.limiter.acquire().await;
        let token = self.credentials.get_credential().await?;
        Ok(self.send(item, &token).await)
    }

    /// GET (when the builder needs it), build, PUT
    async fn send(&self, item: &WorkItem, token: &BearerToken) -> Exchange {
        let current = if self.payload.needs_current() {
            let response = match self.remote.get_entity(&item.entity_id, token.as_str()).await {
                Ok(response) => response,
                Err(e) => return Exchange::Transport(e),
            };
            if !response.is_success() {
                return Exchange::Response(response);
            }
            match parse_current(&response.body) {
                Ok(value) => value,
                Err(e) => return Exchange::Invalid(e),
            }
        } else {
            serde_json::Value::Null
        };

        let payload = match self.payload.build(&current, &item.desired_state) {
            Ok(payload) => payload,
            Err(e) => return Exchange::Invalid(e),
        };

        match self
            .remote
            .put_entity(&item.entity_id, token.as_str(), &payload)
            .await
        {
            Ok(response) => Exchange::Response(response),
            Err(e) => Exchange::Transport(e),
        }
    }

    fn classify(&self, exchange: Exchange, mut diagnostics: AttemptDiagnostics) -> Attempt {
        let response = match exchange {
            Exchange::Response(response) => response,
            Exchange::Transport(e) => {
                diagnostics.error = Some(e.to_string());
                return Attempt::new(
                    Outcome::Retryable {
                        reason: RetryReason::Transient,
                    },
                    diagnostics,
                );
            }
            Exchange::Invalid(e) => {
                diagnostics.error = Some(e.to_string());
                return Attempt::new(Outcome::terminal(INVALID_PAYLOAD, None), diagnostics);
            }
        };

        diagnostics.status = Some(response.status);
        diagnostics.body = excerpt(&response.body, BODY_EXCERPT_LEN);
        self.limiter.observe_quota(response.quota);

        let outcome = match response.status {
            200..=299 => {
                self.limiter.reset_consecutive_throttles();
                Outcome::Success
            }
            401 => Outcome::terminal(AUTH_FAILURE, Some(401)),
            429 => {
                let pause = response
                    .retry_after
                    .as_deref()
                    .and_then(|v| parse_retry_after(v, Utc::now()))
                    .unwrap_or(self.default_throttle_pause);
                let factor = self.limiter.config().penalty.requested_factor;
                let applied = self.limiter.penalize(factor);
                self.limiter.pause_for(pause);
                debug!(
                    pause_ms = pause.as_millis() as u64,
                    multiplier = applied,
                    "Throttled by remote"
                );
                Outcome::Retryable {
                    reason: RetryReason::RateLimited,
                }
            }
            500..=599 => Outcome::Retryable {
                reason: RetryReason::Transient,
            },
            status => Outcome::terminal(REJECTED, Some(status)),
        };

        Attempt::new(outcome, diagnostics)
    }
}

fn credential_failure(error: CredentialError, mut diagnostics: AttemptDiagnostics) -> Attempt {
    diagnostics.error = Some(error.to_string());
    let outcome = if error.is_fatal() {
        Outcome::terminal(AUTH_FAILURE, None)
    } else {
        warn!(error = %error, "Credential unavailable, will retry later");
        Outcome::Retryable {
            reason: RetryReason::Transient,
        }
    };
    Attempt::new(outcome, diagnostics)
}
