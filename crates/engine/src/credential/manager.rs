//! Credential manager
//!
//! Owns the access/refresh token pair of one remote account. All state is
//! guarded by one async mutex that is held across the liveness probe and the
//! refresh call, which is what makes refresh single-flight: callers that queue
//! behind an in-flight refresh observe the new token instead of issuing their
//! own request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::oauth::{RefreshTokenRequest, TokenResponse};
use crate::config::duration_millis;
use crate::error::CredentialError;
use crate::remote::{excerpt, BODY_EXCERPT_LEN};

/// Static credential material for one account
#[derive(Clone, Default)]
pub struct AccountCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("access_token", &redacted(&self.access_token))
            .field("refresh_token", &redacted(&self.refresh_token))
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .finish()
    }
}

impl AccountCredentials {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Load `<PREFIX>_ACCESS_TOKEN`, `<PREFIX>_REFRESH_TOKEN`,
    /// `<PREFIX>_CLIENT_ID` and `<PREFIX>_CLIENT_SECRET`
    ///
    /// Missing variables become empty strings; the manager rejects them on use.
    pub fn from_env(prefix: &str) -> Self {
        let var = |name: &str| {
            std::env::var(format!("{prefix}_{name}"))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        Self {
            access_token: var("ACCESS_TOKEN"),
            refresh_token: var("REFRESH_TOKEN"),
            client_id: var("CLIENT_ID"),
            client_secret: var("CLIENT_SECRET"),
        }
    }

    /// First missing piece of static material, if any
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.client_id.trim().is_empty() {
            Some("client_id")
        } else if self.client_secret.trim().is_empty() {
            Some("client_secret")
        } else if self.refresh_token.trim().is_empty() {
            Some("refresh_token")
        } else {
            None
        }
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

/// Credential manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialConfig {
    /// OAuth token endpoint
    pub token_url: String,

    /// Authenticated GET used as a liveness probe
    pub validation_url: String,

    /// How long a successful probe is trusted
    #[serde(with = "duration_millis")]
    pub validation_interval: Duration,

    /// Refresh proactively when the token expires sooner than this
    #[serde(with = "duration_millis")]
    pub expiry_margin: Duration,

    /// Consecutive refresh failures before the manager gives up
    pub max_refresh_attempts: u32,

    /// Timeout for probe and token calls
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl CredentialConfig {
    pub fn new(token_url: impl Into<String>, validation_url: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            validation_url: validation_url.into(),
            validation_interval: Duration::from_secs(300),
            expiry_margin: Duration::from_secs(60),
            max_refresh_attempts: 3,
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }

    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    pub fn with_max_refresh_attempts(mut self, attempts: u32) -> Self {
        self.max_refresh_attempts = attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Transient read-only snapshot of the bearer credential
///
/// `generation` identifies which refresh produced the token, so a worker that
/// got a 401 can ask for a refresh only if nobody refreshed since.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    value: String,
    generation: u64,
}

impl BearerToken {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &redacted(&self.value))
            .field("generation", &self.generation)
            .finish()
    }
}

struct CredentialState {
    material: AccountCredentials,
    expires_at: Option<Instant>,
    valid: bool,
    last_validation: Option<Instant>,
    consecutive_refresh_failures: u32,
    generation: u64,
}

impl CredentialState {
    fn needs_validation(&self, now: Instant, interval: Duration) -> bool {
        !self.valid
            || self
                .last_validation
                .map_or(true, |at| now.saturating_duration_since(at) > interval)
    }

    fn close_to_expiry(&self, now: Instant, margin: Duration) -> bool {
        self.expires_at
            .is_some_and(|at| at.saturating_duration_since(now) < margin)
    }

    fn bearer(&self) -> BearerToken {
        BearerToken {
            value: self.material.access_token.clone(),
            generation: self.generation,
        }
    }

    /// Swap in a new token pair; all fields change together
    fn apply(&mut self, response: TokenResponse, now: Instant) {
        if let Some(refresh_token) = response.refresh_token.filter(|t| !t.is_empty()) {
            self.material.refresh_token = refresh_token;
        }
        self.material.access_token = response.access_token;
        self.expires_at = response
            .expires_in
            .filter(|secs| *secs > 0)
            .and_then(|secs| now.checked_add(Duration::from_secs(secs)));
        self.valid = true;
        self.last_validation = Some(now);
        self.consecutive_refresh_failures = 0;
        self.generation += 1;
    }
}

/// Credential manager for one remote account
///
/// # Example
///
/// ```ignore
/// let manager = CredentialManager::new(
///     AccountCredentials::from_env("STORE"),
///     CredentialConfig::new(token_url, validation_url),
/// )?;
///
/// let token = manager.get_credential().await?;
/// let resp = http.get(url).bearer_auth(token.as_str()).send().await?;
/// if resp.status() == 401 {
///     manager.refresh_stale(&token).await?;
/// }
/// ```
pub struct CredentialManager {
    http: reqwest::Client,
    config: CredentialConfig,
    state: Mutex<CredentialState>,
    refresh_calls: AtomicU64,
}

impl CredentialManager {
    /// Create a manager; the cached token starts unvalidated
    pub fn new(
        credentials: AccountCredentials,
        config: CredentialConfig,
    ) -> Result<Self, CredentialError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self::with_http_client(credentials, config, http))
    }

    /// Create a manager sharing an existing HTTP client
    pub fn with_http_client(
        credentials: AccountCredentials,
        config: CredentialConfig,
        http: reqwest::Client,
    ) -> Self {
        Self {
            http,
            config,
            state: Mutex::new(CredentialState {
                material: credentials,
                expires_at: None,
                valid: false,
                last_validation: None,
                consecutive_refresh_failures: 0,
                generation: 0,
            }),
            refresh_calls: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Number of token endpoint calls made so far
    pub fn refresh_count(&self) -> u64 {
        self.refresh_calls.load(Ordering::Relaxed)
    }

    /// Return a usable bearer token, probing and refreshing when needed
    pub async fn get_credential(&self) -> Result<BearerToken, CredentialError> {
        let mut state = self.state.lock().await;
        self.ensure_usable(&state)?;

        let now = Instant::now();
        if state.needs_validation(now, self.config.validation_interval) {
            if self.probe(&state.material.access_token).await {
                state.valid = true;
                state.last_validation = Some(Instant::now());
            } else {
                state.valid = false;
                info!("Access token failed liveness check, refreshing");
                self.refresh_locked(&mut state).await?;
            }
        }

        if state.close_to_expiry(Instant::now(), self.config.expiry_margin) {
            if let Err(e) = self.refresh_locked(&mut state).await {
                warn!(error = %e, "Proactive refresh before expiry failed, keeping current token");
            }
        }

        Ok(state.bearer())
    }

    /// Exchange the refresh token for a new pair
    ///
    /// With `blocking = false` the call returns `Ok(false)` immediately when a
    /// refresh (or any other credential operation) is already running.
    pub async fn refresh(&self, blocking: bool) -> Result<bool, CredentialError> {
        let mut state = if blocking {
            self.state.lock().await
        } else {
            match self.state.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("Refresh already in flight, skipping");
                    return Ok(false);
                }
            }
        };
        self.ensure_usable(&state)?;
        self.refresh_locked(&mut state).await?;
        Ok(true)
    }

    /// Refresh only if `stale` is still the current token
    ///
    /// Concurrent 401s observed with the same token collapse into a single
    /// token endpoint call; later callers see the bumped generation and return.
    pub async fn refresh_stale(&self, stale: &BearerToken) -> Result<(), CredentialError> {
        let mut state = self.state.lock().await;
        if state.generation != stale.generation {
            debug!(
                seen = stale.generation,
                current = state.generation,
                "Token already refreshed by another caller"
            );
            return Ok(());
        }
        self.ensure_usable(&state)?;
        state.valid = false;
        self.refresh_locked(&mut state).await
    }

    /// Clear the permanent-failure state after operator intervention
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_refresh_failures = 0;
        state.valid = false;
        info!("Credential manager reset");
    }

    fn ensure_usable(&self, state: &MutexGuard<'_, CredentialState>) -> Result<(), CredentialError> {
        if let Some(field) = state.material.missing_field() {
            return Err(CredentialError::Missing(field));
        }
        if state.consecutive_refresh_failures >= self.config.max_refresh_attempts {
            return Err(CredentialError::RefreshExhausted {
                attempts: state.consecutive_refresh_failures,
            });
        }
        Ok(())
    }

    async fn probe(&self, access_token: &str) -> bool {
        if access_token.is_empty() {
            return false;
        }
        match self
            .http
            .get(&self.config.validation_url)
            .bearer_auth(access_token)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!("Access token validated");
                true
            }
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "Access token rejected by liveness check");
                false
            }
            Err(e) => {
                warn!(error = %e, "Liveness check failed");
                false
            }
        }
    }

    async fn refresh_locked(&self, state: &mut CredentialState) -> Result<(), CredentialError> {
        self.refresh_calls.fetch_add(1, Ordering::Relaxed);
        match self.exchange(&state.material).await {
            Ok(response) => {
                state.apply(response, Instant::now());
                info!(generation = state.generation, "Access token refreshed");
                Ok(())
            }
            Err(e) => {
                state.consecutive_refresh_failures += 1;
                error!(
                    error = %e,
                    consecutive_failures = state.consecutive_refresh_failures,
                    "Token refresh failed"
                );
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        material: &AccountCredentials,
    ) -> Result<TokenResponse, CredentialError> {
        let request = RefreshTokenRequest::new(
            &material.client_id,
            &material.client_secret,
            &material.refresh_token,
        );
        let resp = self
            .http
            .post(&self.config.token_url)
            .form(&request)
            .send()
            .await?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::OAuth {
                status: status.as_u16(),
                body: excerpt(&body, BODY_EXCERPT_LEN),
            });
        }

        let body = resp.text().await?;
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| CredentialError::MalformedResponse(e.to_string()))?;
        if parsed.access_token.trim().is_empty() {
            return Err(CredentialError::MalformedResponse(
                "empty access_token".into(),
            ));
        }
        Ok(parsed)
    }
}
