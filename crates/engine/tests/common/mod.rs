// Shared fixtures for integration tests against a wiremock remote
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bulkmut_engine::prelude::*;
use bulkmut_engine::reliability::CircuitBreakerConfig;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN_PATH: &str = "/oauth/token";
pub const VALIDATION_PATH: &str = "/users/me";
pub const INITIAL_TOKEN: &str = "initial-token";
pub const FRESH_TOKEN: &str = "fresh-token";

pub fn account() -> AccountCredentials {
    AccountCredentials::new(INITIAL_TOKEN, "refresh-1", "client-1", "secret-1")
}

pub fn credential_config(server: &MockServer) -> CredentialConfig {
    CredentialConfig::new(
        format!("{}{}", server.uri(), TOKEN_PATH),
        format!("{}{}", server.uri(), VALIDATION_PATH),
    )
    .with_timeout(Duration::from_secs(2))
}

pub fn credential_manager(server: &MockServer) -> Arc<CredentialManager> {
    Arc::new(CredentialManager::new(account(), credential_config(server)).unwrap())
}

/// Limiter fast enough that tests are never paced by it
pub fn fast_limiter() -> LimiterConfig {
    LimiterConfig::default()
        .with_bounds(5.0, 1000.0)
        .with_init_rate(500.0)
        .with_pause_bounds(Duration::ZERO, Duration::from_secs(5))
        .with_circuit_breaker(
            CircuitBreakerConfig::default()
                .with_threshold(50)
                .with_cooldown(Duration::from_millis(50)),
        )
}

pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_limiter(fast_limiter())
        .with_max_concurrency(8)
        .with_max_drain_iterations(3)
        .with_drain_pause(Duration::ZERO)
        .with_request_timeout(Duration::from_secs(2))
        .with_default_throttle_pause(Duration::from_millis(10))
        .with_progress_interval(Duration::from_millis(200))
        .with_shutdown_timeout(Duration::from_secs(1))
        .with_shuffle(false)
}

pub fn remote(server: &MockServer) -> RemoteApi {
    RemoteApi::new(&server.uri(), Duration::from_secs(2)).unwrap()
}

/// Liveness probe accepts any bearer
pub async fn mount_validation_ok(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(VALIDATION_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
        .mount(server)
        .await;
}

/// Token endpoint that hands out [`FRESH_TOKEN`] exactly `times` times
pub async fn mount_token_endpoint(server: &MockServer, times: u64) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": FRESH_TOKEN,
            "refresh_token": "refresh-2",
            "expires_in": 21600
        })))
        .expect(times)
        .mount(server)
        .await;
}

/// Existing entity returned by every GET
pub async fn mount_entity_reads(server: &MockServer) {
    Mock::given(method("GET"))
        .and(wiremock::matchers::path_regex(r"^/entities/[^/]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"price": 90, "stock": 3})))
        .mount(server)
        .await;
}

pub fn entity_path(id: &str) -> String {
    format!("/entities/{id}")
}
