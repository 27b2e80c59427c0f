// Credential manager against a mock OAuth server
//
// Run with: cargo test -p bulkmut-engine --test credential_refresh

mod common;

use std::sync::Arc;
use std::time::Duration;

use bulkmut_engine::prelude::*;
use common::*;
use futures::future::join_all;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_validation_rejects(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(VALIDATION_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_valid_token_is_probed_once_and_reused() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(VALIDATION_PATH))
        .and(header("authorization", format!("Bearer {INITIAL_TOKEN}").as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    mount_token_endpoint(&server, 0).await;

    let manager = credential_manager(&server);
    for _ in 0..3 {
        let token = manager.get_credential().await.unwrap();
        assert_eq!(token.as_str(), INITIAL_TOKEN);
        assert_eq!(token.generation(), 0);
    }
    assert_eq!(manager.refresh_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_concurrent_callers_share_one_refresh() {
    let server = MockServer::start().await;
    mount_validation_rejects(&server).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": FRESH_TOKEN, "refresh_token": "refresh-2"}))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = credential_manager(&server);
    let calls = (0..16).map(|_| {
        let manager = Arc::clone(&manager);
        async move { manager.get_credential().await }
    });
    let results = join_all(calls).await;

    for result in results {
        let token = result.unwrap();
        assert_eq!(token.as_str(), FRESH_TOKEN);
        assert_eq!(token.generation(), 1);
    }
    assert_eq!(manager.refresh_count(), 1);
}

#[tokio::test]
async fn test_stale_refresh_collapses_after_first_caller() {
    let server = MockServer::start().await;
    mount_validation_ok(&server).await;
    mount_token_endpoint(&server, 1).await;

    let manager = credential_manager(&server);
    let stale = manager.get_credential().await.unwrap();

    let refreshes = (0..8).map(|_| {
        let manager = Arc::clone(&manager);
        let stale = stale.clone();
        async move { manager.refresh_stale(&stale).await }
    });
    for result in join_all(refreshes).await {
        result.unwrap();
    }

    let current = manager.get_credential().await.unwrap();
    assert_eq!(current.as_str(), FRESH_TOKEN);
    assert_eq!(manager.refresh_count(), 1);
}

#[tokio::test]
async fn test_non_blocking_refresh_skips_while_in_flight() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": FRESH_TOKEN}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = credential_manager(&server);
    let blocking = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.refresh(true).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!manager.refresh(false).await.unwrap());
    assert!(blocking.await.unwrap().unwrap());
}

#[tokio::test]
async fn test_refresh_keeps_refresh_token_when_not_rotated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "a2"})))
        .expect(2)
        .mount(&server)
        .await;

    let manager = credential_manager(&server);
    assert!(manager.refresh(true).await.unwrap());
    assert!(manager.refresh(true).await.unwrap());

    let requests = server.received_requests().await.unwrap();
    let token_calls: Vec<_> = requests
        .iter()
        .filter(|r| r.url.path() == TOKEN_PATH)
        .collect();
    assert_eq!(token_calls.len(), 2);
    // No rotation in the first response, so the original token is sent again
    let body = String::from_utf8_lossy(&token_calls[1].body);
    assert!(body.contains("refresh_token=refresh-1"));
}

#[tokio::test]
async fn test_refresh_failures_exhaust_until_reset() {
    let server = MockServer::start().await;
    mount_validation_rejects(&server).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
        .expect(4)
        .mount(&server)
        .await;

    let manager = credential_manager(&server);
    for _ in 0..3 {
        match manager.get_credential().await {
            Err(CredentialError::OAuth { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("expected OAuth error, got {other:?}"),
        }
    }

    let err = manager.get_credential().await.unwrap_err();
    assert!(matches!(err, CredentialError::RefreshExhausted { attempts: 3 }));
    assert!(err.is_fatal());
    assert!(matches!(
        manager.refresh(true).await,
        Err(CredentialError::RefreshExhausted { .. })
    ));

    manager.reset().await;
    assert!(matches!(
        manager.get_credential().await,
        Err(CredentialError::OAuth { .. })
    ));
    assert_eq!(manager.refresh_count(), 4);
}

#[tokio::test]
async fn test_malformed_token_response_is_reported() {
    let server = MockServer::start().await;
    mount_validation_rejects(&server).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": ""})))
        .mount(&server)
        .await;

    let manager = credential_manager(&server);
    let err = manager.get_credential().await.unwrap_err();
    assert!(matches!(err, CredentialError::MalformedResponse(_)));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn test_short_lived_token_is_refreshed_proactively() {
    let server = MockServer::start().await;
    mount_validation_ok(&server).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": FRESH_TOKEN, "expires_in": 30})),
        )
        .expect(2)
        .mount(&server)
        .await;

    let manager = credential_manager(&server);
    assert!(manager.refresh(true).await.unwrap());

    // 30s lifetime is inside the default 60s margin
    let token = manager.get_credential().await.unwrap();
    assert_eq!(token.generation(), 2);
}

#[tokio::test]
async fn test_oversized_expires_in_does_not_break_refresh() {
    let server = MockServer::start().await;
    mount_validation_rejects(&server).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"access_token": FRESH_TOKEN, "expires_in": u64::MAX}),
        ))
        .expect(1)
        .mount(&server)
        .await;

    let manager = credential_manager(&server);
    let token = manager.get_credential().await.unwrap();
    assert_eq!(token.as_str(), FRESH_TOKEN);

    // No known expiry, so the next call reuses the token
    let again = manager.get_credential().await.unwrap();
    assert_eq!(again.generation(), token.generation());
    assert_eq!(manager.refresh_count(), 1);
}
