// HTTP client for the remote entity API
//
// Speaks `GET /entities/{id}` and `PUT /entities/{id}` with bearer auth. Status
// codes are returned as data; classification happens in the worker.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Url;
use serde_json::Value;

use crate::error::EngineError;
use crate::reliability::QuotaHeaders;

const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Longest body excerpt carried in diagnostics and errors
pub(crate) const BODY_EXCERPT_LEN: usize = 300;

/// Truncate a response body on a char boundary
pub(crate) fn excerpt(body: &str, max_len: usize) -> String {
    if body.len() <= max_len {
        return body.to_string();
    }
    let mut end = max_len;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Captured response of one remote call
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub quota: QuotaHeaders,
    pub body: String,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    async fn capture(response: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = response.status().as_u16();
        let headers = response.headers();
        let retry_after = header_str(headers, RETRY_AFTER.as_str()).map(str::to_string);
        let quota = QuotaHeaders::parse(
            header_str(headers, RATE_LIMIT_LIMIT),
            header_str(headers, RATE_LIMIT_REMAINING),
        );
        let body = response.text().await?;
        Ok(Self {
            status,
            retry_after,
            quota,
            body,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Client for one remote account's entity API
#[derive(Debug, Clone)]
pub struct RemoteApi {
    base_url: Url,
    http: reqwest::Client,
}

impl RemoteApi {
    /// Build a client with its own connection pool and per-request timeout
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::HttpClient(e.to_string()))?;
        Self::with_http_client(base_url, http)
    }

    pub fn with_http_client(base_url: &str, http: reqwest::Client) -> Result<Self, EngineError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| EngineError::HttpClient(format!("invalid base url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(EngineError::HttpClient(format!(
                "base url {base_url} cannot carry a path"
            )));
        }
        Ok(Self { base_url, http })
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// URL of one entity; the id is percent-encoded as a single path segment
    pub fn entity_url(&self, entity_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("entities").push(entity_id);
        }
        url
    }

    pub async fn get_entity(
        &self,
        entity_id: &str,
        bearer: &str,
    ) -> Result<RemoteResponse, reqwest::Error> {
        let response = self
            .http
            .get(self.entity_url(entity_id))
            .bearer_auth(bearer)
            .send()
            .await?;
        RemoteResponse::capture(response).await
    }

    pub async fn put_entity(
        &self,
        entity_id: &str,
        bearer: &str,
        payload: &Value,
    ) -> Result<RemoteResponse, reqwest::Error> {
        let response = self
            .http
            .put(self.entity_url(entity_id))
            .bearer_auth(bearer)
            .json(payload)
            .send()
            .await?;
        RemoteResponse::capture(response).await
    }
}
