//! Server backpressure signal parsing

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Minimum pause derived from an HTTP-date Retry-After
const MIN_DATE_PAUSE: Duration = Duration::from_secs(1);

/// Parse a `Retry-After` header value into a pause duration
///
/// Accepts delta-seconds (`"2"`, `"1.5"`) or an HTTP-date. Dates in the past
/// (or less than a second away) yield one second. Values too large for a
/// [`Duration`] saturate to [`Duration::MAX`]; the limiter caps them. Unparseable
/// values yield `None` so the caller can fall back to its default pause.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX));
        }
        return None;
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let delta = (at - now).to_std().unwrap_or(Duration::ZERO);
    Some(delta.max(MIN_DATE_PAUSE))
}

/// Quota hints some APIs attach to every response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaHeaders {
    /// `X-RateLimit-Limit`
    pub limit: Option<u32>,
    /// `X-RateLimit-Remaining`
    pub remaining: Option<u32>,
}

impl QuotaHeaders {
    /// Build from raw header values, ignoring anything non-numeric
    pub fn parse(limit: Option<&str>, remaining: Option<&str>) -> Self {
        Self {
            limit: limit.and_then(|v| v.trim().parse().ok()),
            remaining: remaining.and_then(|v| v.trim().parse().ok()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none()
    }
}
