// Domain types flowing through the engine
//
// The engine never looks inside `desired_state`; it is passed through to the
// payload builder unmodified.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entity mutation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub entity_id: String,
    pub desired_state: Value,
}

impl WorkItem {
    pub fn new(entity_id: impl Into<String>, desired_state: Value) -> Self {
        Self {
            entity_id: entity_id.into(),
            desired_state,
        }
    }
}

/// Why an attempt should be requeued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    /// Remote answered 429
    RateLimited,
    /// 5xx, network error, timeout or a transient credential problem
    Transient,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limited"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

/// Classified result of one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Retryable {
        reason: RetryReason,
    },
    Terminal {
        reason: String,
        status_code: Option<u16>,
    },
}

impl Outcome {
    pub fn terminal(reason: impl Into<String>, status_code: Option<u16>) -> Self {
        Outcome::Terminal {
            reason: reason.into(),
            status_code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn retry_reason(&self) -> Option<RetryReason> {
        match self {
            Outcome::Retryable { reason } => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Retryable { reason } => write!(f, "retryable ({reason})"),
            Outcome::Terminal {
                reason,
                status_code: Some(code),
            } => write!(f, "terminal ({reason}, {code})"),
            Outcome::Terminal { reason, .. } => write!(f, "terminal ({reason})"),
        }
    }
}

/// Permanent failure entry handed to the failure report sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub entity_id: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// Canonical form of an entity id, or `None` if it cannot be one
///
/// Surrounding whitespace is trimmed. Ids that are empty after trimming or
/// contain a line break are rejected, since the ledger stores one id per line.
pub fn normalize_entity_id(raw: &str) -> Option<&str> {
    let id = raw.trim();
    if id.is_empty() || id.contains(['\n', '\r']) {
        return None;
    }
    Some(id)
}

/// Candidates after normalization and deduplication
#[derive(Debug, Default)]
pub struct Deduped {
    pub items: Vec<WorkItem>,
    /// Raw ids rejected by [`normalize_entity_id`] (empty ids are dropped silently)
    pub invalid: Vec<String>,
}

/// Deduplicate by normalized `entity_id`, keeping the last payload seen for each id
///
/// Items keep the position of their first occurrence and carry the normalized id.
pub fn dedupe_last_write_wins(items: impl IntoIterator<Item = WorkItem>) -> Deduped {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out = Deduped::default();

    for item in items {
        let Some(id) = normalize_entity_id(&item.entity_id) else {
            if item.entity_id.trim().is_empty() {
                tracing::warn!("Skipping work item with empty entity_id");
            } else {
                tracing::warn!(entity_id = ?item.entity_id, "Rejecting entity_id containing a line break");
                out.invalid.push(item.entity_id);
            }
            continue;
        };
        match index.get(id) {
            Some(&pos) => out.items[pos].desired_state = item.desired_state,
            None => {
                let id = id.to_string();
                index.insert(id.clone(), out.items.len());
                out.items.push(WorkItem::new(id, item.desired_state));
            }
        }
    }

    out
}
