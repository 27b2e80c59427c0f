// Candidate loading from JSON Lines
//
// One object per line: {"entity_id": "...", "desired_state": {...}}. Blank
// lines are ignored.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use bulkmut_engine::{normalize_entity_id, WorkItem};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct CandidateLine {
    entity_id: String,
    desired_state: serde_json::Value,
}

/// Prepend `prefix` unless the id already carries it
pub fn normalize_id(raw: &str, prefix: Option<&str>) -> String {
    let id = raw.trim();
    match prefix {
        Some(prefix) if !prefix.is_empty() && !id.starts_with(prefix) => format!("{prefix}{id}"),
        _ => id.to_string(),
    }
}

pub fn load_candidates(path: &Path, id_prefix: Option<&str>) -> Result<Vec<WorkItem>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open candidate file {}", path.display()))?;
    parse_candidates(BufReader::new(file), id_prefix)
        .with_context(|| format!("Failed to read candidates from {}", path.display()))
}

pub fn parse_candidates(reader: impl BufRead, id_prefix: Option<&str>) -> Result<Vec<WorkItem>> {
    let mut items = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("line {line_no}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let candidate: CandidateLine = serde_json::from_str(&line)
            .with_context(|| format!("line {line_no}: expected {{\"entity_id\", \"desired_state\"}}"))?;
        if normalize_entity_id(&candidate.entity_id).is_none() {
            bail!("line {line_no}: entity_id must be non-empty and contain no line breaks");
        }
        items.push(WorkItem::new(
            normalize_id(&candidate.entity_id, id_prefix),
            candidate.desired_state,
        ));
    }
    Ok(items)
}
