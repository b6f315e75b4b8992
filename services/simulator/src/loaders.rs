//! Readers for the problem set, pre-extracted concepts and interaction profiles.

use anyhow::Context;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;
use tutorsim_core::concept::ExtractedConcept;
use tutorsim_core::profile::InteractionFeature;

/// One row of the problem set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProblemRow {
    pub problem: String,
    pub solution: String,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default, rename = "type")]
    pub category: Option<String>,
    /// Reference student queries, used for length control.
    #[serde(default)]
    pub user_queries: Vec<String>,
    #[serde(default)]
    pub problem_1_turns: i64,
}

/// A problem with its row-index id.
#[derive(Debug, Clone, PartialEq)]
pub struct Problem {
    pub id: String,
    pub row: ProblemRow,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Loads problems, keeping the first `limit` when `limit` is positive.
pub fn load_problems(path: &Path, limit: i64) -> anyhow::Result<Vec<Problem>> {
    let rows: Vec<ProblemRow> = read_json(path)?;
    let take = usize::try_from(limit)
        .ok()
        .filter(|&n| n > 0)
        .unwrap_or(rows.len());
    Ok(rows
        .into_iter()
        .take(take)
        .enumerate()
        .map(|(idx, row)| Problem {
            id: idx.to_string(),
            row,
        })
        .collect())
}

/// Problem id to its extracted `(name, explanation)` concepts.
pub fn load_concepts(path: &Path) -> anyhow::Result<BTreeMap<String, Vec<ExtractedConcept>>> {
    read_json(path)
}

pub fn load_profile_features(path: &Path) -> anyhow::Result<Vec<InteractionFeature>> {
    read_json(path)
}
