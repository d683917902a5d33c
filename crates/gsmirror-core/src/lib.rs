//! Core domain model, record fingerprinting, and canonical schema for the
//! Gold Standard registry mirror.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "gsmirror-core";

/// One catalog entry exactly as the registry API returned it.
pub type RawRecord = serde_json::Map<String, JsonValue>;

/// Fields whose values identify a project across pages and re-runs.
pub const FINGERPRINT_KEYS: [&str; 3] = ["sustaincert_id", "name", "country"];

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("record is missing required field `{0}`")]
    MissingField(String),
}

#[derive(Debug, Error)]
pub enum GoalParseError {
    #[error("goal name `{0}` has no leading numeric identifier")]
    MalformedGoal(String),
}

/// String form of a JSON scalar as it should appear in a flat column.
///
/// Strings are taken verbatim (no surrounding quotes); everything else is its
/// compact JSON rendering. Null renders as the empty string.
pub fn value_repr(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// SHA-256 hex digest over the ordered tuple of the named fields' string
/// representations. The digest is the dedup key for a record, so it must be
/// stable across processes and re-fetches of the same entity.
///
/// An absent or null required field is an error, never a silent default.
pub fn fingerprint(record: &RawRecord, keys: &[&str]) -> Result<String, FingerprintError> {
    let mut hasher = Sha256::new();
    for key in keys {
        let value = record
            .get(*key)
            .filter(|v| !v.is_null())
            .ok_or_else(|| FingerprintError::MissingField((*key).to_string()))?;
        hasher.update(value_repr(value).as_bytes());
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Parse the leading numeric token of a goal name of the form
/// `"<number>: <description>"`.
pub fn parse_goal_id(goal_name: &str) -> Result<String, GoalParseError> {
    let digits: String = goal_name
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return Err(GoalParseError::MalformedGoal(goal_name.to_string()));
    }
    Ok(digits)
}

/// Last path segment of a SustainCert project URL, used as the `projectID`
/// for document lookups.
pub fn project_id_from_url(url: &str) -> Option<String> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
}

/// One sustainability-goal reference as embedded in a catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdgGoal {
    pub name: String,
    #[serde(default)]
    pub issuable_products: Vec<JsonValue>,
}

/// One distinct goal definition extracted across the whole corpus.
/// Serialized field order is the output column order: goal, product, goal_id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalRow {
    pub goal: String,
    pub product: String,
    pub goal_id: String,
}

/// File names known to be publicly downloadable for one project. An empty
/// manifest is a valid terminal state, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentManifest {
    pub project_id: String,
    pub files: Vec<String>,
}

impl DocumentManifest {
    pub fn empty(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            files: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// The flat, rectangular projection of a catalog record.
///
/// Field declaration order is the canonical output column order; the CSV
/// writer emits columns in exactly this order regardless of how keys were
/// ordered in the upstream JSON. List-typed upstream fields
/// (`sustaincert_url`, `sustainable_development_goals`, `labels`, `files`)
/// are carried as serialized JSON blobs so the row stays rectangular.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub name: String,
    pub description: String,
    pub status: String,
    pub gsf_standards_version: String,
    pub estimated_annual_credits: String,
    pub crediting_period_start_date: String,
    pub crediting_period_end_date: String,
    pub methodology: String,
    #[serde(rename = "type")]
    pub project_type: String,
    pub size: String,
    pub sustaincert_id: String,
    pub sustaincert_url: String,
    pub project_developer: String,
    pub carbon_stream: String,
    pub country: String,
    pub country_code: String,
    pub state: String,
    pub programme_of_activities: String,
    pub poa_project_id: String,
    pub poa_project_sustaincert_id: String,
    pub poa_project_name: String,
    pub sustainable_development_goals: String,
    pub labels: String,
    pub hsh: String,
    pub files: String,
}

impl ProjectRow {
    /// The `projectID` this row's documents live under, derived from the
    /// serialized singleton `sustaincert_url` list.
    pub fn document_project_id(&self) -> Option<String> {
        let urls: Vec<String> = serde_json::from_str(&self.sustaincert_url).ok()?;
        urls.first().and_then(|url| project_id_from_url(url))
    }
}
