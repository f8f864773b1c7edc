//! Data models returned to callers.
//!
//! These types are serialized to JSON by the CLI and are stable across the
//! library boundary.

use serde::{Deserialize, Deserializer, Serialize};

/// Outcome of one batch evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    /// Textual output with all sentinel lines removed, trimmed.
    pub result: String,
    /// Storage references for captured plots, in emission order.
    pub image_paths: Vec<String>,
    /// `file://` URLs of stored widget documents, in emission order.
    pub widget_paths: Vec<String>,
    /// Rendered help document, empty unless the code was a help request.
    pub help_content: String,
    /// Snapshot of the session's user environment after the evaluation.
    pub environment: Vec<EnvironmentVariable>,
}

/// One binding in the session's user environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVariable {
    pub name: String,
    /// Class vector of the value (`class(x)`), e.g. `["data.frame"]`.
    #[serde(rename = "type", deserialize_with = "one_or_many")]
    pub type_tags: Vec<String>,
    /// Approximate size in bytes.
    #[serde(deserialize_with = "byte_size")]
    pub size: u64,
    /// Truncated one-line rendering of the value.
    #[serde(alias = "value", deserialize_with = "joined_text")]
    pub value_preview: String,
}

impl EnvironmentVariable {
    /// Primary class, or an empty string.
    pub fn type_name(&self) -> &str {
        self.type_tags.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Auto-unboxed JSON turns length-one vectors into scalars.
fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    OneOrMany::deserialize(deserializer).map(OneOrMany::into_vec)
}

fn joined_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    OneOrMany::deserialize(deserializer).map(|v| v.into_vec().join(" "))
}

fn byte_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let size = f64::deserialize(deserializer)?;
    Ok(if size.is_finite() && size > 0.0 {
        size.round() as u64
    } else {
        0
    })
}

/// Zero-based position inside a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Position { line, character }
    }
}

/// A completion offer, already resolved from the server's item shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionCandidate {
    pub label: String,
    pub insert_text: String,
    pub detail: String,
    pub documentation: Option<String>,
}

/// One callable signature from a signature-help response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub label: String,
    pub documentation: Option<String>,
}
