//! Post-processing of raw model output.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::store::DataType;

/// Remove a verbatim echo of the human's input from the start of a response.
///
/// Two shapes count as an echo: the first line equals the input, or the
/// response starts with the input and the input is followed by a line break
/// (or nothing). Quoted text anywhere else is left alone.
///
/// A response without an echo is returned as written, less trailing whitespace.
pub fn strip_echo(response: &str, input: &str) -> String {
    let input = input.trim();
    if input.is_empty() {
        return response.trim_end().to_string();
    }

    let trimmed = response.trim_start();
    let (first_line, rest) = match trimmed.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (trimmed, ""),
    };
    if first_line.trim() == input {
        return rest.trim().to_string();
    }

    if let Some(rest) = trimmed.strip_prefix(input)
        && (rest.is_empty() || rest.starts_with('\n') || rest.starts_with("\r\n"))
    {
        return rest.trim().to_string();
    }

    response.trim_end().to_string()
}

/// Strip a surrounding markdown code fence, if any.
fn unfence(text: &str) -> &str {
    let text = text.trim();
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. `json`) on the opening fence line
    let inner = match inner.split_once('\n') {
        Some((_, body)) => body,
        None => inner,
    };
    inner.trim_end().strip_suffix("```").unwrap_or(inner).trim()
}

/// Parse structured model output, tolerating a code fence.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(unfence(text)).map_err(|e| Error::Validation(format!("malformed model output: {}", e)))
}

/// One element of an extraction response.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedItem {
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sentiment: f64,
    pub confidence: Option<f64>,
    pub strength: Option<f64>,
    pub level_current: Option<f64>,
    pub level_ideal: Option<f64>,
    pub relationship: Option<String>,
}

/// Parse an extraction response. Empty output means nothing was found.
pub fn parse_extraction(text: &str) -> Result<Vec<ExtractedItem>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let items: Vec<ExtractedItem> = parse_json(text)?;
    Ok(items.into_iter().filter(|i| !i.name.trim().is_empty()).collect())
}

/// Verdict on a pending validation.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ValidationVerdict {
    pub valid: bool,
    pub confidence: f64,
}
