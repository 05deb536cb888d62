// SPDX-License-Identifier: MIT

//! Strict parsing of reasoning-engine output
//!
//! The model answers in free text that is expected to contain one JSON
//! object. Everything past this module deals in typed values only.

use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use super::state::FieldValue;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("No JSON object found in model output")]
    NoJson,

    #[error("Malformed JSON in model output: {0}")]
    Malformed(String),

    #[error("Unexpected response shape: {0}")]
    UnexpectedShape(String),
}

/// Answer to the field identification prompt
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct IdentifyResponse {
    /// Catalog field names that appear in the transcript
    pub present: Vec<String>,
    /// Catalog field names that do not appear
    #[serde(default)]
    pub absent: Vec<String>,
    /// Short explanation of the judgement
    #[serde(default)]
    pub reasoning: String,
}

/// Answer to a value extraction prompt
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ExtractResponse {
    /// One entry per requested field
    pub fields: BTreeMap<String, FieldReport>,
    #[serde(default)]
    pub reasoning: String,
}

/// What the model reported for one field
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum FieldReport {
    Detailed {
        /// Exact value as printed on the form, or null
        value: Value,
        /// True when the transcript supports more than one reading
        #[serde(default)]
        ambiguous: bool,
        #[serde(default)]
        note: Option<String>,
    },
    Bare(Value),
}

/// Typed result for one field
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedField {
    pub value: FieldValue,
    pub ambiguous: bool,
    pub note: Option<String>,
}

impl FieldReport {
    /// Narrow the raw report to a scalar value
    pub fn into_parsed(self) -> Result<ParsedField, ParseError> {
        let (value, ambiguous, note) = match self {
            FieldReport::Detailed {
                value,
                ambiguous,
                note,
            } => (value, ambiguous, note),
            FieldReport::Bare(value) => (value, false, None),
        };
        Ok(ParsedField {
            value: scalar(value)?,
            ambiguous,
            note: note.filter(|n| !n.trim().is_empty()),
        })
    }
}

fn scalar(value: Value) -> Result<FieldValue, ParseError> {
    match value {
        Value::Null => Ok(FieldValue::Null),
        Value::Bool(b) => Ok(FieldValue::Bool(b)),
        // Integers are usually IDs or codes, keep every digit
        Value::Number(n) if n.is_u64() || n.is_i64() => Ok(FieldValue::Text(n.to_string())),
        Value::Number(n) => n
            .as_f64()
            .map(FieldValue::Number)
            .ok_or_else(|| ParseError::UnexpectedShape(format!("number out of range: {}", n))),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty()
                || ["null", "n/a", "none", "not present"]
                    .iter()
                    .any(|marker| trimmed.eq_ignore_ascii_case(marker))
            {
                Ok(FieldValue::Null)
            } else {
                Ok(FieldValue::Text(trimmed.to_string()))
            }
        }
        other => Err(ParseError::UnexpectedShape(format!(
            "expected a scalar value, got {}",
            other
        ))),
    }
}

/// Locate the first complete JSON object inside a completion
///
/// Code fences and chatter around the object are allowed, including stray
/// braces before or after it.
pub fn extract_json(text: &str) -> Result<&str, ParseError> {
    let mut first_error = None;
    for (start, _) in text.match_indices('{') {
        let rest = &text[start..];
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(_))) => return Ok(&rest[..stream.byte_offset()]),
            Some(Err(e)) => {
                first_error.get_or_insert_with(|| e.to_string());
            }
            _ => {}
        }
    }
    Err(first_error.map_or(ParseError::NoJson, ParseError::Malformed))
}

/// Parse a completion into a typed response
pub fn parse_response<T: DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    let json = extract_json(text)?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| ParseError::Malformed(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| ParseError::UnexpectedShape(e.to_string()))
}

/// JSON schema text for a response type, embedded in prompts
pub fn schema_text<T: JsonSchema>() -> String {
    let schema = schemars::schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
