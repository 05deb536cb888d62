// SPDX-License-Identifier: MIT

//! Workflow state threaded through every extraction node
//!
//! Fields are private so the invariants hold by construction:
//! - extracted keys are declared by the form catalog
//! - an extracted value is only replaced through [`WorkflowState::correct_field`]
//! - confidence keys are a subset of extracted keys
//! - nothing changes once a terminal step is reached

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::catalog::FormCatalog;

/// Scalar value extracted for a field
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// Pipeline position
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Start,
    ValidateForm,
    IdentifyFields,
    ExtractValues,
    ValidateCrossFields,
    ScoreConfidence,
    Done,
    Failed,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Start => "start",
            Step::ValidateForm => "validate_form",
            Step::IdentifyFields => "identify_fields",
            Step::ExtractValues => "extract_values",
            Step::ValidateCrossFields => "validate_cross_fields",
            Step::ScoreConfidence => "score_confidence",
            Step::Done => "done",
            Step::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Done | Step::Failed)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rationale in the audit trail
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ReasoningEntry {
    pub step: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown form type or unusable catalog
    Configuration,
    /// Timeout or rate limit that outlived the retry budget
    Transient,
    /// Auth failure or malformed request
    Permanent,
    /// Reasoning output that could not be read
    Parse,
    /// A single field could not be extracted or has the wrong shape
    Field,
    /// Warning-class consistency violation between fields
    CrossField,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Parse => "parse",
            ErrorKind::Field => "field",
            ErrorKind::CrossField => "cross_field",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ErrorEntry {
    pub kind: ErrorKind,
    pub step: Step,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    pub message: String,
}

impl ErrorEntry {
    pub fn new(kind: ErrorKind, step: Step, message: impl Into<String>) -> Self {
        Self {
            kind,
            step,
            fields: vec![],
            message: message.into(),
        }
    }

    pub fn field(step: Step, field: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Field,
            step,
            fields: vec![field.to_string()],
            message: message.into(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn names(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind.as_str(), self.step, self.message)?;
        if !self.fields.is_empty() {
            write!(f, " ({})", self.fields.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("Field '{field}' is not declared for form type {form_type}")]
    UnknownField { form_type: String, field: String },

    #[error("Field '{0}' already has a value; use an explicit correction")]
    Overwrite(String),

    #[error("Confidence for '{0}' requires an extracted value")]
    NotExtracted(String),

    #[error("State is frozen at '{0}'")]
    Frozen(Step),
}

/// The single record passed through the pipeline
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WorkflowState {
    run_id: Uuid,
    ocr_text: String,
    form_type: String,
    extracted_fields: BTreeMap<String, FieldValue>,
    reasoning_log: Vec<ReasoningEntry>,
    confidence_scores: BTreeMap<String, f64>,
    current_step: Step,
    errors: Vec<ErrorEntry>,
    #[serde(default)]
    skipped_fields: BTreeSet<String>,
    #[serde(default)]
    ambiguous_fields: BTreeSet<String>,
    #[serde(default)]
    disputed_fields: BTreeMap<String, u32>,
    #[serde(default)]
    cancelled: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn new(ocr_text: impl Into<String>, form_type: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            ocr_text: ocr_text.into(),
            form_type: form_type.into(),
            extracted_fields: BTreeMap::new(),
            reasoning_log: Vec::new(),
            confidence_scores: BTreeMap::new(),
            current_step: Step::Start,
            errors: Vec::new(),
            skipped_fields: BTreeSet::new(),
            ambiguous_fields: BTreeSet::new(),
            disputed_fields: BTreeMap::new(),
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn ocr_text(&self) -> &str {
        &self.ocr_text
    }

    pub fn form_type(&self) -> &str {
        &self.form_type
    }

    pub fn extracted_fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.extracted_fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.extracted_fields.get(name)
    }

    pub fn reasoning_log(&self) -> &[ReasoningEntry] {
        &self.reasoning_log
    }

    pub fn confidence_scores(&self) -> &BTreeMap<String, f64> {
        &self.confidence_scores
    }

    pub fn confidence(&self, name: &str) -> Option<f64> {
        self.confidence_scores.get(name).copied()
    }

    pub fn current_step(&self) -> Step {
        self.current_step
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    pub fn skipped_fields(&self) -> &BTreeSet<String> {
        &self.skipped_fields
    }

    pub fn ambiguous_fields(&self) -> &BTreeSet<String> {
        &self.ambiguous_fields
    }

    pub fn disputed_fields(&self) -> &BTreeMap<String, u32> {
        &self.disputed_fields
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Terminal states are frozen
    pub fn is_frozen(&self) -> bool {
        self.current_step.is_terminal()
    }

    /// A result was produced but something went wrong along the way
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Field-level errors recorded against `name`
    pub fn field_errors(&self, name: &str) -> usize {
        self.errors
            .iter()
            .filter(|e| e.kind == ErrorKind::Field && e.names(name))
            .count()
    }

    fn ensure_mutable(&self) -> Result<(), StateError> {
        if self.is_frozen() {
            Err(StateError::Frozen(self.current_step))
        } else {
            Ok(())
        }
    }

    fn ensure_declared(&self, form: &FormCatalog, name: &str) -> Result<(), StateError> {
        if form.declares(name) {
            Ok(())
        } else {
            Err(StateError::UnknownField {
                form_type: form.form_type.clone(),
                field: name.to_string(),
            })
        }
    }

    /// Mark a node as running
    pub fn begin(&mut self, step: Step) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.current_step = step;
        Ok(())
    }

    pub fn log(&mut self, step: Step, reasoning: impl Into<String>) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.reasoning_log.push(ReasoningEntry {
            step: step.as_str().to_string(),
            reasoning: reasoning.into(),
        });
        Ok(())
    }

    pub fn push_error(&mut self, error: ErrorEntry) -> Result<(), StateError> {
        self.ensure_mutable()?;
        log::warn!("[{}] {}", self.run_id, error);
        self.errors.push(error);
        Ok(())
    }

    /// Record a value for a field that has none yet
    pub fn set_field(
        &mut self,
        form: &FormCatalog,
        name: &str,
        value: FieldValue,
    ) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.ensure_declared(form, name)?;
        if self.extracted_fields.contains_key(name) {
            return Err(StateError::Overwrite(name.to_string()));
        }
        self.extracted_fields.insert(name.to_string(), value);
        Ok(())
    }

    /// Replace a field value, leaving a `correction` entry in the reasoning log
    pub fn correct_field(
        &mut self,
        form: &FormCatalog,
        name: &str,
        value: FieldValue,
        reason: &str,
    ) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.ensure_declared(form, name)?;
        let previous = self
            .extracted_fields
            .insert(name.to_string(), value.clone())
            .unwrap_or(FieldValue::Null);
        self.reasoning_log.push(ReasoningEntry {
            step: "correction".to_string(),
            reasoning: format!("{}: {} -> {} ({})", name, previous, value, reason),
        });
        Ok(())
    }

    pub fn set_confidence(&mut self, name: &str, score: f64) -> Result<(), StateError> {
        self.ensure_mutable()?;
        if !self.extracted_fields.contains_key(name) {
            return Err(StateError::NotExtracted(name.to_string()));
        }
        self.confidence_scores
            .insert(name.to_string(), score.clamp(0.0, 1.0));
        Ok(())
    }

    pub fn mark_skipped(&mut self, name: &str) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.skipped_fields.insert(name.to_string());
        Ok(())
    }

    pub fn mark_ambiguous(&mut self, name: &str) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.ambiguous_fields.insert(name.to_string());
        Ok(())
    }

    /// Count one violated cross-field rule against a field
    pub fn flag_disputed(&mut self, name: &str) -> Result<(), StateError> {
        self.ensure_mutable()?;
        *self.disputed_fields.entry(name.to_string()).or_insert(0) += 1;
        Ok(())
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub(crate) fn clear_cancelled(&mut self) {
        self.cancelled = false;
    }

    /// Enter a terminal step; the state is frozen afterwards
    pub fn finish(&mut self, step: Step) -> Result<(), StateError> {
        self.ensure_mutable()?;
        debug_assert!(step.is_terminal());
        self.current_step = step;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}
