// SPDX-License-Identifier: MIT

//! Extraction workflow - five nodes over a [`WorkflowState`]
//!
//! ```text
//! validate_form -> identify_fields -> extract_values -> validate_cross_fields
//!               -> score_confidence -> done
//! ```
//! Any node may route to `failed`. Each call to [`ExtractionWorkflow::step`]
//! appends exactly one reasoning entry, whatever the outcome.

use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::adk::error::{ClaimflowError, ModelError};
use crate::adk::model::{GenerationConfig, Model};

use super::catalog::{parse_date, CrossFieldRule, FieldCatalog, FieldDef, FormCatalog, Relation};
use super::parse::{parse_response, ExtractResponse, IdentifyResponse, ParsedField};
use super::prompt;
use super::retry::{generate_with_retry, RetryPolicy};
use super::scoring::{score, FieldSignals};
use super::state::{ErrorEntry, ErrorKind, FieldValue, StateError, Step, WorkflowState};

/// Tunables for one workflow instance
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOptions {
    pub generation: GenerationConfig,
    pub retry: RetryPolicy,
    /// Fields per extraction call
    pub batch_size: usize,
    /// Extraction calls in flight at once
    pub concurrency: usize,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            generation: GenerationConfig {
                temperature: Some(0.1),
                max_output_tokens: Some(4096),
                top_p: None,
            },
            retry: RetryPolicy::default(),
            batch_size: 6,
            concurrency: 4,
        }
    }
}

/// The five working states of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    ValidateForm,
    IdentifyFields,
    ExtractValues,
    ValidateCrossFields,
    ScoreConfidence,
}

impl Node {
    pub fn step(&self) -> Step {
        match self {
            Node::ValidateForm => Step::ValidateForm,
            Node::IdentifyFields => Step::IdentifyFields,
            Node::ExtractValues => Step::ExtractValues,
            Node::ValidateCrossFields => Step::ValidateCrossFields,
            Node::ScoreConfidence => Step::ScoreConfidence,
        }
    }

    /// Node that runs once `step` has completed, if any
    pub fn after(step: Step) -> Option<Node> {
        match step {
            Step::Start => Some(Node::ValidateForm),
            Step::ValidateForm => Some(Node::IdentifyFields),
            Step::IdentifyFields => Some(Node::ExtractValues),
            Step::ExtractValues => Some(Node::ValidateCrossFields),
            Step::ValidateCrossFields => Some(Node::ScoreConfidence),
            Step::ScoreConfidence | Step::Done | Step::Failed => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.step().as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Next(Node),
    Done,
    Failed,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Next(node) => write!(f, "{}", node),
            Transition::Done => f.write_str("done"),
            Transition::Failed => f.write_str("failed"),
        }
    }
}

/// What a node hands back to [`ExtractionWorkflow::step`]
struct NodeOutcome {
    transition: Transition,
    reasoning: String,
}

impl NodeOutcome {
    fn next(node: Node, reasoning: impl Into<String>) -> Self {
        Self {
            transition: Transition::Next(node),
            reasoning: reasoning.into(),
        }
    }

    fn done(reasoning: impl Into<String>) -> Self {
        Self {
            transition: Transition::Done,
            reasoning: reasoning.into(),
        }
    }

    fn failed(reasoning: impl Into<String>) -> Self {
        Self {
            transition: Transition::Failed,
            reasoning: reasoning.into(),
        }
    }
}

/// Result of one extraction call covering a batch of fields
struct BatchOutcome {
    requested: Vec<String>,
    attempts: u32,
    result: Result<Vec<(String, Result<ParsedField, String>)>, ModelError>,
    unrequested: Vec<String>,
    thinking: Option<String>,
}

fn model_error_kind(err: &ModelError) -> ErrorKind {
    if err.is_transient() {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}

fn with_thinking(reasoning: String, thinking: Option<String>) -> String {
    match thinking {
        Some(t) => format!("{}\nModel reasoning: {}", reasoning, t.trim()),
        None => reasoning,
    }
}

pub struct ExtractionWorkflow {
    model: Arc<dyn Model>,
    catalog: Arc<FieldCatalog>,
    options: WorkflowOptions,
}

impl ExtractionWorkflow {
    pub fn new(model: Arc<dyn Model>, catalog: Arc<FieldCatalog>, options: WorkflowOptions) -> Self {
        Self {
            model,
            catalog,
            options,
        }
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    /// Run the pipeline over one transcript until it reaches `done` or `failed`
    ///
    /// Only a structurally invalid call (empty text or form type) is an
    /// `Err`; every other failure is recorded in the returned state.
    pub async fn run(&self, ocr_text: &str, form_type: &str) -> Result<WorkflowState, ClaimflowError> {
        super::runner::start(self, ocr_text, form_type, CancellationToken::new()).await
    }

    /// Run one node and append its reasoning entry
    pub async fn step(&self, node: Node, state: &mut WorkflowState) -> Transition {
        if let Err(e) = state.begin(node.step()) {
            log::error!("[{}] cannot run {}: {}", state.run_id(), node, e);
            return Transition::Failed;
        }
        log::info!("[{}] running {}", state.run_id(), node);

        let result = match node {
            Node::ValidateForm => self.validate_form(state),
            Node::IdentifyFields => self.identify_fields(state).await,
            Node::ExtractValues => self.extract_values(state).await,
            Node::ValidateCrossFields => self.validate_cross_fields(state),
            Node::ScoreConfidence => self.score_confidence(state),
        };

        let outcome = result.unwrap_or_else(|e| {
            log::error!("[{}] {} violated a state invariant: {}", state.run_id(), node, e);
            let _ = state.push_error(ErrorEntry::new(
                ErrorKind::Permanent,
                node.step(),
                format!("state invariant violated: {}", e),
            ));
            NodeOutcome::failed(format!("Aborted: {}", e))
        });

        if let Err(e) = state.log(node.step(), outcome.reasoning) {
            log::error!("[{}] could not log {}: {}", state.run_id(), node, e);
        }
        log::info!("[{}] {} -> {}", state.run_id(), node, outcome.transition);
        outcome.transition
    }

    fn form_for(&self, state: &mut WorkflowState, step: Step) -> Result<Option<&FormCatalog>, StateError> {
        match self.catalog.form(state.form_type()) {
            Ok(form) => Ok(Some(form)),
            Err(e) => {
                state.push_error(ErrorEntry::new(ErrorKind::Configuration, step, e.to_string()))?;
                Ok(None)
            }
        }
    }

    fn validate_form(&self, state: &mut WorkflowState) -> Result<NodeOutcome, StateError> {
        let Some(form) = self.form_for(state, Step::ValidateForm)? else {
            return Ok(NodeOutcome::failed(format!(
                "Form type '{}' is not in the catalog; known types: {}",
                state.form_type(),
                self.catalog.form_types().collect::<Vec<_>>().join(", ")
            )));
        };

        let required = form.fields.iter().filter(|f| f.required).count();
        Ok(NodeOutcome::next(
            Node::IdentifyFields,
            format!(
                "Form type {} recognised: {} fields ({} required), {} cross-field rules",
                form.form_type,
                form.fields.len(),
                required,
                form.rules.len()
            ),
        ))
    }

    async fn identify_fields(&self, state: &mut WorkflowState) -> Result<NodeOutcome, StateError> {
        let Some(form) = self.form_for(state, Step::IdentifyFields)? else {
            return Ok(NodeOutcome::failed("Catalog entry disappeared"));
        };

        let history = prompt::identify_fields(form, state.ocr_text());
        let call = generate_with_retry(
            self.model.as_ref(),
            &history,
            &self.options.generation,
            &self.options.retry,
        )
        .await;

        let content = match call.result {
            Ok(content) => content,
            Err(e) => {
                let message = format!(
                    "reasoning call failed after {} attempt(s): {}",
                    call.attempts, e
                );
                state.push_error(ErrorEntry::new(
                    model_error_kind(&e),
                    Step::IdentifyFields,
                    message.clone(),
                ))?;
                return Ok(NodeOutcome::failed(format!(
                    "Could not identify fields: {}",
                    message
                )));
            }
        };

        let response = match parse_response::<IdentifyResponse>(&content.text()) {
            Ok(response) => response,
            Err(e) => {
                state.push_error(ErrorEntry::new(
                    ErrorKind::Parse,
                    Step::IdentifyFields,
                    format!("{}; every field will be queried", e),
                ))?;
                return Ok(NodeOutcome::next(
                    Node::ExtractValues,
                    with_thinking(
                        format!(
                            "Identification output was unreadable ({}); treating all {} fields as present",
                            e,
                            form.fields.len()
                        ),
                        content.thinking(),
                    ),
                ));
            }
        };

        let present: BTreeSet<&str> = response.present.iter().map(|s| s.as_str()).collect();
        for name in response.present.iter().chain(response.absent.iter()) {
            if !form.declares(name) {
                log::warn!(
                    "[{}] reasoning engine named undeclared field '{}'",
                    state.run_id(),
                    name
                );
            }
        }

        let mut skipped = Vec::new();
        for def in &form.fields {
            let judged_absent = response.absent.iter().any(|n| n == &def.name);
            if judged_absent && !present.contains(def.name.as_str()) {
                state.mark_skipped(&def.name)?;
                skipped.push(def.name.as_str());
            }
        }

        let queried = form.fields.len() - skipped.len();
        let mut reasoning = format!(
            "{} of {} fields judged present",
            queried,
            form.fields.len()
        );
        if !skipped.is_empty() {
            reasoning.push_str(&format!("; skipping {}", skipped.join(", ")));
        }
        if !response.reasoning.trim().is_empty() {
            reasoning.push_str(&format!(". {}", response.reasoning.trim()));
        }

        Ok(NodeOutcome::next(
            Node::ExtractValues,
            with_thinking(reasoning, content.thinking()),
        ))
    }

    async fn extract_batch(
        &self,
        form: &FormCatalog,
        ocr_text: &str,
        batch: &[&FieldDef],
    ) -> BatchOutcome {
        let requested: Vec<String> = batch.iter().map(|f| f.name.clone()).collect();
        let history = prompt::extract_values(form, ocr_text, batch);
        let call = generate_with_retry(
            self.model.as_ref(),
            &history,
            &self.options.generation,
            &self.options.retry,
        )
        .await;

        let content = match call.result {
            Ok(content) => content,
            Err(e) => {
                return BatchOutcome {
                    requested,
                    attempts: call.attempts,
                    result: Err(e),
                    unrequested: vec![],
                    thinking: None,
                }
            }
        };

        let thinking = content.thinking();
        let (fields, unrequested) = match parse_response::<ExtractResponse>(&content.text()) {
            Ok(mut response) => {
                let fields = requested
                    .iter()
                    .map(|name| {
                        let parsed = match response.fields.remove(name) {
                            Some(report) => report.into_parsed().map_err(|e| e.to_string()),
                            None => Err("not returned by the reasoning engine".to_string()),
                        };
                        (name.clone(), parsed)
                    })
                    .collect();
                (fields, response.fields.into_keys().collect())
            }
            Err(e) => {
                let message = format!("unreadable reasoning output: {}", e);
                let fields = requested
                    .iter()
                    .map(|name| (name.clone(), Err(message.clone())))
                    .collect();
                (fields, vec![])
            }
        };

        BatchOutcome {
            requested,
            attempts: call.attempts,
            result: Ok(fields),
            unrequested,
            thinking,
        }
    }

    async fn extract_values(&self, state: &mut WorkflowState) -> Result<NodeOutcome, StateError> {
        let Some(form) = self.form_for(state, Step::ExtractValues)? else {
            return Ok(NodeOutcome::failed("Catalog entry disappeared"));
        };

        let targets: Vec<&FieldDef> = form
            .fields
            .iter()
            .filter(|f| !state.skipped_fields().contains(&f.name))
            .filter(|f| state.field(&f.name).is_none())
            .collect();

        if targets.is_empty() {
            return Ok(NodeOutcome::next(
                Node::ValidateCrossFields,
                "No fields left to extract",
            ));
        }

        let ocr_text = state.ocr_text().to_string();
        let batches: Vec<&[&FieldDef]> = targets.chunks(self.options.batch_size.max(1)).collect();
        let outcomes: Vec<BatchOutcome> = stream::iter(
            batches
                .iter()
                .map(|batch| self.extract_batch(form, &ocr_text, batch)),
        )
        .buffered(self.options.concurrency.max(1))
        .collect()
        .await;

        let mut extracted = 0usize;
        let mut failed = 0usize;
        let mut permanent_failure = false;
        let mut thoughts = Vec::new();

        for outcome in outcomes {
            let fields = match outcome.result {
                Ok(fields) => fields,
                Err(e) if e.is_transient() => {
                    for name in &outcome.requested {
                        state.push_error(ErrorEntry::field(
                            Step::ExtractValues,
                            name,
                            format!(
                                "reasoning call failed after {} attempt(s): {}",
                                outcome.attempts, e
                            ),
                        ))?;
                    }
                    failed += outcome.requested.len();
                    continue;
                }
                Err(e) => {
                    state.push_error(
                        ErrorEntry::new(
                            ErrorKind::Permanent,
                            Step::ExtractValues,
                            format!("reasoning call rejected: {}", e),
                        )
                        .with_fields(outcome.requested.clone()),
                    )?;
                    failed += outcome.requested.len();
                    permanent_failure = true;
                    continue;
                }
            };

            if !outcome.unrequested.is_empty() {
                log::warn!(
                    "[{}] ignoring unrequested fields: {}",
                    state.run_id(),
                    outcome.unrequested.join(", ")
                );
            }
            if let Some(t) = outcome.thinking {
                thoughts.push(t.trim().to_string());
            }

            for (name, parsed) in fields {
                let Some(def) = form.field(&name) else {
                    continue;
                };
                match parsed {
                    Ok(parsed) => {
                        if !def.kind.accepts(&parsed.value) {
                            state.push_error(ErrorEntry::field(
                                Step::ExtractValues,
                                &name,
                                format!(
                                    "value {} does not look like a {}",
                                    parsed.value,
                                    def.kind.as_str()
                                ),
                            ))?;
                        }
                        if parsed.ambiguous {
                            state.mark_ambiguous(&name)?;
                        }
                        if let Some(note) = &parsed.note {
                            log::debug!("[{}] {}: {}", state.run_id(), name, note);
                        }
                        state.set_field(form, &name, parsed.value)?;
                        extracted += 1;
                    }
                    Err(message) => {
                        state.push_error(ErrorEntry::field(Step::ExtractValues, &name, message))?;
                        failed += 1;
                    }
                }
            }
        }

        let mut reasoning = format!(
            "Queried {} fields in {} call(s): {} extracted, {} failed",
            targets.len(),
            batches.len(),
            extracted,
            failed
        );
        if !state.ambiguous_fields().is_empty() {
            reasoning.push_str(&format!(
                "; ambiguous: {}",
                state
                    .ambiguous_fields()
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        let thinking = if thoughts.is_empty() {
            None
        } else {
            Some(thoughts.join("\n"))
        };
        let reasoning = with_thinking(reasoning, thinking);

        if permanent_failure {
            Ok(NodeOutcome::failed(format!(
                "{}. A non-retryable reasoning error stopped the run",
                reasoning
            )))
        } else if extracted == 0 {
            Ok(NodeOutcome::failed(format!(
                "{}. No field could be extracted",
                reasoning
            )))
        } else {
            Ok(NodeOutcome::next(Node::ValidateCrossFields, reasoning))
        }
    }

    fn validate_cross_fields(&self, state: &mut WorkflowState) -> Result<NodeOutcome, StateError> {
        let Some(form) = self.form_for(state, Step::ValidateCrossFields)? else {
            return Ok(NodeOutcome::failed("Catalog entry disappeared"));
        };

        let mut violated = Vec::new();
        for rule in &form.rules {
            if let Some((fields, message)) = check_rule(rule, state) {
                for field in &fields {
                    state.flag_disputed(field)?;
                }
                state.push_error(
                    ErrorEntry::new(
                        ErrorKind::CrossField,
                        Step::ValidateCrossFields,
                        format!("{}: {}", rule.name, message),
                    )
                    .with_fields(fields),
                )?;
                violated.push(rule.name.as_str());
            }
        }

        let reasoning = if violated.is_empty() {
            format!("All {} cross-field rules hold", form.rules.len())
        } else {
            format!(
                "{} of {} cross-field rules violated: {}. Disputed values kept for scoring",
                violated.len(),
                form.rules.len(),
                violated.join(", ")
            )
        };
        Ok(NodeOutcome::next(Node::ScoreConfidence, reasoning))
    }

    fn score_confidence(&self, state: &mut WorkflowState) -> Result<NodeOutcome, StateError> {
        let Some(form) = self.form_for(state, Step::ScoreConfidence)? else {
            return Ok(NodeOutcome::failed("Catalog entry disappeared"));
        };

        let mut zeroed = Vec::new();
        for def in &form.fields {
            // Required and disputed fields are scored even when never extracted
            if state.field(&def.name).is_none() {
                if !def.required && !state.disputed_fields().contains_key(&def.name) {
                    continue;
                }
                state.set_field(form, &def.name, FieldValue::Null)?;
            }

            let has_value = state.field(&def.name).is_some_and(|v| !v.is_null());
            let signals = FieldSignals {
                has_value,
                ambiguous: state.ambiguous_fields().contains(&def.name),
                violations: state.disputed_fields().get(&def.name).copied().unwrap_or(0),
                field_errors: state.field_errors(&def.name),
                required: def.required,
            };
            let confidence = score(&signals);
            if confidence == 0.0 {
                zeroed.push(def.name.clone());
            }
            state.set_confidence(&def.name, confidence)?;
        }

        let scores = state.confidence_scores();
        let mean = if scores.is_empty() {
            0.0
        } else {
            scores.values().sum::<f64>() / scores.len() as f64
        };
        let mut reasoning = format!("Scored {} fields, mean confidence {:.2}", scores.len(), mean);
        if !zeroed.is_empty() {
            reasoning.push_str(&format!("; no confidence in {}", zeroed.join(", ")));
        }
        Ok(NodeOutcome::done(reasoning))
    }
}

/// Evaluate one rule, returning the implicated fields and a description on violation
fn check_rule(rule: &CrossFieldRule, state: &WorkflowState) -> Option<(Vec<String>, String)> {
    let has = |name: &str| state.field(name).is_some_and(|v| !v.is_null());

    match &rule.relation {
        Relation::Requires { field, requires } => {
            if !has(field.as_str()) {
                return None;
            }
            let missing: Vec<String> = requires.iter().filter(|r| !has(r.as_str())).cloned().collect();
            if missing.is_empty() {
                return None;
            }
            let message = format!("{} is present but {} is missing", field, missing.join(", "));
            let mut fields = vec![field.clone()];
            fields.extend(missing);
            Some((fields, message))
        }
        Relation::AllOrNone { fields } => {
            let (present, missing): (Vec<&String>, Vec<&String>) =
                fields.iter().partition(|f| has(f.as_str()));
            if present.is_empty() || missing.is_empty() {
                return None;
            }
            let message = format!(
                "{} present without {}",
                join(&present),
                join(&missing)
            );
            Some((fields.clone(), message))
        }
        Relation::AtLeastOne { fields } => {
            if fields.iter().any(|f| has(f.as_str())) {
                return None;
            }
            Some((
                fields.clone(),
                format!("none of {} has a value", join(&fields.iter().collect::<Vec<_>>())),
            ))
        }
        Relation::DateOrder { earlier, later } => {
            let date = |name: &str| {
                state
                    .field(name)
                    .and_then(|v| v.as_text())
                    .and_then(parse_date)
            };
            match (date(earlier.as_str()), date(later.as_str())) {
                (Some(a), Some(b)) if a > b => Some((
                    vec![earlier.clone(), later.clone()],
                    format!("{} ({}) is after {} ({})", earlier, a, later, b),
                )),
                _ => None,
            }
        }
    }
}

fn join(names: &[&String]) -> String {
    names
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
