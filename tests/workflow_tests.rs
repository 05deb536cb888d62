// SPDX-License-Identifier: MIT

//! End-to-end workflow tests driven by mock reasoning models
//!
//! The mocks route on the task marker and field list in each prompt, so the
//! same model serves identification and every extraction batch.

use async_trait::async_trait;
use claimflow_rs::adk::error::ModelError;
use claimflow_rs::adk::model::{Content, GenerationConfig, Model, Part};
use claimflow_rs::extraction::prompt::{listed_fields, EXTRACT_TASK, IDENTIFY_TASK};
use claimflow_rs::extraction::retry::RetryPolicy;
use claimflow_rs::extraction::{
    ErrorKind, ExtractionWorkflow, FieldCatalog, FieldValue, Step, WorkflowOptions,
    WorkflowRunner, WorkflowState, CMS_1500,
};
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock Components
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Task {
    Identify,
    Extract,
}

type Handler = Box<dyn Fn(Task, &[String]) -> Result<String, ModelError> + Send + Sync>;

/// Mock model answering through a closure
struct FormModel {
    handler: Handler,
    calls: AtomicU32,
    extract_batches: Mutex<Vec<Vec<String>>>,
    /// Fires the token and hangs on the first extraction call
    cancel_on_extract: Option<CancellationToken>,
    thinking: Option<String>,
}

impl FormModel {
    fn new<F>(handler: F) -> Self
    where
        F: Fn(Task, &[String]) -> Result<String, ModelError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: AtomicU32::new(0),
            extract_batches: Mutex::new(vec![]),
            cancel_on_extract: None,
            thinking: None,
        }
    }

    fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_extract = Some(token);
        self
    }

    fn with_thinking(mut self, thinking: &str) -> Self {
        self.thinking = Some(thinking.to_string());
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of extraction calls whose batch contained `field`
    fn extract_calls_for(&self, field: &str) -> usize {
        self.extract_batches
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.iter().any(|f| f == field))
            .count()
    }
}

#[async_trait]
impl Model for FormModel {
    fn name(&self) -> &str {
        "form-mock"
    }

    async fn generate_content(
        &self,
        history: &[Content],
        _config: &GenerationConfig,
    ) -> Result<Content, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = history.last().map(|c| c.text()).unwrap_or_default();
        let task = if prompt.starts_with(IDENTIFY_TASK) {
            Task::Identify
        } else if prompt.starts_with(EXTRACT_TASK) {
            Task::Extract
        } else {
            return Err(ModelError::InvalidRequest("unrecognised prompt".to_string()));
        };
        let fields = listed_fields(&prompt);

        if task == Task::Extract {
            self.extract_batches.lock().unwrap().push(fields.clone());
            if let Some(token) = &self.cancel_on_extract {
                token.cancel();
                return std::future::pending().await;
            }
        }

        let text = (self.handler)(task, &fields)?;
        let mut parts = vec![Part::Text(text)];
        if let Some(thinking) = &self.thinking {
            parts.push(Part::Thinking(thinking.clone()));
        }
        Ok(Content {
            role: "model".to_string(),
            parts,
        })
    }
}

/// Values printed on a complete, consistent CMS-1500 form
static CLEAN_FORM: Lazy<BTreeMap<&'static str, Value>> = Lazy::new(|| {
    BTreeMap::from([
        ("patient_name", json!("DOE, JANE")),
        ("patient_dob", json!("01/15/1980")),
        ("patient_sex", json!("F")),
        ("patient_address", json!("123 MAIN ST, SPRINGFIELD IL")),
        ("insured_id", json!("XYZ123456789")),
        ("insured_name", json!("DOE, JANE")),
        ("policy_number", json!("POL-88")),
        ("group_number", json!("G-1001")),
        ("diagnosis_code", json!("E11.9")),
        ("diagnosis_code_2", json!("I10")),
        ("procedure_code", json!("99213")),
        ("service_date_from", json!("03/01/2024")),
        ("service_date_to", json!("03/01/2024")),
        ("charges", json!("125.00")),
        ("total_charge", json!("125.00")),
        ("rendering_provider_npi", json!("1234567893")),
        ("billing_provider_npi", json!("1234567893")),
        ("federal_tax_id", json!("12-3456789")),
    ])
});

const OCR_TEXT: &str = "HEALTH INSURANCE CLAIM FORM\n\
    2. PATIENT'S NAME DOE, JANE  3. BIRTH DATE 01 15 1980 F\n\
    1a. INSURED'S ID XYZ123456789\n\
    11. POLICY POL-88 GROUP G-1001\n\
    21. A. E11.9 B. I10\n\
    24. 03 01 2024 99213 125.00\n\
    28. TOTAL CHARGE 125.00  33a. 1234567893  25. 12-3456789";

fn identify_response(values: &BTreeMap<&str, Value>) -> String {
    let catalog = FieldCatalog::builtin();
    let form = catalog.form(CMS_1500).unwrap();
    let (present, absent): (Vec<&str>, Vec<&str>) = form
        .fields
        .iter()
        .map(|f| f.name.as_str())
        .partition(|n| values.contains_key(*n));
    json!({
        "present": present,
        "absent": absent,
        "reasoning": "Boxes matched against the transcript"
    })
    .to_string()
}

fn extract_body(values: &BTreeMap<&str, Value>, fields: &[String], omit: &[&str]) -> Value {
    let mut out = Map::new();
    for name in fields.iter().filter(|n| !omit.contains(&n.as_str())) {
        let value = values.get(name.as_str()).cloned().unwrap_or(Value::Null);
        out.insert(name.clone(), json!({ "value": value }));
    }
    json!({ "fields": out, "reasoning": "Read from the form boxes" })
}

fn extract_response(values: &BTreeMap<&str, Value>, fields: &[String]) -> String {
    // Wrapped in chatter and a code fence, as real completions often are
    format!(
        "Here is the extraction:\n```json\n{}\n```",
        extract_body(values, fields, &[])
    )
}

/// Model that reads `values` off the form
fn form_model(values: BTreeMap<&'static str, Value>) -> FormModel {
    FormModel::new(move |task, fields| {
        Ok(match task {
            Task::Identify => identify_response(&values),
            Task::Extract => extract_response(&values, fields),
        })
    })
}

fn options() -> WorkflowOptions {
    WorkflowOptions {
        retry: RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        },
        ..WorkflowOptions::default()
    }
}

fn runner(model: Arc<FormModel>) -> WorkflowRunner {
    WorkflowRunner::new(model, Arc::new(FieldCatalog::builtin()), options())
}

fn steps(state: &WorkflowState) -> Vec<&str> {
    state
        .reasoning_log()
        .iter()
        .map(|e| e.step.as_str())
        .collect()
}

fn assert_confidence_within_extracted(state: &WorkflowState) {
    for key in state.confidence_scores().keys() {
        assert!(
            state.extracted_fields().contains_key(key),
            "confidence for {} without an extracted value",
            key
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_clean_form_reaches_done() {
    let model = Arc::new(form_model(CLEAN_FORM.clone()));
    let state = runner(model.clone()).run(OCR_TEXT, CMS_1500).await.unwrap();

    assert_eq!(state.current_step(), Step::Done);
    assert!(state.errors().is_empty(), "errors: {:?}", state.errors());
    assert!(!state.is_degraded());
    assert!(!state.cancelled());
    assert!(state.finished_at().is_some());

    assert_eq!(state.field("patient_name"), Some(&FieldValue::Text("DOE, JANE".into())));
    assert_eq!(state.extracted_fields().len(), CLEAN_FORM.len());
    assert!(state.skipped_fields().contains("prior_authorization"));
    assert!(state.field("prior_authorization").is_none());

    assert_eq!(state.confidence_scores().len(), CLEAN_FORM.len());
    for score in state.confidence_scores().values() {
        assert_eq!(*score, 0.95);
    }
    assert_confidence_within_extracted(&state);

    // one identify call plus ceil(18 / 6) extraction batches
    assert_eq!(model.calls(), 4);
}

#[tokio::test]
async fn test_reasoning_log_follows_node_order() {
    let model = Arc::new(form_model(CLEAN_FORM.clone()).with_thinking("Box 21 is legible"));
    let state = runner(model).run(OCR_TEXT, CMS_1500).await.unwrap();

    assert_eq!(
        steps(&state),
        vec![
            "validate_form",
            "identify_fields",
            "extract_values",
            "validate_cross_fields",
            "score_confidence",
        ]
    );
    assert!(state.reasoning_log()[1].reasoning.contains("Box 21 is legible"));
    assert!(state.reasoning_log().iter().all(|e| !e.reasoning.is_empty()));
}

#[tokio::test]
async fn test_repeated_runs_are_identical() {
    let r = runner(Arc::new(form_model(CLEAN_FORM.clone())));
    let first = r.run(OCR_TEXT, CMS_1500).await.unwrap();
    let second = r.run(OCR_TEXT, CMS_1500).await.unwrap();

    assert_ne!(first.run_id(), second.run_id());
    assert_eq!(first.extracted_fields(), second.extracted_fields());
    assert_eq!(first.confidence_scores(), second.confidence_scores());
    assert_eq!(first.current_step(), second.current_step());
}

#[tokio::test]
async fn test_unknown_form_type_fails_fast() {
    let model = Arc::new(form_model(CLEAN_FORM.clone()));
    let state = runner(model.clone()).run(OCR_TEXT, "XYZ-9999").await.unwrap();

    assert_eq!(state.current_step(), Step::Failed);
    assert!(state.extracted_fields().is_empty());
    assert!(state.confidence_scores().is_empty());
    assert_eq!(state.errors().len(), 1);
    assert_eq!(state.errors()[0].kind, ErrorKind::Configuration);
    assert!(state.errors()[0].message.contains("XYZ-9999"));
    assert_eq!(steps(&state), vec!["validate_form"]);
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_partial_failure_keeps_other_fields() {
    // The model never reports a value for diagnosis_code
    let values = CLEAN_FORM.clone();
    let model = Arc::new(FormModel::new(move |task, fields| {
        Ok(match task {
            Task::Identify => identify_response(&values),
            Task::Extract => extract_body(&values, fields, &["diagnosis_code"]).to_string(),
        })
    }));
    let state = runner(model).run(OCR_TEXT, CMS_1500).await.unwrap();

    assert_eq!(state.current_step(), Step::Done);
    assert!(state.is_degraded());
    assert_eq!(state.confidence("patient_name"), Some(0.95));

    assert_eq!(state.field("diagnosis_code"), Some(&FieldValue::Null));
    assert_eq!(state.confidence("diagnosis_code"), Some(0.0));
    assert_eq!(state.field_errors("diagnosis_code"), 1);
    assert!(state
        .errors()
        .iter()
        .any(|e| e.kind == ErrorKind::Field && e.names("diagnosis_code")));
    assert_confidence_within_extracted(&state);
}

#[tokio::test]
async fn test_policy_without_group_is_disputed() {
    let mut values = CLEAN_FORM.clone();
    values.insert("group_number", Value::Null);
    let state = runner(Arc::new(form_model(values)))
        .run(OCR_TEXT, CMS_1500)
        .await
        .unwrap();

    assert_eq!(state.current_step(), Step::Done);
    let violation = state
        .errors()
        .iter()
        .find(|e| e.kind == ErrorKind::CrossField)
        .expect("cross-field violation recorded");
    assert!(violation.names("policy_number"));
    assert!(violation.names("group_number"));

    // Disputed values are kept but trusted less
    assert_eq!(state.field("policy_number"), Some(&FieldValue::Text("POL-88".into())));
    assert_eq!(state.field("group_number"), Some(&FieldValue::Null));
    let policy = state.confidence("policy_number").unwrap();
    let group = state.confidence("group_number").unwrap();
    assert!(policy < 0.95);
    assert!(group < 0.85);
    assert!(policy < state.confidence("patient_name").unwrap());
}

#[tokio::test]
async fn test_ambiguous_value_scores_lower() {
    let values = CLEAN_FORM.clone();
    let model = Arc::new(FormModel::new(move |task, fields| {
        Ok(match task {
            Task::Identify => identify_response(&values),
            Task::Extract => {
                let mut out = Map::new();
                for name in fields {
                    let value = values.get(name.as_str()).cloned().unwrap_or(Value::Null);
                    let ambiguous = name == "patient_dob";
                    out.insert(name.clone(), json!({ "value": value, "ambiguous": ambiguous }));
                }
                json!({ "fields": out }).to_string()
            }
        })
    }));
    let state = runner(model).run(OCR_TEXT, CMS_1500).await.unwrap();

    assert!(state.ambiguous_fields().contains("patient_dob"));
    assert!(state.confidence("patient_dob").unwrap() < state.confidence("patient_name").unwrap());
}

#[tokio::test]
async fn test_wrong_shape_recorded_but_kept() {
    let mut values = CLEAN_FORM.clone();
    values.insert("patient_dob", json!("sometime in winter"));
    let state = runner(Arc::new(form_model(values)))
        .run(OCR_TEXT, CMS_1500)
        .await
        .unwrap();

    assert_eq!(state.current_step(), Step::Done);
    assert_eq!(
        state.field("patient_dob"),
        Some(&FieldValue::Text("sometime in winter".into()))
    );
    assert_eq!(state.field_errors("patient_dob"), 1);
    assert!(state.confidence("patient_dob").unwrap() < 0.95);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_records_one_error_per_field() {
    // Any batch containing diagnosis_code always times out
    let values = CLEAN_FORM.clone();
    let model = Arc::new(FormModel::new(move |task, fields| match task {
        Task::Identify => Ok(identify_response(&values)),
        Task::Extract if fields.iter().any(|f| f == "diagnosis_code") => {
            Err(ModelError::Timeout(Duration::from_secs(30)))
        }
        Task::Extract => Ok(extract_response(&values, fields)),
    }));
    let state = runner(model.clone()).run(OCR_TEXT, CMS_1500).await.unwrap();

    let max_attempts = options().retry.max_attempts() as usize;
    assert_eq!(model.extract_calls_for("diagnosis_code"), max_attempts);

    let failed_batch: Vec<String> = model
        .extract_batches
        .lock()
        .unwrap()
        .iter()
        .find(|b| b.iter().any(|f| f == "diagnosis_code"))
        .cloned()
        .unwrap();
    for name in &failed_batch {
        assert_eq!(state.field_errors(name), 1, "errors for {}", name);
        let error = state.errors().iter().find(|e| e.names(name)).unwrap();
        assert!(error.message.contains(&format!("{} attempt(s)", max_attempts)));
    }
    assert_eq!(
        state.errors().iter().filter(|e| e.kind == ErrorKind::Field).count(),
        failed_batch.len()
    );

    // Other batches still produced values
    assert_eq!(state.current_step(), Step::Done);
    assert_eq!(state.confidence("patient_name"), Some(0.95));
    assert_eq!(state.confidence("diagnosis_code"), Some(0.0));
    assert_confidence_within_extracted(&state);
}

#[tokio::test(start_paused = true)]
async fn test_every_batch_exhausted_fails() {
    let values = CLEAN_FORM.clone();
    let model = Arc::new(FormModel::new(move |task, _fields| match task {
        Task::Identify => Ok(identify_response(&values)),
        Task::Extract => Err(ModelError::Timeout(Duration::from_secs(30))),
    }));
    let state = runner(model).run(OCR_TEXT, CMS_1500).await.unwrap();

    assert_eq!(state.current_step(), Step::Failed);
    assert!(state.extracted_fields().is_empty());
    assert!(state.confidence_scores().is_empty());
    for name in CLEAN_FORM.keys() {
        assert_eq!(state.field_errors(name), 1);
    }
    assert_eq!(steps(&state).last(), Some(&"extract_values"));
}

#[tokio::test]
async fn test_workflow_run_entry_point() {
    let workflow = ExtractionWorkflow::new(
        Arc::new(form_model(CLEAN_FORM.clone())),
        Arc::new(FieldCatalog::builtin()),
        options(),
    );
    let state = workflow.run(OCR_TEXT, CMS_1500).await.unwrap();
    assert_eq!(state.current_step(), Step::Done);
    assert!(workflow.run("", CMS_1500).await.is_err());
}

#[tokio::test]
async fn test_skipped_group_number_still_disputed_and_scored() {
    // Identification drops group_number, so it is only implicitly null
    let model = Arc::new(FormModel::new(|task, fields| {
        Ok(match task {
            Task::Identify => json!({
                "present": ["patient_name", "policy_number", "diagnosis_code"],
                "absent": ["group_number"],
            })
            .to_string(),
            Task::Extract => {
                let values = BTreeMap::from([
                    ("patient_name", json!("DOE, JANE")),
                    ("policy_number", json!("123")),
                    ("diagnosis_code", json!("E11.9")),
                ]);
                extract_response(&values, fields)
            }
        })
    }));
    let state = runner(model.clone()).run(OCR_TEXT, CMS_1500).await.unwrap();

    assert_eq!(state.current_step(), Step::Done);
    assert_eq!(model.extract_calls_for("group_number"), 0);
    assert!(state
        .errors()
        .iter()
        .any(|e| e.kind == ErrorKind::CrossField && e.names("group_number")));
    assert_eq!(state.disputed_fields().get("group_number"), Some(&1));

    assert_eq!(state.field("group_number"), Some(&FieldValue::Null));
    let group = state.confidence("group_number").expect("group_number scored");
    assert!(group < 0.85);
    assert_confidence_within_extracted(&state);
}

#[tokio::test]
async fn test_auth_failure_during_extraction_fails_once() {
    let values = CLEAN_FORM.clone();
    let model = Arc::new(FormModel::new(move |task, fields| match task {
        Task::Identify => Ok(identify_response(&values)),
        Task::Extract if fields.iter().any(|f| f == "diagnosis_code") => {
            Err(ModelError::Auth("key revoked".to_string()))
        }
        Task::Extract => Ok(extract_response(&values, fields)),
    }));
    let state = runner(model.clone()).run(OCR_TEXT, CMS_1500).await.unwrap();

    assert_eq!(state.current_step(), Step::Failed);
    assert_eq!(model.extract_calls_for("diagnosis_code"), 1);

    let rejected: Vec<String> = model
        .extract_batches
        .lock()
        .unwrap()
        .iter()
        .find(|b| b.iter().any(|f| f == "diagnosis_code"))
        .cloned()
        .unwrap();
    let permanent: Vec<_> = state
        .errors()
        .iter()
        .filter(|e| e.kind == ErrorKind::Permanent)
        .collect();
    assert_eq!(permanent.len(), 1);
    assert_eq!(permanent[0].step, Step::ExtractValues);
    assert_eq!(permanent[0].fields, rejected);
    for name in &rejected {
        assert_eq!(state.field_errors(name), 0, "field error for {}", name);
        assert!(state.field(name).is_none());
    }
    assert!(state.confidence_scores().is_empty());
}

#[tokio::test]
async fn test_auth_failure_not_retried() {
    let model = Arc::new(FormModel::new(|_, _| {
        Err(ModelError::Auth("invalid api key".to_string()))
    }));
    let state = runner(model.clone()).run(OCR_TEXT, CMS_1500).await.unwrap();

    assert_eq!(state.current_step(), Step::Failed);
    assert_eq!(model.calls(), 1);
    assert_eq!(state.errors().len(), 1);
    assert_eq!(state.errors()[0].kind, ErrorKind::Permanent);
    assert_eq!(state.errors()[0].step, Step::IdentifyFields);
}

#[tokio::test]
async fn test_unreadable_identification_queries_every_field() {
    let values = CLEAN_FORM.clone();
    let model = Arc::new(FormModel::new(move |task, fields| {
        Ok(match task {
            Task::Identify => "Most boxes look filled in.".to_string(),
            Task::Extract => extract_response(&values, fields),
        })
    }));
    let state = runner(model.clone()).run(OCR_TEXT, CMS_1500).await.unwrap();

    assert_eq!(state.current_step(), Step::Done);
    assert!(state.errors().iter().any(|e| e.kind == ErrorKind::Parse));
    assert!(state.skipped_fields().is_empty());
    // prior_authorization was queried and came back null
    assert_eq!(state.field("prior_authorization"), Some(&FieldValue::Null));
    assert_eq!(model.extract_calls_for("prior_authorization"), 1);
}

#[tokio::test]
async fn test_cancel_then_resume() {
    let cancel = CancellationToken::new();
    let hanging = Arc::new(form_model(CLEAN_FORM.clone()).cancelling(cancel.clone()));
    let paused = runner(hanging)
        .run_with_cancel(OCR_TEXT, CMS_1500, cancel)
        .await
        .unwrap();

    assert!(paused.cancelled());
    assert!(!paused.is_frozen());
    assert_eq!(paused.current_step(), Step::IdentifyFields);
    assert!(paused.extracted_fields().is_empty());
    assert_eq!(steps(&paused), vec!["validate_form", "identify_fields"]);

    let model = Arc::new(form_model(CLEAN_FORM.clone()));
    let done = runner(model.clone())
        .resume(paused.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(done.run_id(), paused.run_id());
    assert_eq!(done.current_step(), Step::Done);
    assert!(!done.cancelled());
    assert_eq!(&done.reasoning_log()[..2], paused.reasoning_log());
    assert_eq!(done.reasoning_log().len(), 5);
    assert_eq!(done.extracted_fields().len(), CLEAN_FORM.len());
    // Identification is not repeated on resume
    assert_eq!(model.calls(), 3);
}

#[tokio::test]
async fn test_finished_state_is_frozen() {
    let state = runner(Arc::new(form_model(CLEAN_FORM.clone())))
        .run(OCR_TEXT, CMS_1500)
        .await
        .unwrap();
    let mut copy = state.clone();
    let catalog = FieldCatalog::builtin();
    let form = catalog.form(CMS_1500).unwrap();

    assert!(copy
        .correct_field(form, "patient_name", FieldValue::Null, "late edit")
        .is_err());
    assert!(copy.log(Step::Done, "late").is_err());
    assert_eq!(copy, state);
}

#[tokio::test]
async fn test_state_serializes_for_callers() {
    let state = runner(Arc::new(form_model(CLEAN_FORM.clone())))
        .run(OCR_TEXT, CMS_1500)
        .await
        .unwrap();
    let json = serde_json::to_value(&state).unwrap();

    assert_eq!(json["current_step"], "done");
    assert_eq!(json["form_type"], CMS_1500);
    assert_eq!(json["extracted_fields"]["diagnosis_code"], "E11.9");
    assert_eq!(json["confidence_scores"]["patient_name"], 0.95);
    assert_eq!(json["reasoning_log"][0]["step"], "validate_form");

    let back: WorkflowState = serde_json::from_value(json).unwrap();
    assert_eq!(back, state);
}
