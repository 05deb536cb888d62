// SPDX-License-Identifier: MIT

//! Drives an [`ExtractionWorkflow`] from `start` to a terminal step
//!
//! Every node runs against a working copy of the state. The copy only
//! replaces the committed state once the node returns, so a cancelled run
//! hands back the snapshot taken after the last completed node.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::adk::error::ClaimflowError;
use crate::adk::model::Model;

use super::catalog::FieldCatalog;
use super::state::{Step, WorkflowState};
use super::workflow::{ExtractionWorkflow, Node, Transition, WorkflowOptions};

pub struct WorkflowRunner {
    workflow: ExtractionWorkflow,
}

impl WorkflowRunner {
    pub fn new(model: Arc<dyn Model>, catalog: Arc<FieldCatalog>, options: WorkflowOptions) -> Self {
        Self::from_workflow(ExtractionWorkflow::new(model, catalog, options))
    }

    pub fn from_workflow(workflow: ExtractionWorkflow) -> Self {
        Self { workflow }
    }

    pub fn workflow(&self) -> &ExtractionWorkflow {
        &self.workflow
    }

    /// Run the whole pipeline over one transcript
    pub async fn run(&self, ocr_text: &str, form_type: &str) -> Result<WorkflowState, ClaimflowError> {
        self.run_with_cancel(ocr_text, form_type, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), stopping between or during nodes once `cancel` fires
    pub async fn run_with_cancel(
        &self,
        ocr_text: &str,
        form_type: &str,
        cancel: CancellationToken,
    ) -> Result<WorkflowState, ClaimflowError> {
        start(&self.workflow, ocr_text, form_type, cancel).await
    }

    /// Continue a cancelled run from the node after its last completed step
    ///
    /// A terminal state is returned unchanged.
    pub async fn resume(
        &self,
        mut state: WorkflowState,
        cancel: CancellationToken,
    ) -> Result<WorkflowState, ClaimflowError> {
        if state.is_frozen() {
            return Ok(state);
        }
        let node = Node::after(state.current_step()).ok_or_else(|| {
            ClaimflowError::invalid_input(format!(
                "nothing to resume after {}",
                state.current_step()
            ))
        })?;

        state.clear_cancelled();
        log::info!("[{}] resuming at {}", state.run_id(), node);
        Ok(drive(&self.workflow, state, node, cancel).await)
    }
}

/// Validate the call, build the initial state and drive it to the end
pub(crate) async fn start(
    workflow: &ExtractionWorkflow,
    ocr_text: &str,
    form_type: &str,
    cancel: CancellationToken,
) -> Result<WorkflowState, ClaimflowError> {
    if ocr_text.trim().is_empty() {
        return Err(ClaimflowError::invalid_input("ocr_text is empty"));
    }
    if form_type.trim().is_empty() {
        return Err(ClaimflowError::invalid_input("form_type is empty"));
    }

    let state = WorkflowState::new(ocr_text, form_type.trim());
    log::info!(
        "[{}] starting {} extraction ({} chars of OCR text)",
        state.run_id(),
        state.form_type(),
        ocr_text.len()
    );
    Ok(drive(workflow, state, Node::ValidateForm, cancel).await)
}

async fn drive(
    workflow: &ExtractionWorkflow,
    mut committed: WorkflowState,
    mut node: Node,
    cancel: CancellationToken,
) -> WorkflowState {
    loop {
        if cancel.is_cancelled() {
            return cancelled(committed);
        }

        let mut working = committed.clone();
        let transition = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            t = workflow.step(node, &mut working) => Some(t),
        };
        let Some(transition) = transition else {
            log::info!("[{}] {} interrupted", committed.run_id(), node);
            return cancelled(committed);
        };
        committed = working;

        let terminal = match transition {
            Transition::Next(next) => {
                node = next;
                continue;
            }
            Transition::Done => Step::Done,
            Transition::Failed => Step::Failed,
        };

        if let Err(e) = committed.finish(terminal) {
            log::error!("[{}] could not finish: {}", committed.run_id(), e);
        }
        log::info!(
            "[{}] finished {} with {} fields, {} errors",
            committed.run_id(),
            terminal,
            committed.extracted_fields().len(),
            committed.errors().len()
        );
        return committed;
    }
}

fn cancelled(mut state: WorkflowState) -> WorkflowState {
    log::info!(
        "[{}] cancelled after {}",
        state.run_id(),
        state.current_step()
    );
    state.mark_cancelled();
    state
}
