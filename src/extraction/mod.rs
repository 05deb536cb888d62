// SPDX-License-Identifier: MIT

pub mod catalog;
pub mod loader;
pub mod parse;
pub mod prompt;
pub mod retry;
pub mod runner;
pub mod scoring;
pub mod state;
pub mod workflow;

pub use catalog::{FieldCatalog, FieldDef, FormCatalog, CMS_1500};
pub use runner::WorkflowRunner;
pub use state::{ErrorEntry, ErrorKind, FieldValue, Step, WorkflowState};
pub use workflow::{ExtractionWorkflow, WorkflowOptions};
