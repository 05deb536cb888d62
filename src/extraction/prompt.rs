// SPDX-License-Identifier: MIT

//! Prompt construction for the reasoning-backed nodes

use once_cell::sync::Lazy;

use crate::adk::model::Content;

use super::catalog::{FieldDef, FormCatalog};
use super::parse::{schema_text, ExtractResponse, IdentifyResponse};

/// Marker lines the nodes put in their prompts
pub const IDENTIFY_TASK: &str = "Task: identify_fields";
pub const EXTRACT_TASK: &str = "Task: extract_values";

static IDENTIFY_SCHEMA: Lazy<String> = Lazy::new(schema_text::<IdentifyResponse>);
static EXTRACT_SCHEMA: Lazy<String> = Lazy::new(schema_text::<ExtractResponse>);

fn system_prompt(form_type: &str) -> String {
    format!(
        "You are an expert medical document information extraction assistant.\n\
         Your task is to extract structured information from {form_type} forms.\n\n\
         Guidelines:\n\
         - Preserve exact values as they appear in the form\n\
         - Use null for missing fields\n\
         - Mark a field ambiguous when the text supports more than one reading\n\
         - Answer with a single JSON object and nothing else"
    )
}

fn field_lines(fields: &[&FieldDef]) -> String {
    fields
        .iter()
        .map(|f| {
            if f.label.is_empty() {
                format!("- {} ({})", f.name, f.kind.as_str())
            } else {
                format!("- {} ({}): {}", f.name, f.kind.as_str(), f.label)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Ask which catalog fields appear in the transcript
pub fn identify_fields(form: &FormCatalog, ocr_text: &str) -> Vec<Content> {
    let fields: Vec<&FieldDef> = form.fields.iter().collect();
    let user = format!(
        "{IDENTIFY_TASK}\n\
         Decide which of these {form_type} fields are present in the OCR text below.\n\
         Fields:\n{fields}\n\n\
         OCR text:\n<<<\n{ocr_text}\n>>>\n\n\
         Respond with JSON matching this schema:\n{schema}",
        form_type = form.form_type,
        fields = field_lines(&fields),
        schema = IDENTIFY_SCHEMA.as_str(),
    );
    vec![Content::system(system_prompt(&form.form_type)), Content::user(user)]
}

/// Ask for the values of a batch of fields
pub fn extract_values(form: &FormCatalog, ocr_text: &str, fields: &[&FieldDef]) -> Vec<Content> {
    let user = format!(
        "{EXTRACT_TASK}\n\
         Extract the value of each field below from this {form_type} form.\n\
         Fields:\n{fields}\n\n\
         OCR text:\n<<<\n{ocr_text}\n>>>\n\n\
         Return one entry per field under \"fields\", keyed by field name.\n\
         Respond with JSON matching this schema:\n{schema}",
        form_type = form.form_type,
        fields = field_lines(fields),
        schema = EXTRACT_SCHEMA.as_str(),
    );
    vec![Content::system(system_prompt(&form.form_type)), Content::user(user)]
}

/// Field names listed in a prompt built by this module
pub fn listed_fields(prompt: &str) -> Vec<String> {
    prompt
        .lines()
        .skip_while(|l| l.trim() != "Fields:")
        .skip(1)
        .take_while(|l| l.starts_with("- "))
        .filter_map(|l| {
            l[2..]
                .split_whitespace()
                .next()
                .map(|name| name.to_string())
        })
        .collect()
}
