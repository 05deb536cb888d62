// SPDX-License-Identifier: MIT

//! Field catalog - which fields a form type carries and how they relate

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use super::state::FieldValue;

pub const CMS_1500: &str = "CMS-1500";

#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("Unknown form type: {0}")]
    UnknownFormType(String),

    #[error("Form type {form_type} declares field '{field}' more than once")]
    DuplicateField { form_type: String, field: String },

    #[error("Rule '{rule}' in {form_type} references undeclared field '{field}'")]
    UnknownRuleField {
        form_type: String,
        rule: String,
        field: String,
    },

    #[error("Rule '{rule}' in {form_type} names no fields")]
    EmptyRule { form_type: String, rule: String },
}

/// Expected shape of a field value
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Date,
    Code,
    Currency,
}

impl FieldKind {
    /// Whether a non-null value has the expected shape
    pub fn accepts(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (_, FieldValue::Null) => true,
            (FieldKind::String, _) => true,
            (FieldKind::Currency, FieldValue::Number(n)) => n.is_finite() && *n >= 0.0,
            (FieldKind::Currency, FieldValue::Text(s)) => is_currency(s),
            (FieldKind::Date, FieldValue::Text(s)) => parse_date(s).is_some(),
            (FieldKind::Code, FieldValue::Text(s)) => is_code(s),
            (FieldKind::Code, FieldValue::Number(n)) => n.fract() == 0.0 && *n >= 0.0,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Date => "date",
            FieldKind::Code => "code",
            FieldKind::Currency => "currency",
        }
    }
}

/// Parse the date layouts that appear on claim forms
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    const FORMATS: [&str; 5] = ["%m/%d/%Y", "%m %d %Y", "%m-%d-%Y", "%Y-%m-%d", "%m/%d/%y"];
    let raw = raw.trim();
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn is_currency(raw: &str) -> bool {
    let s = raw.trim().trim_start_matches('$').trim();
    let (whole, cents) = match s.split_once('.') {
        Some((w, c)) => (w, Some(c)),
        None => (s, None),
    };
    let whole_ok = !whole.is_empty()
        && whole.chars().all(|c| c.is_ascii_digit() || c == ',')
        && whole.chars().next().is_some_and(|c| c.is_ascii_digit());
    let cents_ok = cents.map_or(true, |c| {
        !c.is_empty() && c.len() <= 2 && c.chars().all(|ch| ch.is_ascii_digit())
    });
    whole_ok && cents_ok
}

fn is_code(raw: &str) -> bool {
    let s = raw.trim();
    !s.is_empty()
        && s.chars().any(|c| c.is_ascii_alphanumeric())
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

/// A field expected on the form
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FieldDef {
    pub name: String,
    /// Human-readable label (usually the form box)
    #[serde(default)]
    pub label: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

/// Relation that must hold between fields
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "relation", rename_all = "snake_case")]
pub enum Relation {
    /// If `field` has a value, every field in `requires` must too
    Requires { field: String, requires: Vec<String> },
    /// Either every field has a value or none does
    AllOrNone { fields: Vec<String> },
    /// At least one of the fields has a value
    AtLeastOne { fields: Vec<String> },
    /// Both dates present and `earlier` is not after `later`
    DateOrder { earlier: String, later: String },
}

impl Relation {
    /// Every field the relation mentions
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Relation::Requires { field, requires } => std::iter::once(field.as_str())
                .chain(requires.iter().map(|s| s.as_str()))
                .collect(),
            Relation::AllOrNone { fields } | Relation::AtLeastOne { fields } => {
                fields.iter().map(|s| s.as_str()).collect()
            }
            Relation::DateOrder { earlier, later } => vec![earlier.as_str(), later.as_str()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CrossFieldRule {
    pub name: String,
    #[serde(flatten)]
    pub relation: Relation,
}

/// Catalog entry for one form type
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FormCatalog {
    pub form_type: String,
    #[serde(default)]
    pub description: String,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub rules: Vec<CrossFieldRule>,
}

impl FormCatalog {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Check declared fields are unique and rules only name declared fields
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(CatalogError::DuplicateField {
                    form_type: self.form_type.clone(),
                    field: field.name.clone(),
                });
            }
        }

        for rule in &self.rules {
            let fields = rule.relation.fields();
            if fields.is_empty() {
                return Err(CatalogError::EmptyRule {
                    form_type: self.form_type.clone(),
                    rule: rule.name.clone(),
                });
            }
            if let Some(missing) = fields.iter().find(|f| !seen.contains(**f)) {
                return Err(CatalogError::UnknownRuleField {
                    form_type: self.form_type.clone(),
                    rule: rule.name.clone(),
                    field: missing.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Read-only lookup of form catalogs by form type
#[derive(Debug, Clone, Default)]
pub struct FieldCatalog {
    forms: BTreeMap<String, FormCatalog>,
}

impl FieldCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog containing the built-in form types
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.forms.insert(CMS_1500.to_string(), cms_1500());
        catalog
    }

    /// Add or replace a form type after validating it
    pub fn insert(&mut self, form: FormCatalog) -> Result<(), CatalogError> {
        form.validate()?;
        self.forms.insert(form.form_type.clone(), form);
        Ok(())
    }

    pub fn form(&self, form_type: &str) -> Result<&FormCatalog, CatalogError> {
        self.forms
            .get(form_type)
            .ok_or_else(|| CatalogError::UnknownFormType(form_type.to_string()))
    }

    pub fn fields_for(&self, form_type: &str) -> Result<&[FieldDef], CatalogError> {
        self.form(form_type).map(|f| f.fields.as_slice())
    }

    pub fn rules_for(&self, form_type: &str) -> Result<&[CrossFieldRule], CatalogError> {
        self.form(form_type).map(|f| f.rules.as_slice())
    }

    pub fn form_types(&self) -> impl Iterator<Item = &str> {
        self.forms.keys().map(|s| s.as_str())
    }
}

fn field(name: &str, label: &str, kind: FieldKind, required: bool) -> FieldDef {
    FieldDef {
        name: name.to_string(),
        label: label.to_string(),
        kind,
        required,
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn cms_1500() -> FormCatalog {
    use FieldKind::*;

    FormCatalog {
        form_type: CMS_1500.to_string(),
        description: "CMS-1500 professional health insurance claim form".to_string(),
        fields: vec![
            field("patient_name", "Box 2 patient's name", String, true),
            field("patient_dob", "Box 3 patient's birth date", Date, true),
            field("patient_sex", "Box 3 sex", Code, false),
            field("patient_address", "Box 5 patient's address", String, false),
            field("insured_id", "Box 1a insured's ID number", Code, true),
            field("insured_name", "Box 4 insured's name", String, false),
            field("policy_number", "Box 11 insured's policy number", Code, false),
            field("group_number", "Box 11 insured's group/FECA number", Code, false),
            field("diagnosis_code", "Box 21A primary ICD-10 code", Code, true),
            field("diagnosis_code_2", "Box 21B secondary ICD-10 code", Code, false),
            field("procedure_code", "Box 24D CPT/HCPCS code", Code, true),
            field("service_date_from", "Box 24A date of service from", Date, true),
            field("service_date_to", "Box 24A date of service to", Date, false),
            field("charges", "Box 24F charges", Currency, false),
            field("total_charge", "Box 28 total charge", Currency, true),
            field("rendering_provider_npi", "Box 24J rendering provider NPI", Code, false),
            field("billing_provider_npi", "Box 33a billing provider NPI", Code, true),
            field("federal_tax_id", "Box 25 federal tax ID number", Code, false),
            field("prior_authorization", "Box 23 prior authorization number", Code, false),
        ],
        rules: vec![
            CrossFieldRule {
                name: "policy_requires_group".to_string(),
                relation: Relation::Requires {
                    field: "policy_number".to_string(),
                    requires: names(&["group_number"]),
                },
            },
            CrossFieldRule {
                name: "insured_requires_id".to_string(),
                relation: Relation::Requires {
                    field: "insured_name".to_string(),
                    requires: names(&["insured_id"]),
                },
            },
            CrossFieldRule {
                name: "service_dates_ordered".to_string(),
                relation: Relation::DateOrder {
                    earlier: "service_date_from".to_string(),
                    later: "service_date_to".to_string(),
                },
            },
            CrossFieldRule {
                name: "diagnosis_present".to_string(),
                relation: Relation::AtLeastOne {
                    fields: names(&["diagnosis_code", "diagnosis_code_2"]),
                },
            },
            CrossFieldRule {
                name: "charge_requires_procedure".to_string(),
                relation: Relation::Requires {
                    field: "charges".to_string(),
                    requires: names(&["procedure_code"]),
                },
            },
            CrossFieldRule {
                name: "billing_identity".to_string(),
                relation: Relation::AllOrNone {
                    fields: names(&["billing_provider_npi", "federal_tax_id"]),
                },
            },
        ],
    }
}
