// SPDX-License-Identifier: MIT

//! Catalog loader - form types from YAML files
//!
//! A file holds either a single form catalog or a `forms:` list of them.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::adk::error::ClaimflowError;

use super::catalog::{FieldCatalog, FormCatalog};

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    Many { forms: Vec<FormCatalog> },
    One(FormCatalog),
}

/// Loads form catalogs from YAML files
pub struct CatalogLoader;

impl CatalogLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load and validate every form in a YAML file
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Vec<FormCatalog>, ClaimflowError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        log::debug!("Loading catalog from {}", path.display());
        Self::parse_yaml(&content)
    }

    /// Parse and validate form catalogs from a YAML string
    pub fn parse_yaml(content: &str) -> Result<Vec<FormCatalog>, ClaimflowError> {
        let forms = match serde_yaml::from_str::<CatalogFile>(content)? {
            CatalogFile::Many { forms } => forms,
            CatalogFile::One(form) => vec![form],
        };
        if forms.is_empty() {
            return Err(ClaimflowError::config("catalog file declares no forms"));
        }
        for form in &forms {
            form.validate()?;
        }
        Ok(forms)
    }

    /// Merge the forms from `path` into `catalog`, replacing same-named types
    pub fn load_into<P: AsRef<Path>>(
        &self,
        catalog: &mut FieldCatalog,
        path: P,
    ) -> Result<Vec<String>, ClaimflowError> {
        let forms = self.load_file(path)?;
        let mut loaded = Vec::with_capacity(forms.len());
        for form in forms {
            loaded.push(form.form_type.clone());
            catalog.insert(form)?;
        }
        log::info!("Loaded form types: {}", loaded.join(", "));
        Ok(loaded)
    }
}

impl Default for CatalogLoader {
    fn default() -> Self {
        Self::new()
    }
}
