// SPDX-License-Identifier: MIT

//! Model module - defines the reasoning capability trait and implementations
//!
//! This module provides the core Model trait and shared types.
//! Model implementations are in their own submodules:
//! - [openai] - OpenAI-compatible chat completions (Moonshot/Kimi by default)

pub mod openai;

use crate::adk::error::ModelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Configuration for model generation
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

/// Parts of a message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Part {
    /// Regular text output from the model
    Text(String),
    /// Reasoning content from thinking models (e.g., Kimi's `reasoning_content`)
    Thinking(String),
}

impl Content {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part::Text(text.into())],
        }
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                Part::Thinking(_) => None,
            })
            .collect()
    }

    /// Concatenated thinking parts, if the model produced any
    pub fn thinking(&self) -> Option<String> {
        let thinking: String = self
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Thinking(t) => Some(t.as_str()),
                Part::Text(_) => None,
            })
            .collect();
        if thinking.trim().is_empty() {
            None
        } else {
            Some(thinking)
        }
    }
}

/// Core trait for reasoning capability implementations
#[async_trait]
pub trait Model: Send + Sync {
    /// Identifier used in log lines
    fn name(&self) -> &str;

    async fn generate_content(
        &self,
        history: &[Content],
        config: &GenerationConfig,
    ) -> Result<Content, ModelError>;
}

/// Short round trip used to confirm a provider is reachable and authorized
pub async fn ping(model: &dyn Model) -> Result<String, ModelError> {
    let history = [Content::user(
        "Hello! Can you confirm you're working? Just say 'Yes, I'm working.'",
    )];
    let config = GenerationConfig {
        temperature: Some(0.0),
        max_output_tokens: Some(32),
        top_p: None,
    };
    let reply = model.generate_content(&history, &config).await?.text();
    if reply.trim().is_empty() {
        return Err(ModelError::InvalidResponse(format!(
            "{} returned an empty reply",
            model.name()
        )));
    }
    Ok(reply.trim().to_string())
}
