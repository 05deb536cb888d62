// SPDX-License-Identifier: MIT

//! Environment-driven settings
//!
//! The binary loads `.env` with `dotenv` before calling [`Settings::from_env`].
//! Every value has a default except the provider credentials, which are only
//! checked when a real client is constructed.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::adk::error::ClaimflowError;
use crate::adk::model::GenerationConfig;
use crate::extraction::retry::RetryPolicy;
use crate::extraction::workflow::WorkflowOptions;

pub const DEFAULT_LLM_BASE: &str = "https://api.moonshot.cn/v1";
pub const DEFAULT_LLM_MODEL: &str = "moonshot-v1-128k";
pub const DEFAULT_OCR_BASE: &str = "https://router.huggingface.co/v1";
pub const DEFAULT_OCR_MODEL: &str = "deepseek-ai/DeepSeek-OCR:novita";

/// Application settings loaded from environment variables
#[derive(Debug, Clone)]
pub struct Settings {
    pub llm_api_key: Option<String>,
    pub llm_api_base: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_timeout: Duration,

    pub hf_token: Option<String>,
    pub ocr_api_base: String,
    pub ocr_model: String,
    pub ocr_timeout: Duration,

    pub max_retries: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_api_key: None,
            llm_api_base: DEFAULT_LLM_BASE.to_string(),
            llm_model: DEFAULT_LLM_MODEL.to_string(),
            llm_temperature: 0.1,
            llm_max_tokens: 4096,
            llm_timeout: Duration::from_secs(120),
            hf_token: None,
            ocr_api_base: DEFAULT_OCR_BASE.to_string(),
            ocr_model: DEFAULT_OCR_MODEL.to_string(),
            ocr_timeout: Duration::from_secs(300),
            max_retries: 3,
            backoff: Duration::from_millis(500),
            backoff_max: Duration::from_millis(8000),
            batch_size: 6,
            concurrency: 4,
        }
    }
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self, ClaimflowError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClaimflowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            llm_api_key: get("MOONSHOT_API_KEY"),
            llm_api_base: get("MOONSHOT_API_BASE").unwrap_or(defaults.llm_api_base),
            llm_model: get("LLM_MODEL").unwrap_or(defaults.llm_model),
            llm_temperature: parse_or(&get, "LLM_TEMPERATURE", defaults.llm_temperature)?,
            llm_max_tokens: parse_or(&get, "LLM_MAX_TOKENS", defaults.llm_max_tokens)?,
            llm_timeout: Duration::from_secs(parse_or(
                &get,
                "LLM_TIMEOUT_SECS",
                defaults.llm_timeout.as_secs(),
            )?),
            hf_token: get("HF_TOKEN"),
            ocr_api_base: get("OCR_API_BASE").unwrap_or(defaults.ocr_api_base),
            ocr_model: get("OCR_MODEL").unwrap_or(defaults.ocr_model),
            ocr_timeout: Duration::from_secs(parse_or(
                &get,
                "OCR_TIMEOUT",
                defaults.ocr_timeout.as_secs(),
            )?),
            max_retries: parse_or(&get, "EXTRACT_MAX_RETRIES", defaults.max_retries)?,
            backoff: Duration::from_millis(parse_or(
                &get,
                "EXTRACT_BACKOFF_MS",
                defaults.backoff.as_millis() as u64,
            )?),
            backoff_max: Duration::from_millis(parse_or(
                &get,
                "EXTRACT_BACKOFF_MAX_MS",
                defaults.backoff_max.as_millis() as u64,
            )?),
            batch_size: parse_or(&get, "EXTRACT_BATCH_SIZE", defaults.batch_size)?.max(1),
            concurrency: parse_or(&get, "EXTRACT_CONCURRENCY", defaults.concurrency)?.max(1),
        })
    }

    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: Some(self.llm_temperature),
            max_output_tokens: Some(self.llm_max_tokens),
            top_p: None,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: self.backoff,
            max_backoff: self.backoff_max,
            multiplier: 2.0,
        }
    }

    pub fn workflow_options(&self) -> WorkflowOptions {
        WorkflowOptions {
            generation: self.generation_config(),
            retry: self.retry_policy(),
            batch_size: self.batch_size,
            concurrency: self.concurrency,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ClaimflowError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ClaimflowError::config(format!("{}={:?}: {}", key, raw, e))),
    }
}
