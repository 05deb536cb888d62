// SPDX-License-Identifier: MIT

//! Typed error handling for claimflow-rs
//!
//! Capability failures (`ModelError`) are classified as transient or
//! permanent so the workflow can decide whether a call is worth retrying.
//! `ClaimflowError` is what crosses the public API boundary.

use std::time::Duration;
use thiserror::Error;

use crate::extraction::catalog::CatalogError;

/// Top-level error type for claimflow-rs
#[derive(Debug, Error)]
pub enum ClaimflowError {
    /// Structurally invalid call, rejected before any workflow state exists
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors (missing env vars, invalid values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Field catalog errors
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Reasoning or recognition capability errors
    #[error(transparent)]
    Model(#[from] ModelError),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error wrapper for compatibility
    #[error("{0}")]
    Other(String),
}

/// Errors raised by the reasoning and text-recognition capabilities
#[derive(Debug, Error)]
pub enum ModelError {
    /// The request did not complete in time
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Upstream unavailable (5xx, connection reset, DNS)
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The request itself was rejected as malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid response from model
    #[error("Invalid response from model: {0}")]
    InvalidResponse(String),

    /// API key not configured
    #[error("API key not configured for provider: {0}")]
    ApiKeyMissing(String),
}

impl ModelError {
    /// Whether a retry of the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Unavailable(_)
        )
    }

    /// Classify an HTTP error status returned by a provider
    pub fn from_status(status: u16, body: String, retry_after_secs: Option<u64>) -> Self {
        match status {
            408 => Self::Timeout(Duration::ZERO),
            429 => Self::RateLimited { retry_after_secs },
            401 | 403 => Self::Auth(body),
            500..=599 => Self::Unavailable(format!("HTTP {}: {}", status, body)),
            _ => Self::InvalidRequest(format!("HTTP {}: {}", status, body)),
        }
    }

    /// Classify a transport-level reqwest failure
    pub fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_connect() || err.is_request() {
            Self::Unavailable(err.to_string())
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::InvalidRequest(err.to_string())
        }
    }
}

impl ClaimflowError {
    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create from a generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl From<&str> for ClaimflowError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

impl From<String> for ClaimflowError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}
