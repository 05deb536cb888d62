// SPDX-License-Identifier: MIT

//! Bounded retry with exponential backoff for reasoning calls
//!
//! Only the final outcome is reported to the caller. Individual attempts
//! are visible in debug logs but never reach the workflow state.

use std::time::Duration;
use tokio::time::sleep;

use crate::adk::error::ModelError;
use crate::adk::model::{Content, GenerationConfig, Model};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32, error: &ModelError) -> Duration {
        if let ModelError::RateLimited {
            retry_after_secs: Some(secs),
        } = error
        {
            return Duration::from_secs(*secs).min(self.max_backoff);
        }
        let factor = self.multiplier.max(1.0).powi(retry as i32);
        self.initial_backoff.mul_f64(factor).min(self.max_backoff)
    }
}

/// Result of a retried call
#[derive(Debug)]
pub struct CallOutcome {
    pub result: Result<Content, ModelError>,
    pub attempts: u32,
}

/// Call the model, retrying transient failures within the policy
pub async fn generate_with_retry(
    model: &dyn Model,
    history: &[Content],
    config: &GenerationConfig,
    policy: &RetryPolicy,
) -> CallOutcome {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match model.generate_content(history, config).await {
            Ok(content) => {
                return CallOutcome {
                    result: Ok(content),
                    attempts,
                }
            }
            Err(err) if err.is_transient() && attempts < policy.max_attempts() => {
                let delay = policy.backoff(attempts - 1, &err);
                log::debug!(
                    "{} attempt {}/{} failed ({}), retrying in {:?}",
                    model.name(),
                    attempts,
                    policy.max_attempts(),
                    err,
                    delay
                );
                sleep(delay).await;
            }
            Err(err) => {
                return CallOutcome {
                    result: Err(err),
                    attempts,
                }
            }
        }
    }
}
