// SPDX-License-Identifier: MIT

//! OpenAI-compatible Model - chat completions API implementation
//!
//! Moonshot (Kimi), OpenAI and most hosted inference routers speak this
//! protocol, so a single client covers them by changing the base URL.

use super::{Content, GenerationConfig, Model, Part};
use crate::adk::config::Settings;
use crate::adk::error::ModelError;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

/// OpenAI-compatible chat completions model
pub struct OpenAICompatibleModel {
    client: Client,
    api_key: String,
    model_name: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAICompatibleModel {
    pub fn new(
        api_key: String,
        model_name: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            model_name,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Create a client from settings
    ///
    /// Requires `MOONSHOT_API_KEY` to be set.
    pub fn from_settings(settings: &Settings) -> Result<Self, ModelError> {
        let api_key = settings
            .llm_api_key
            .clone()
            .ok_or_else(|| ModelError::ApiKeyMissing("moonshot".to_string()))?;
        Self::new(
            api_key,
            settings.llm_model.clone(),
            settings.llm_api_base.clone(),
            settings.llm_timeout,
        )
    }

    /// Convert internal Content to an OpenAI message
    fn content_to_openai_message(content: &Content) -> serde_json::Value {
        let role = match content.role.as_str() {
            "system" => "system",
            "user" => "user",
            "model" => "assistant",
            other => other,
        };

        // Thinking parts are never sent back to the provider
        json!({
            "role": role,
            "content": content.text()
        })
    }

    fn build_body(&self, history: &[Content], config: &GenerationConfig) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = history
            .iter()
            .map(Self::content_to_openai_message)
            .collect();

        let mut body = json!({
            "model": self.model_name,
            "messages": messages
        });

        if let Some(temp) = config.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max_tokens) = config.max_output_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(top_p) = config.top_p {
            body["top_p"] = json!(top_p);
        }

        body
    }

    /// Parse an OpenAI response into Content
    fn parse_openai_response(response: &serde_json::Value) -> Result<Content, ModelError> {
        let choice = response["choices"]
            .as_array()
            .and_then(|c| c.first())
            .ok_or_else(|| ModelError::InvalidResponse("No choices in response".to_string()))?;

        let message = &choice["message"];
        let mut parts = Vec::new();

        if let Some(reasoning) = message["reasoning_content"].as_str() {
            if !reasoning.is_empty() {
                parts.push(Part::Thinking(reasoning.to_string()));
            }
        }

        if let Some(content) = message["content"].as_str() {
            if !content.is_empty() {
                parts.push(Part::Text(content.to_string()));
            }
        }

        if !parts.iter().any(|p| matches!(p, Part::Text(_))) {
            return Err(ModelError::InvalidResponse(
                "Completion contained no text".to_string(),
            ));
        }

        Ok(Content {
            role: "model".to_string(),
            parts,
        })
    }
}

#[async_trait]
impl Model for OpenAICompatibleModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn generate_content(
        &self,
        history: &[Content],
        config: &GenerationConfig,
    ) -> Result<Content, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(history, config);

        log::debug!(
            "Chat completion request body: {}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::from_transport(e, self.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status.as_u16(), text, retry_after));
        }

        let resp_json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ModelError::from_transport(e, self.timeout))?;
        log::debug!("Chat completion response: {}", resp_json);

        Self::parse_openai_response(&resp_json)
    }
}
