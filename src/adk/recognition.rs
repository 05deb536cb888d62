// SPDX-License-Identifier: MIT

//! Text recognition capability - image in, transcript out
//!
//! Failures are surfaced as [`ModelError`] but never retried here; callers
//! upstream of the extraction workflow own OCR retry.

use crate::adk::config::Settings;
use crate::adk::error::ModelError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use url::Url;

const DEFAULT_OCR_PROMPT: &str =
    "Extract all text from this medical form. Preserve the structure and layout.";

/// Where the form image lives
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    /// `http(s)://` or `data:` URL
    Url(Url),
}

impl ImageSource {
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let url = Url::parse(raw)
            .map_err(|e| ModelError::InvalidRequest(format!("invalid image url {}: {}", raw, e)))?;
        match url.scheme() {
            "http" | "https" | "data" => Ok(Self::Url(url)),
            other => Err(ModelError::InvalidRequest(format!(
                "unsupported image url scheme: {}",
                other
            ))),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Self::Url(url) => url.as_str(),
        }
    }
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &ImageSource) -> Result<String, ModelError>;

    /// Recognize several images in order
    async fn recognize_batch(&self, images: &[ImageSource]) -> Result<Vec<String>, ModelError> {
        let mut results = Vec::with_capacity(images.len());
        for image in images {
            results.push(self.recognize(image).await?);
        }
        Ok(results)
    }
}

/// DeepSeek-OCR served through the HuggingFace inference router
pub struct HuggingFaceOcr {
    client: Client,
    token: String,
    model_name: String,
    base_url: String,
    timeout: Duration,
    prompt: String,
}

impl HuggingFaceOcr {
    /// Requires `HF_TOKEN` to be set.
    pub fn from_settings(settings: &Settings) -> Result<Self, ModelError> {
        let token = settings
            .hf_token
            .clone()
            .ok_or_else(|| ModelError::ApiKeyMissing("huggingface".to_string()))?;
        let client = Client::builder()
            .timeout(settings.ocr_timeout)
            .build()
            .map_err(|e| ModelError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            token,
            model_name: settings.ocr_model.clone(),
            base_url: settings.ocr_api_base.trim_end_matches('/').to_string(),
            timeout: settings.ocr_timeout,
            prompt: DEFAULT_OCR_PROMPT.to_string(),
        })
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    fn build_body(&self, image: &ImageSource) -> serde_json::Value {
        json!({
            "model": self.model_name,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": self.prompt },
                    { "type": "image_url", "image_url": { "url": image.as_str() } }
                ]
            }]
        })
    }
}

#[async_trait]
impl TextRecognizer for HuggingFaceOcr {
    async fn recognize(&self, image: &ImageSource) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        log::info!("Running OCR with {}", self.model_name);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&self.build_body(image))
            .send()
            .await
            .map_err(|e| ModelError::from_transport(e, self.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status.as_u16(), text, None));
        }

        let resp_json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ModelError::from_transport(e, self.timeout))?;

        resp_json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ModelError::InvalidResponse("OCR response had no content".to_string()))
    }
}
