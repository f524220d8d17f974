//! Multimodal chat-completion client used to label one image at a time

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::LabelError;

const USER_AGENT: &str = concat!("streetlabel/", env!("CARGO_PKG_VERSION"));
const TOO_MANY_REQUESTS: u16 = 429;

/// Raw HTTP outcome of one completion request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        TransportResponse {
            status,
            body: body.into(),
        }
    }
}

/// Sends a JSON completion request authorized with `api_key`.
/// Errors are transport failures only; HTTP error statuses come back as responses.
pub trait CompletionTransport: Send + Sync {
    fn post_json(&self, api_key: &str, payload: &Value) -> Result<TransportResponse, LabelError>;
}

impl<T: CompletionTransport + ?Sized> CompletionTransport for Arc<T> {
    fn post_json(&self, api_key: &str, payload: &Value) -> Result<TransportResponse, LabelError> {
        (**self).post_json(api_key, payload)
    }
}

/// Blocking reqwest transport
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(HttpTransport {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl CompletionTransport for HttpTransport {
    fn post_json(&self, api_key: &str, payload: &Value) -> Result<TransportResponse, LabelError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(payload)
            .send()
            .map_err(|e| LabelError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| LabelError::Network(e.to_string()))?;
        Ok(TransportResponse { status, body })
    }
}

/// Base64 of the image bytes, as embedded in the request's data URL
pub fn encode_image(path: &Path) -> Result<String, LabelError> {
    let bytes = std::fs::read(path).map_err(|source| LabelError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(general_purpose::STANDARD.encode(bytes))
}

/// Chat-completion body carrying the prompt and one JPEG image
pub fn build_payload(model: &str, max_tokens: u32, prompt: &str, base64_image: &str) -> Value {
    json!({
        "model": model,
        "messages": [
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/jpeg;base64,{}", base64_image) }
                    }
                ]
            }
        ],
        "max_tokens": max_tokens
    })
}

/// Pull `choices[0].message.content` out of a completion body.
/// A null or empty content is not a usable label.
pub fn extract_content(body: &str) -> Result<String, LabelError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| LabelError::MalformedResponse(format!("invalid JSON: {}", e)))?;

    let first_choice = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| {
            LabelError::MalformedResponse("Response does not contain 'choices'".to_string())
        })?;

    let content = first_choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| LabelError::MalformedResponse("choice has no message content".to_string()))?;

    if content.trim().is_empty() {
        return Err(LabelError::MalformedResponse("empty message content".to_string()));
    }
    Ok(content.to_string())
}

/// Labels images through a completion endpoint.
///
/// Rate-limited requests (HTTP 429) are retried with a delay of
/// `backoff_base * 2^attempt`, up to `max_attempts` requests in total. Any other
/// failure ends the call at once.
pub struct ImageLabeler {
    transport: Box<dyn CompletionTransport>,
    model: String,
    max_tokens: u32,
    max_attempts: u32,
    backoff_base: Duration,
}

impl ImageLabeler {
    pub fn new(transport: Box<dyn CompletionTransport>, config: &PipelineConfig) -> Self {
        ImageLabeler {
            transport,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base(),
        }
    }

    /// Labeler talking to `config.endpoint` over HTTP
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.endpoint.clone(), config.request_timeout())?;
        Ok(Self::new(Box::new(transport), config))
    }

    /// Delay before retrying after the rate-limited attempt `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }

    pub fn label_encoded(
        &self,
        api_key: &str,
        base64_image: &str,
        prompt: &str,
    ) -> Result<String, LabelError> {
        let payload = build_payload(&self.model, self.max_tokens, prompt, base64_image);

        for attempt in 1..=self.max_attempts {
            let response = self.transport.post_json(api_key, &payload)?;

            if response.status == TOO_MANY_REQUESTS {
                if attempt == self.max_attempts {
                    break;
                }
                let delay = self.backoff_delay(attempt);
                warn!("Rate limit exceeded, retrying in {:?}...", delay);
                std::thread::sleep(delay);
                continue;
            }

            if !(200..300).contains(&response.status) {
                return Err(LabelError::Api {
                    status: response.status,
                    body: response.body,
                });
            }

            debug!(attempt, "Completion request succeeded");
            return extract_content(&response.body);
        }

        Err(LabelError::RateLimited {
            attempts: self.max_attempts,
        })
    }
}
