use std::{future::Future, time::Duration};

use log::{debug, info};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;

use crate::{
    catalog::NEGATIVE_PROMPT,
    error::{AppError, AppResult},
    prompt,
};

pub const PROVIDER: &str = "huggingface";
const DEFAULT_MODEL: &str = "stabilityai/stable-diffusion-xl-base-1.0";
const DEFAULT_ENDPOINT: &str =
    "https://api-inference.huggingface.co/models/stabilityai/stable-diffusion-xl-base-1.0";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
    pub api_token: Option<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            api_token: None,
        }
    }
}

impl InferenceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let endpoint = std::env::var("ASSET_FORGE_ENDPOINT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.endpoint);
        let model = std::env::var("ASSET_FORGE_MODEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.model);
        let timeout = std::env::var("ASSET_FORGE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);
        let api_token = std::env::var("HF_API_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty());

        Self {
            endpoint,
            model,
            timeout,
            api_token,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InferencePayload {
    pub inputs: String,
    pub parameters: InferenceParameters,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InferenceParameters {
    pub negative_prompt: String,
}

pub fn build_payload(enhanced_prompt: &str) -> InferencePayload {
    InferencePayload {
        inputs: enhanced_prompt.to_string(),
        parameters: InferenceParameters {
            negative_prompt: NEGATIVE_PROMPT.to_string(),
        },
    }
}

/// One request/response exchange with the inference endpoint.
pub trait InferenceTransport: Send + Sync {
    fn post(
        &self,
        token: &str,
        payload: &InferencePayload,
    ) -> impl Future<Output = AppResult<Vec<u8>>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(config: &InferenceConfig) -> AppResult<Self> {
        let http_client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
        })
    }
}

impl InferenceTransport for HttpTransport {
    async fn post(&self, token: &str, payload: &InferencePayload) -> AppResult<Vec<u8>> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|error| AppError::generation(format!("request failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(parse_inference_http_error(status, &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|error| AppError::generation(format!("failed to read image: {error}")))?;
        Ok(bytes.to_vec())
    }
}

pub struct GenerationClient<T = HttpTransport> {
    transport: T,
    model: String,
}

impl GenerationClient<HttpTransport> {
    pub fn new(config: &InferenceConfig) -> AppResult<Self> {
        Ok(Self::with_transport(
            HttpTransport::new(config)?,
            config.model.clone(),
        ))
    }
}

impl<T: InferenceTransport> GenerationClient<T> {
    pub fn with_transport(transport: T, model: impl Into<String>) -> Self {
        Self {
            transport,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends one request and returns the raw image payload. Missing inputs are
    /// rejected before anything goes over the wire; failures are not retried.
    pub async fn generate(&self, enhanced_prompt: &str, token: &str) -> AppResult<Vec<u8>> {
        prompt::validate_inputs(enhanced_prompt, token)?;

        let payload = build_payload(enhanced_prompt);
        debug!("requesting image from {}", self.model);
        let bytes = self.transport.post(token, &payload).await?;

        if bytes.is_empty() {
            return Err(AppError::generation("inference endpoint returned no image data"));
        }

        info!("received {} bytes from {}", bytes.len(), self.model);
        Ok(bytes)
    }
}

fn parse_inference_http_error(status: StatusCode, body: &str) -> AppError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .and_then(|v| v.as_str().or_else(|| v.get("message").and_then(Value::as_str)))
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());

    if message.is_empty() {
        AppError::generation(format!("inference request failed ({status})"))
    } else {
        AppError::generation(format!("inference request failed ({status}): {message}"))
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::{fake::FakeTransport, *};

    #[test]
    fn payload_carries_prompt_and_negative_prompt() {
        let payload = serde_json::to_value(build_payload("a crate, prop, game asset")).unwrap();
        assert_eq!(payload["inputs"], "a crate, prop, game asset");
        assert_eq!(
            payload["parameters"]["negative_prompt"],
            "low quality, blurry, bad anatomy, watermark, signature, text"
        );
    }

    #[test]
    fn http_errors_prefer_the_json_message() {
        let error = parse_inference_http_error(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"error":"Model is currently loading","estimated_time":20.0}"#,
        );
        assert!(error.to_string().contains("Model is currently loading"));

        let error = parse_inference_http_error(StatusCode::UNAUTHORIZED, "");
        assert!(matches!(error, AppError::Generation(_)));
        assert!(error.to_string().contains("401"));
    }

    #[tokio::test]
    async fn empty_prompt_never_reaches_the_network() {
        let transport = FakeTransport::returning(vec![1, 2, 3]);
        let calls = transport.calls.clone();
        let client = GenerationClient::with_transport(transport, DEFAULT_MODEL);

        let result = client.generate("", "abc").await;
        assert!(matches!(result, Err(AppError::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_exchange_is_a_generation_error_without_retry() {
        let transport = FakeTransport::failing("boom");
        let calls = transport.calls.clone();
        let client = GenerationClient::with_transport(transport, DEFAULT_MODEL);

        let result = client.generate("a crate", "abc").await;
        assert!(matches!(result, Err(AppError::Generation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_exchange_returns_raw_bytes() {
        let transport = FakeTransport::returning(vec![9, 8, 7]);
        let last_token = transport.last_token.clone();
        let client = GenerationClient::with_transport(transport, DEFAULT_MODEL);

        let bytes = client.generate("a crate", "hf_abc").await.unwrap();
        assert_eq!(bytes, vec![9, 8, 7]);
        assert_eq!(last_token.lock().unwrap().as_deref(), Some("hf_abc"));
    }

    #[tokio::test]
    async fn empty_payload_is_a_generation_error() {
        let client = GenerationClient::with_transport(FakeTransport::returning(Vec::new()), "m");
        let result = client.generate("a crate", "abc").await;
        assert!(matches!(result, Err(AppError::Generation(_))));
    }
}
