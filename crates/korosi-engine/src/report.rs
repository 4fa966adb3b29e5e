use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use korosi_contracts::prompts::{build_report_prompt, report_error_message, MISSING_API_KEY_MESSAGE};
use korosi_contracts::{Label, Settings};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::ReportError;
use crate::transport::{error_chain_text, is_retryable_transport_error, truncate_text, RetryPolicy};

const GEMINI_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub prompt: String,
    pub image_png: Vec<u8>,
    pub api_key: String,
}

pub trait ReportProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn generate(&self, request: &ReportRequest) -> Result<String, ReportError>;
}

pub struct GeminiReportProvider {
    api_base: String,
    model: String,
    http: HttpClient,
    timeout: Duration,
    retry: RetryPolicy,
}

impl GeminiReportProvider {
    pub fn new(api_base: &str, model: &str) -> Self {
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            model: model.trim().to_string(),
            http: HttpClient::new(),
            timeout: GEMINI_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.gemini_api_base, &settings.gemini_model)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> String {
        let model_path = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    pub fn build_payload(prompt: &str, image_png: &[u8]) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": prompt },
                    {
                        "inlineData": {
                            "mimeType": "image/png",
                            "data": BASE64.encode(image_png),
                        }
                    }
                ],
            }],
        })
    }

    /// Concatenates every text part of the first candidate.
    pub fn extract_text(payload: &Value) -> Result<String, ReportError> {
        let parts = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let text: String = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if !text.trim().is_empty() {
            return Ok(text);
        }

        let reason = payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
            .map(|reason| format!(" (blocked: {reason})"))
            .or_else(|| {
                payload
                    .get("candidates")
                    .and_then(Value::as_array)
                    .and_then(|candidates| candidates.first())
                    .and_then(|candidate| candidate.get("finishReason"))
                    .and_then(Value::as_str)
                    .map(|reason| format!(" (finish reason: {reason})"))
            })
            .unwrap_or_default();
        Err(ReportError::EmptyResponse(reason))
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<HttpResponse, ReportError> {
        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(endpoint)
                .header(API_KEY_HEADER, api_key)
                .timeout(self.timeout)
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    // Report text is shown and saved, so the request URL stays out of it.
                    let err = anyhow::Error::new(raw.without_url())
                        .context("Gemini request failed");
                    if !is_retryable_transport_error(&err) || attempt >= self.retry.max_retries {
                        return Err(ReportError::Transport(error_chain_text(&err, 512)));
                    }
                    warn!(
                        "Gemini transport retry {}/{} after transient request failure",
                        attempt + 1,
                        self.retry.max_retries
                    );
                    self.retry.sleep_before_retry(attempt);
                    attempt += 1;
                }
            }
        }
    }
}

impl ReportProvider for GeminiReportProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn generate(&self, request: &ReportRequest) -> Result<String, ReportError> {
        let endpoint = self.endpoint();
        let payload = Self::build_payload(&request.prompt, &request.image_png);
        let response = self.post_with_transport_retries(&endpoint, &request.api_key, &payload)?;
        let parsed = response_json_or_error(response)?;
        Self::extract_text(&parsed)
    }
}

fn response_json_or_error(response: HttpResponse) -> Result<Value, ReportError> {
    let status = response.status();
    let body = response.text().map_err(|err| {
        ReportError::Transport(error_chain_text(
            &anyhow::Error::new(err).context("Gemini response body read failed"),
            512,
        ))
    })?;
    if !status.is_success() {
        return Err(ReportError::Api {
            status: status.as_u16(),
            body: truncate_text(body.trim(), 512),
        });
    }
    serde_json::from_str(&body).map_err(|err| ReportError::InvalidPayload(err.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Generated,
    MissingCredential,
    Failed,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::MissingCredential => "missing_credential",
            Self::Failed => "failed",
        }
    }
}

/// Report text ready to show or save, whatever happened upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub status: ReportStatus,
    pub text: String,
    pub model: Option<String>,
}

impl Report {
    pub fn is_generated(&self) -> bool {
        self.status == ReportStatus::Generated
    }
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

#[derive(Clone)]
pub struct ReportGenerator {
    provider: Arc<dyn ReportProvider>,
}

impl ReportGenerator {
    pub fn new(provider: Arc<dyn ReportProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &dyn ReportProvider {
        self.provider.as_ref()
    }

    /// Never fails: a missing credential yields the configuration warning and
    /// any provider failure is rendered into the returned text.
    pub fn generate_report(
        &self,
        image: &DynamicImage,
        label: Label,
        confidence_percent: f64,
        api_key: Option<&str>,
    ) -> Report {
        let Some(api_key) = api_key.map(str::trim).filter(|key| !key.is_empty()) else {
            return Report {
                status: ReportStatus::MissingCredential,
                text: MISSING_API_KEY_MESSAGE.to_string(),
                model: None,
            };
        };
        let model = Some(self.provider.model().to_string());

        let result = encode_png(image)
            .map_err(ReportError::from)
            .and_then(|image_png| {
                let request = ReportRequest {
                    prompt: build_report_prompt(label, confidence_percent),
                    image_png,
                    api_key: api_key.to_string(),
                };
                self.provider.generate(&request)
            });

        match result {
            Ok(text) => {
                info!(
                    provider = self.provider.name(),
                    chars = text.chars().count(),
                    "report generated"
                );
                Report {
                    status: ReportStatus::Generated,
                    text,
                    model,
                }
            }
            Err(err) => {
                warn!(provider = self.provider.name(), "report generation failed: {err}");
                Report {
                    status: ReportStatus::Failed,
                    text: report_error_message(&err.to_string()),
                    model,
                }
            }
        }
    }
}
