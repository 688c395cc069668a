use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info};

use super::{classify_failure, truncate, RemoteVideoApi};
use crate::error::{BackendError, BackendResult};
use crate::models::BackendKind;

pub const DEFAULT_BASE_URL: &str = "https://api-inference.huggingface.co";
pub const DEFAULT_MODEL: &str = "Wan-AI/Wan2.1-T2V-14B-Diffusers";

/// Hugging Face serverless inference for text-to-video models.
pub struct HuggingFaceApi {
    client: Client,
    token: Option<String>,
    base_url: String,
    model: String,
}

impl HuggingFaceApi {
    pub fn new(token: Option<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            token: token.filter(|t| !t.trim().is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}", self.base_url, self.model)
    }

    async fn perform_api_call(&self, token: &str, prompt: &str, duration: u32) -> BackendResult<Bytes> {
        let url = self.endpoint();
        info!("🔗 Making request to: {}", url);

        let request_body = json!({
            "inputs": prompt,
            "parameters": { "duration": duration }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        if !status.is_success() {
            let headers = response.headers().clone();
            let error_body = response.text().await.unwrap_or_default();
            error!("❌ API Error response: {}", truncate(&error_body, 500));
            return Err(classify_failure(status, &headers, &error_body));
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        let body = response.bytes().await?;
        if is_json || body.is_empty() {
            // A JSON body on 200 is an error document, never a clip.
            return Err(BackendError::InvalidResponse(truncate(
                &String::from_utf8_lossy(&body),
                300,
            )));
        }

        info!("🎞️ Received {} bytes of video", body.len());
        Ok(body)
    }
}

#[async_trait]
impl RemoteVideoApi for HuggingFaceApi {
    fn kind(&self) -> BackendKind {
        BackendKind::HuggingFace
    }

    async fn generate(&self, prompt: &str, duration: u32) -> BackendResult<Bytes> {
        let Some(token) = self.token.as_deref() else {
            return Err(BackendError::Auth(
                "HF_TOKEN is not set (create one at https://huggingface.co/settings/tokens)".into(),
            ));
        };
        info!("🌐 Generating video via Hugging Face ({}) for {}s", self.model, duration);
        self.perform_api_call(token, prompt, duration).await
    }
}
