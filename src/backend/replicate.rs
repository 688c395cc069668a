use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::{classify_failure, truncate, RemoteVideoApi};
use crate::error::{BackendError, BackendResult};
use crate::models::BackendKind;

pub const DEFAULT_BASE_URL: &str = "https://api.replicate.com";
pub const DEFAULT_MODEL: &str = "fofr/wan-2.1";

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 300;

pub struct ReplicateApi {
    client: Client,
    token: Option<String>,
    base_url: String,
    model: String,
}

impl ReplicateApi {
    pub fn new(token: Option<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            token: token.filter(|t| !t.trim().is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    async fn create_prediction(&self, token: &str, prompt: &str, duration: u32) -> BackendResult<Prediction> {
        let url = format!("{}/v1/models/{}/predictions", self.base_url, self.model);
        info!("🔗 Making request to: {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("Prefer", "wait")
            .json(&json!({ "input": { "prompt": prompt, "duration": duration } }))
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn fetch_prediction(&self, token: &str, url: &str) -> BackendResult<Prediction> {
        let response = self.client.get(url).bearer_auth(token).send().await?;
        Self::parse(response).await
    }

    async fn parse(response: reqwest::Response) -> BackendResult<Prediction> {
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await?;
        if !status.is_success() {
            error!("❌ Replicate error {}: {}", status, truncate(&text, 500));
            return Err(classify_failure(status, &headers, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| BackendError::InvalidResponse(format!("parse error: {}: {}", e, truncate(&text, 300))))
    }

    async fn wait_for_output(&self, token: &str, mut prediction: Prediction) -> BackendResult<String> {
        for _ in 0..MAX_POLLS {
            match prediction.status.as_str() {
                "succeeded" => {
                    return prediction.output_url().ok_or_else(|| {
                        BackendError::InvalidResponse("prediction succeeded without an output URL".into())
                    })
                }
                "failed" | "canceled" => {
                    return Err(BackendError::Unknown(format!(
                        "prediction {} {}: {}",
                        prediction.id,
                        prediction.status,
                        prediction.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
                    )))
                }
                _ => {}
            }
            let Some(poll_url) = prediction.urls.as_ref().and_then(|u| u.get.clone()) else {
                return Err(BackendError::InvalidResponse(format!(
                    "prediction {} is {} but has no polling URL",
                    prediction.id, prediction.status
                )));
            };
            tokio::time::sleep(POLL_INTERVAL).await;
            prediction = self.fetch_prediction(token, &poll_url).await?;
        }
        warn!("⏱️ Prediction {} did not finish in time", prediction.id);
        Err(BackendError::Unknown(format!("prediction {} timed out", prediction.id)))
    }
}

#[async_trait]
impl RemoteVideoApi for ReplicateApi {
    fn kind(&self) -> BackendKind {
        BackendKind::Replicate
    }

    async fn generate(&self, prompt: &str, duration: u32) -> BackendResult<Bytes> {
        let Some(token) = self.token.as_deref() else {
            return Err(BackendError::Auth(
                "REPLICATE_API_TOKEN is not set (see https://replicate.com/account/api-tokens)".into(),
            ));
        };
        info!("🌐 Generating video via Replicate ({}) for {}s", self.model, duration);

        let prediction = self.create_prediction(token, prompt, duration).await?;
        let video_url = self.wait_for_output(token, prediction).await?;

        info!("📥 Downloading video...");
        let response = self.client.get(&video_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &headers, &body));
        }
        Ok(response.bytes().await?)
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    id: String,
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    #[serde(default)]
    get: Option<String>,
}

impl Prediction {
    /// The output is either a URL or a list whose first entry is one.
    fn output_url(&self) -> Option<String> {
        match self.output.as_ref()? {
            serde_json::Value::String(url) => Some(url.clone()),
            serde_json::Value::Array(items) => items.first()?.as_str().map(str::to_string),
            _ => None,
        }
    }
}
