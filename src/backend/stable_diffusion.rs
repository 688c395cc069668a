use async_trait::async_trait;
use base64::Engine;
use image::RgbImage;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{classify_failure, truncate, ImageBackend, ImageRequest};
use crate::error::{BackendError, BackendResult};

const STEPS: u32 = 30;
const GUIDANCE_SCALE: f32 = 7.5;

/// Local diffusion server speaking the AUTOMATIC1111 WebUI API.
pub struct StableDiffusionWebUi {
    client: Client,
    base_url: String,
}

impl StableDiffusionWebUi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ImageBackend for StableDiffusionWebUi {
    fn name(&self) -> &str {
        "sd-webui"
    }

    async fn generate(&self, request: &ImageRequest) -> BackendResult<RgbImage> {
        let url = format!("{}/sdapi/v1/txt2img", self.base_url);
        let seed = request.seed.map(|s| s as i64).unwrap_or(-1);
        info!("🎨 txt2img {}x{} seed={} prompt: {}", request.width, request.height, seed, truncate(&request.prompt, 100));

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "prompt": request.prompt,
                "negative_prompt": request.negative_prompt,
                "width": request.width,
                "height": request.height,
                "seed": seed,
                "steps": STEPS,
                "cfg_scale": GUIDANCE_SCALE,
                "batch_size": 1,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &headers, &body));
        }

        let parsed: Txt2ImgResponse = response.json().await?;
        let encoded = parsed
            .images
            .first()
            .ok_or_else(|| BackendError::InvalidResponse("no image data in response".into()))?;
        decode_image(encoded)
    }
}

#[derive(Debug, Deserialize)]
struct Txt2ImgResponse {
    #[serde(default)]
    images: Vec<String>,
}

/// Accepts bare base64 or a `data:image/...;base64,` URI.
fn decode_image(encoded: &str) -> BackendResult<RgbImage> {
    let payload = encoded.split_once(',').map_or(encoded, |(_, data)| data);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| BackendError::InvalidResponse(format!("bad base64 image: {e}")))?;
    Ok(image::load_from_memory(&bytes)?.to_rgb8())
}
