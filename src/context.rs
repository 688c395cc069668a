use std::sync::Arc;

use tracing::info;

use crate::backend::{
    ChunkedRemote, HuggingFaceApi, ImageBackend, ProceduralImageBackend, ProceduralSegmentBackend, ReplicateApi,
    StableDiffusionWebUi, VideoSource,
};
use crate::config::Config;
use crate::encoder::Ffmpeg;
use crate::hybrid::HybridGenerator;
use crate::pipeline::LocalPipeline;

/// Every backend handle the service uses, built once at start-up.
pub struct Backends {
    pub generator: Arc<HybridGenerator>,
}

impl Backends {
    pub fn from_config(config: &Config) -> Self {
        let ffmpeg = Arc::new(Ffmpeg::new(&config.ffmpeg_bin));

        let image: Arc<dyn ImageBackend> = match &config.local_sd_url {
            Some(url) => {
                info!("🖌️ Local keyframes via Stable Diffusion WebUI at {}", url);
                Arc::new(StableDiffusionWebUi::new(url.clone()))
            }
            None => {
                info!("🖌️ LOCAL_SD_URL not set, local keyframes are procedural");
                Arc::new(ProceduralImageBackend::new())
            }
        };
        let local = LocalPipeline::new(image, Arc::new(ProceduralSegmentBackend::default()), ffmpeg.clone())
            .with_crf(config.video_crf);

        if config.hf_token.is_none() {
            info!("HF_TOKEN not set, Hugging Face requests will fail until it is");
        }
        let huggingface = ChunkedRemote::new(
            Arc::new(HuggingFaceApi::new(config.hf_token.clone(), &config.hf_api_base, &config.hf_model)),
            config.remote_clip_seconds,
            &config.work_dir,
            ffmpeg.clone(),
        );
        let replicate = ChunkedRemote::new(
            Arc::new(ReplicateApi::new(
                config.replicate_token.clone(),
                &config.replicate_api_base,
                &config.replicate_model,
            )),
            config.remote_clip_seconds,
            &config.work_dir,
            ffmpeg,
        );

        let sources: Vec<Arc<dyn VideoSource>> = vec![Arc::new(local), Arc::new(huggingface), Arc::new(replicate)];
        let generator = HybridGenerator::new(sources, config.prefer_local)
            .with_loading_retry(config.loading_retries, config.loading_delay);

        Self { generator: Arc::new(generator) }
    }

    pub fn shutdown(&self) {
        info!("🧹 Releasing backend resources");
        self.generator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackendKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn wires_all_three_backends() {
        let backends = Backends::from_config(&Config::from_lookup(|_| None));
        assert_eq!(
            backends.generator.available(),
            vec![BackendKind::Local, BackendKind::HuggingFace, BackendKind::Replicate]
        );
        backends.shutdown();
    }
}
