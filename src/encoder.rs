//! Container encoding through an external `ffmpeg` binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{BackendError, BackendResult};
use crate::frame::FrameStream;

/// Quality is a CRF value; lower is better, 18 is visually lossless.
#[async_trait]
pub trait FrameEncoder: Send + Sync {
    async fn encode(&self, frames: &FrameStream, fps: u32, quality: u8, output: &Path) -> BackendResult<PathBuf>;
}

/// Joins already encoded clips without re-encoding.
#[async_trait]
pub trait ClipConcatenator: Send + Sync {
    async fn concat(&self, clips: &[PathBuf], output: &Path) -> BackendResult<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    bin: PathBuf,
}

impl Ffmpeg {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    fn encode_args(width: u32, height: u32, fps: u32, quality: u8, output: &Path) -> Vec<String> {
        let crf = quality.min(51);
        [
            "-y", "-loglevel", "error",
            "-f", "rawvideo", "-pix_fmt", "rgb24",
            "-s",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([format!("{width}x{height}"), "-r".into(), fps.to_string(), "-i".into(), "-".into()])
        .chain(
            [
                "-an", "-c:v", "libx264", "-preset", "medium",
                // yuv420p needs even dimensions.
                "-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2",
                "-pix_fmt", "yuv420p", "-movflags", "+faststart",
                "-crf",
            ]
            .iter()
            .map(|s| s.to_string()),
        )
        .chain([crf.to_string(), output.to_string_lossy().into_owned()])
        .collect()
    }

    fn spawn_error(&self, e: std::io::Error) -> BackendError {
        BackendError::Encoder(format!("failed to run {}: {}", self.bin.display(), e))
    }

    async fn encode_frames(&self, frames: &FrameStream, fps: u32, quality: u8, output: &Path) -> BackendResult<()> {
        let Some((width, height)) = frames.dimensions() else {
            return Err(BackendError::Encoder("no frames to encode".into()));
        };
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!("🎬 Encoding {} frames {}x{} @ {}fps -> {}", frames.len(), width, height, fps, output.display());

        let mut child = Command::new(&self.bin)
            .args(Self::encode_args(width, height, fps, quality, output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Encoder("ffmpeg stdin unavailable".into()))?;
        let write = async move {
            for frame in frames {
                stdin.write_all(frame.as_raw()).await?;
            }
            stdin.shutdown().await
        };
        let (written, finished) = tokio::join!(write, child.wait_with_output());
        let finished = finished?;

        if !finished.status.success() {
            let stderr = String::from_utf8_lossy(&finished.stderr);
            return Err(BackendError::Encoder(format!("ffmpeg encode failed: {}", stderr.trim())));
        }
        written.map_err(|e| BackendError::Encoder(format!("writing frames to ffmpeg: {e}")))
    }

    async fn concat_clips(&self, clips: &[PathBuf], output: &Path) -> BackendResult<()> {
        let mut list = String::new();
        for clip in clips {
            let abs = tokio::fs::canonicalize(clip).await?;
            list.push_str(&format!("file '{}'\n", abs.display().to_string().replace('\'', "'\\''")));
        }
        let list_file = output.with_extension("concat.txt");
        tokio::fs::write(&list_file, list).await?;

        let result = Command::new(&self.bin)
            .args(["-y", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_file)
            .args(["-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .output()
            .await;

        if let Err(e) = tokio::fs::remove_file(&list_file).await {
            warn!("Could not remove {}: {}", list_file.display(), e);
        }

        let result = result.map_err(|e| self.spawn_error(e))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(BackendError::Encoder(format!("ffmpeg concat failed: {}", stderr.trim())));
        }
        Ok(())
    }
}

/// A failed run must not leave a truncated file at the advertised path.
async fn discard_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => warn!("🗑️ Removed partial output {}", output.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial output {}: {}", output.display(), e),
    }
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl FrameEncoder for Ffmpeg {
    async fn encode(&self, frames: &FrameStream, fps: u32, quality: u8, output: &Path) -> BackendResult<PathBuf> {
        if let Err(e) = self.encode_frames(frames, fps, quality, output).await {
            discard_partial(output).await;
            return Err(e);
        }
        info!("✅ Encoded video: {}", output.display());
        Ok(output.to_path_buf())
    }
}

#[async_trait]
impl ClipConcatenator for Ffmpeg {
    async fn concat(&self, clips: &[PathBuf], output: &Path) -> BackendResult<PathBuf> {
        if clips.is_empty() {
            return Err(BackendError::Encoder("no clips to concatenate".into()));
        }
        info!("🔗 Concatenating {} clips -> {}", clips.len(), output.display());
        if let Err(e) = self.concat_clips(clips, output).await {
            discard_partial(output).await;
            return Err(e);
        }
        Ok(output.to_path_buf())
    }
}

/// Stand-in `ffmpeg` that writes a stub to its last argument and exits 1.
#[cfg(all(test, unix))]
pub(crate) fn failing_ffmpeg(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join("ffmpeg-fails.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\nfor arg; do last=\"$arg\"; done\necho partial > \"$last\"\necho 'disk full' >&2\nexit 1\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use pretty_assertions::assert_eq;

    #[test]
    fn encode_args_clamp_crf() {
        let args = Ffmpeg::encode_args(64, 48, 30, 80, Path::new("out/a.mp4"));
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("-s") + 1], "64x48");
        assert_eq!(args[pos("-r") + 1], "30");
        assert_eq!(args[pos("-crf") + 1], "51");
        assert_eq!(args.last().unwrap(), "out/a.mp4");
    }

    #[tokio::test]
    async fn empty_stream_is_an_encoder_error() {
        let err = Ffmpeg::default()
            .encode(&FrameStream::new(), 30, 18, Path::new("x.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Encoder(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_an_encoder_error() {
        let dir = tempfile::tempdir().unwrap();
        let frames = FrameStream::from_frames(vec![RgbImage::new(4, 4)]).unwrap();
        let err = Ffmpeg::new("/nonexistent/ffmpeg-binary")
            .encode(&frames, 30, 18, &dir.path().join("a.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Encoder(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_encode_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let frames = FrameStream::from_frames(vec![RgbImage::new(4, 4); 2]).unwrap();

        let err = Ffmpeg::new(failing_ffmpeg(dir.path())).encode(&frames, 30, 18, &output).await.unwrap_err();

        assert!(err.to_string().contains("disk full"), "{err}");
        assert!(!output.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_concat_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let clips = vec![dir.path().join("a.mp4"), dir.path().join("b.mp4")];
        for clip in &clips {
            std::fs::write(clip, b"clip").unwrap();
        }
        let output = dir.path().join("joined.mp4");

        let err = Ffmpeg::new(failing_ffmpeg(dir.path())).concat(&clips, &output).await.unwrap_err();

        assert!(err.to_string().contains("ffmpeg concat failed"), "{err}");
        assert!(!output.exists());
        assert!(!output.with_extension("concat.txt").exists());
    }

    #[tokio::test]
    async fn concat_needs_clips() {
        let err = Ffmpeg::default().concat(&[], Path::new("x.mp4")).await.unwrap_err();
        assert!(matches!(err, BackendError::Encoder(_)));
    }
}
