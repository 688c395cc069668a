//! Frame-level enhancement applied after interpolation.
//!
//! Stages always run in the same order: upscale, color grade, sharpen, then the
//! optional stabilization and letterbox bars. Each stage borrows the stream and
//! returns a new one; a run where every stage is a no-op hands back the input.

use std::borrow::Cow;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::FrameError;
use crate::frame::FrameStream;

pub mod color;
pub mod sharpen;
pub mod stabilize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostProcessOptions {
    pub upscale: bool,
    pub color_grade: bool,
    pub sharpen: bool,
    pub stabilize: bool,
    pub cinematic_bars: Option<CinematicAspect>,
}

impl Default for PostProcessOptions {
    fn default() -> Self {
        Self {
            upscale: true,
            color_grade: true,
            sharpen: true,
            stabilize: false,
            cinematic_bars: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CinematicAspect {
    #[serde(rename = "2.39:1")]
    Scope,
    #[serde(rename = "21:9")]
    UltraWide,
}

impl CinematicAspect {
    /// Height of each bar as a fraction of the frame height.
    pub fn bar_fraction(self) -> f32 {
        match self {
            Self::Scope => 0.10,
            Self::UltraWide => 0.08,
        }
    }
}

pub struct PostProcessor {
    target: (u32, u32),
}

impl PostProcessor {
    pub fn new(width: u32, height: u32) -> Self {
        Self { target: (width, height) }
    }

    pub fn process<'a>(
        &self,
        frames: &'a FrameStream,
        options: &PostProcessOptions,
    ) -> Result<Cow<'a, FrameStream>, FrameError> {
        info!("✨ Post-processing {} frames ({:?})", frames.len(), options);
        let mut current = Cow::Borrowed(frames);

        if options.upscale && current.dimensions().is_some_and(|dims| dims != self.target) {
            current = Cow::Owned(upscale(&current, self.target.0, self.target.1)?);
        }
        if options.color_grade {
            debug!("color grading");
            current = Cow::Owned(current.map_frames(color::grade)?);
        }
        if options.sharpen {
            debug!("sharpening");
            current = Cow::Owned(current.map_frames(sharpen::sharpen)?);
        }
        if options.stabilize {
            debug!("stabilizing");
            current = Cow::Owned(stabilize::stabilize(&current));
        }
        if let Some(aspect) = options.cinematic_bars {
            current = Cow::Owned(cinematic_bars(&current, aspect)?);
        }
        Ok(current)
    }
}

/// Lanczos resize of every frame; a no-op when the size already matches.
pub fn upscale(frames: &FrameStream, width: u32, height: u32) -> Result<FrameStream, FrameError> {
    match frames.dimensions() {
        None => Ok(FrameStream::new()),
        Some(dims) if dims == (width, height) => Ok(frames.clone()),
        Some((w, h)) => {
            debug!("upscaling {}x{} -> {}x{}", w, h, width, height);
            frames.map_frames(|f| imageops::resize(f, width, height, FilterType::Lanczos3))
        }
    }
}

/// Paints black bars over the top and bottom; frame size is unchanged.
pub fn cinematic_bars(frames: &FrameStream, aspect: CinematicAspect) -> Result<FrameStream, FrameError> {
    frames.map_frames(|f| {
        let mut out = f.clone();
        let bar = ((f.height() as f32 * aspect.bar_fraction()).round() as u32).min(f.height() / 2);
        for y in (0..bar).chain(f.height() - bar..f.height()) {
            for x in 0..f.width() {
                out.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        out
    })
}

/// `count` frames spread evenly from first to last; shorter streams come back whole.
pub fn create_preview(frames: &FrameStream, count: usize) -> Vec<RgbImage> {
    let len = frames.len();
    if len <= count {
        return frames.iter().cloned().collect();
    }
    match count {
        0 => Vec::new(),
        1 => vec![frames[0].clone()],
        _ => (0..count).map(|i| frames[i * (len - 1) / (count - 1)].clone()).collect(),
    }
}

/// Thumbnails `thumb_width` wide, laid out left to right.
pub fn contact_sheet(frames: &[RgbImage], thumb_width: u32) -> Option<RgbImage> {
    let first = frames.first()?;
    let thumb_width = thumb_width.max(1);
    let thumb_height = (u64::from(first.height()) * u64::from(thumb_width) / u64::from(first.width().max(1))).max(1) as u32;
    let mut sheet = RgbImage::new(thumb_width * frames.len() as u32, thumb_height);
    for (i, frame) in frames.iter().enumerate() {
        let thumb = imageops::resize(frame, thumb_width, thumb_height, FilterType::Triangle);
        imageops::replace(&mut sheet, &thumb, i as i64 * i64::from(thumb_width), 0);
    }
    Some(sheet)
}

/// Mirror index without repeating the edge pixel (`dcb|abcd|cba`).
pub(crate) fn reflect101(i: i64, n: u32) -> u32 {
    if n <= 1 {
        return 0;
    }
    let last = n as i64 - 1;
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i > last {
        i = 2 * last - i;
    }
    i.clamp(0, last) as u32
}

pub(crate) fn clamp_u8(v: f32) -> u8 {
    v.clamp(0.0, 255.0) as u8
}

#[cfg(test)]
pub(crate) fn test_frame(w: u32, h: u32) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| Rgb([(x * 37 % 256) as u8, (y * 53 % 256) as u8, ((x + y) * 11 % 256) as u8]))
}
