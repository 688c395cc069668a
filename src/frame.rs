use image::RgbImage;

use crate::error::FrameError;

/// Ordered frames sharing one size. Append-only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStream {
    frames: Vec<RgbImage>,
}

impl FrameStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self { frames: Vec::with_capacity(n) }
    }

    pub fn from_frames(frames: Vec<RgbImage>) -> Result<Self, FrameError> {
        let mut stream = Self::with_capacity(frames.len());
        stream.extend(frames)?;
        Ok(stream)
    }

    pub fn push(&mut self, frame: RgbImage) -> Result<(), FrameError> {
        if let Some((want_w, want_h)) = self.dimensions() {
            let (got_w, got_h) = frame.dimensions();
            if (got_w, got_h) != (want_w, want_h) {
                return Err(FrameError::SizeMismatch { want_w, want_h, got_w, got_h });
            }
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn extend<I: IntoIterator<Item = RgbImage>>(&mut self, frames: I) -> Result<(), FrameError> {
        frames.into_iter().try_for_each(|f| self.push(f))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// `(width, height)` of every frame, `None` while empty.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.frames.first().map(|f| f.dimensions())
    }

    pub fn get(&self, index: usize) -> Option<&RgbImage> {
        self.frames.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RgbImage> {
        self.frames.iter()
    }

    pub fn as_slice(&self) -> &[RgbImage] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<RgbImage> {
        self.frames
    }

    /// Applies `f` to every frame, producing a new stream.
    pub fn map_frames<F>(&self, f: F) -> Result<Self, FrameError>
    where
        F: FnMut(&RgbImage) -> RgbImage,
    {
        Self::from_frames(self.frames.iter().map(f).collect())
    }
}

impl std::ops::Index<usize> for FrameStream {
    type Output = RgbImage;

    fn index(&self, index: usize) -> &RgbImage {
        &self.frames[index]
    }
}

impl<'a> IntoIterator for &'a FrameStream {
    type Item = &'a RgbImage;
    type IntoIter = std::slice::Iter<'a, RgbImage>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}
