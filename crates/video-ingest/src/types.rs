use std::fmt;

use anyhow::Error;
use chrono::Utc;
use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage, imageops};
use thiserror::Error;

/// Raw BGR frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

impl Frame {
    /// Wrap a packed BGR buffer, stamping it with the current wall clock.
    pub fn from_bgr(data: Vec<u8>, width: i32, height: i32) -> Result<Self, CaptureError> {
        let expected = (width.max(0) as usize) * (height.max(0) as usize) * 3;
        if width <= 0 || height <= 0 || data.len() != expected {
            return Err(CaptureError::Malformed {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    /// Solid-colour frame, mostly useful for synthetic sources.
    pub fn filled(width: i32, height: i32, bgr: [u8; 3]) -> Self {
        let pixels = (width.max(0) as usize) * (height.max(0) as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&bgr);
        }
        Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }
    }

    /// Borrow the packed pixels as an image buffer. Channel order stays BGR.
    fn as_buffer(&self) -> Option<ImageBuffer<Rgb<u8>, &[u8]>> {
        ImageBuffer::from_raw(self.width as u32, self.height as u32, self.data.as_slice())
    }

    /// Return a copy scaled to `width`x`height`, or `self` unchanged when the size already matches.
    pub fn resized(self, width: i32, height: i32) -> Result<Self, CaptureError> {
        if self.width == width && self.height == height {
            return Ok(self);
        }
        let buffer = self.as_buffer().ok_or(CaptureError::Malformed {
            width: self.width,
            height: self.height,
            len: self.data.len(),
        })?;
        let scaled = imageops::resize(
            &buffer,
            width as u32,
            height as u32,
            imageops::FilterType::Triangle,
        );
        Ok(Self {
            data: scaled.into_raw(),
            width,
            height,
            timestamp_ms: self.timestamp_ms,
            format: self.format,
        })
    }

    /// Convert to an RGB image for drawing and encoding.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        let mut rgb = Vec::with_capacity(self.data.len());
        for chunk in self.data.chunks_exact(3) {
            rgb.push(chunk[2]);
            rgb.push(chunk[1]);
            rgb.push(chunk[0]);
        }
        RgbImage::from_raw(self.width as u32, self.height as u32, rgb)
    }

    /// Single-channel luma (BT.601 weights) for motion estimation.
    pub fn to_gray_image(&self) -> Option<GrayImage> {
        let buffer = self.as_buffer()?;
        Some(GrayImage::from_fn(buffer.width(), buffer.height(), |x, y| {
            let [b, g, r] = buffer.get_pixel(x, y).0;
            let luma = 0.114 * b as f32 + 0.587 * g as f32 + 0.299 * r as f32;
            Luma([luma.round().clamp(0.0, 255.0) as u8])
        }))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("failed to read frame from {uri:?}")]
    Read { uri: String },
    #[error("video source {uri:?} is not open")]
    NotOpen { uri: String },
    #[error("frame buffer of {len} bytes does not match {width}x{height} bgr8")]
    Malformed { width: i32, height: i32, len: usize },
    #[error(transparent)]
    Other(#[from] Error),
}
