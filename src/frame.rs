//! Decoded video frames.
//!
//! - `Frame`: one decoded image at the scaled resolution, cheap to clone.
//! - `PixelFormat`: byte layout of the pixel buffer (RGBA only for now).
//!
//! Pixel storage is shared (`Arc<[u8]>`), so fanning a frame out to the
//! detector input and the display output never copies pixels.

use anyhow::{anyhow, Result};
use image::RgbaImage;
use std::sync::Arc;
use std::time::Instant;

/// Byte layout of a frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8 bits per channel, R G B A order, row-major, no padding.
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
        }
    }

    /// Exact buffer length for a `width` x `height` image in this format.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// A decoded frame. Immutable once produced.
#[derive(Clone)]
pub struct Frame {
    pixels: Arc<[u8]>,
    width: u32,
    height: u32,
    format: PixelFormat,
    captured_at: Instant,
}

impl Frame {
    /// Wrap an RGBA buffer, rejecting buffers whose length does not match the dimensions.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = PixelFormat::Rgba8.frame_len(width, height);
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} rgba",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self::from_exact(width, height, pixels))
    }

    /// Build a frame from a buffer the caller already sized with `frame_len`.
    pub(crate) fn from_exact(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), PixelFormat::Rgba8.frame_len(width, height));
        Self {
            pixels: Arc::from(pixels),
            width,
            height,
            format: PixelFormat::Rgba8,
            captured_at: Instant::now(),
        }
    }

    /// Solid-colour frame, handy for tests and placeholders.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take(PixelFormat::Rgba8.frame_len(width, height))
            .collect();
        Self::from_exact(width, height, pixels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// When the frame's bytes were fully read from the decoder.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Copy into an `image` buffer for encoding or drawing.
    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels.to_vec())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}
