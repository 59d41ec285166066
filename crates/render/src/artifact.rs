//! Rendered page artifacts
//!
//! A [`Bitmap`] is the raw output of a renderer. An [`Artifact`] is a bitmap
//! tagged with the page and generation it was rendered from; it is the unit
//! stored in the page cache.

use crate::page::{Generation, PageId};
use image::codecs::png::PngEncoder;
use image::ImageEncoder;

/// Raw RGBA pixels (4 bytes per pixel, row-major)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Bitmap {
    /// Wrap a pixel buffer, checking that its length matches the dimensions
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = (width as usize).checked_mul(height as usize)?.checked_mul(4)?;
        (pixels.len() == expected).then_some(Self { width, height, pixels })
    }

    /// RGBA value of the pixel at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.pixels.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

/// A rendered page at a specific generation and scale
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub page_id: PageId,
    pub generation: Generation,
    pub width: u32,
    pub height: u32,
    pub scale: f32,
    pub pixels: Vec<u8>,
}

impl Artifact {
    pub fn from_bitmap(page_id: PageId, generation: Generation, scale: f32, bitmap: Bitmap) -> Self {
        Self {
            page_id,
            generation,
            width: bitmap.width,
            height: bitmap.height,
            scale,
            pixels: bitmap.pixels,
        }
    }

    /// Memory held by the pixel buffer in bytes
    pub fn size_bytes(&self) -> usize {
        self.pixels.len()
    }

    /// Check if every pixel is fully opaque
    pub fn is_opaque(&self) -> bool {
        self.pixels.chunks_exact(4).all(|rgba| rgba[3] == 255)
    }

    /// Encode the artifact as a PNG image
    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut out = Vec::new();
        PngEncoder::new(&mut out).write_image(
            &self.pixels,
            self.width,
            self.height,
            image::ExtendedColorType::Rgba8,
        )?;
        Ok(out)
    }
}
