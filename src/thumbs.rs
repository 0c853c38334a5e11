//! ALFA Photos Sync - Thumbnail Engine
//!
//! Produces the square JPEG thumbnail that is encrypted alongside each
//! imported original.

use std::io::Cursor;

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageFormat};

use crate::error::{VaultError, VaultResult};

/// Default thumbnail edge in pixels
pub const DEFAULT_THUMB_SIZE: u32 = 320;

/// Thumbnail generator
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailEngine {
    size: u32,
}

impl Default for ThumbnailEngine {
    fn default() -> Self {
        Self::new(DEFAULT_THUMB_SIZE)
    }
}

impl ThumbnailEngine {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Center-crop to a square, resize, encode as JPEG
    pub fn generate(&self, image_data: &[u8]) -> VaultResult<Vec<u8>> {
        let img = image::load_from_memory(image_data)?;
        let thumb = self.square(&img);

        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgb8(thumb.to_rgb8());
        let mut output = Vec::new();
        rgb.write_to(&mut Cursor::new(&mut output), ImageFormat::Jpeg)
            .map_err(|e| VaultError::Image(e.to_string()))?;
        Ok(output)
    }

    fn square(&self, img: &DynamicImage) -> DynamicImage {
        let (width, height) = img.dimensions();
        let (x, y, edge) = if width > height {
            ((width - height) / 2, 0, height)
        } else {
            (0, (height - width) / 2, width)
        };
        img.crop_imm(x, y, edge, edge)
            .resize_exact(self.size, self.size, FilterType::Lanczos3)
    }
}
