//! Watermark compositing.
//!
//! The watermark is scaled to a fraction of the base width (aspect ratio
//! kept) and placed bottom-center with padding proportional to the base
//! height. Any failure leaves the base image untouched.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat};
use thiserror::Error;

use crate::config::OverlayConfig;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Watermark asset not found: {0}")]
    MissingAsset(PathBuf),

    #[error("Failed to read watermark asset: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Clone)]
pub struct Overlay {
    asset_path: PathBuf,
    width_ratio: f32,
    padding_ratio: f32,
}

impl From<&OverlayConfig> for Overlay {
    fn from(config: &OverlayConfig) -> Self {
        Self {
            asset_path: config.asset_path.clone(),
            width_ratio: config.width_ratio,
            padding_ratio: config.padding_ratio,
        }
    }
}

impl Overlay {
    pub fn new(asset_path: impl Into<PathBuf>, width_ratio: f32, padding_ratio: f32) -> Self {
        Self {
            asset_path: asset_path.into(),
            width_ratio,
            padding_ratio,
        }
    }

    pub fn asset_path(&self) -> &Path {
        &self.asset_path
    }

    /// Composite the watermark onto `base`, returning PNG bytes.
    /// Returns `base` unchanged when the asset is missing or either image
    /// cannot be processed.
    pub fn apply(&self, base: &[u8]) -> Vec<u8> {
        match self.try_apply(base) {
            Ok(bytes) => bytes,
            Err(OverlayError::MissingAsset(path)) => {
                tracing::warn!(asset = %path.display(), "Watermark asset missing, storing image as-is");
                base.to_vec()
            }
            Err(err) => {
                tracing::warn!(error = %err, "Watermark overlay failed, storing image as-is");
                base.to_vec()
            }
        }
    }

    pub fn try_apply(&self, base: &[u8]) -> Result<Vec<u8>, OverlayError> {
        let asset = match std::fs::read(&self.asset_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OverlayError::MissingAsset(self.asset_path.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        let mut canvas = image::load_from_memory(base)?.to_rgba8();
        let mark = image::load_from_memory(&asset)?;

        let (base_w, base_h) = canvas.dimensions();
        let (mark_w, mark_h) = scaled_size(base_w, mark.width(), mark.height(), self.width_ratio);
        let mark = mark
            .resize_exact(mark_w, mark_h, FilterType::Lanczos3)
            .to_rgba8();

        let padding = (base_h as f32 * self.padding_ratio).round() as i64;
        let x = (base_w as i64 - mark_w as i64) / 2;
        let y = (base_h as i64 - mark_h as i64 - padding).max(0);
        imageops::overlay(&mut canvas, &mark, x, y);

        let mut out = Vec::new();
        DynamicImage::ImageRgba8(canvas).write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
        tracing::debug!(width = base_w, height = base_h, mark_w, mark_h, x, y, "Watermark applied");
        Ok(out)
    }
}

/// Watermark size for a base of width `base_w`, at least 1x1.
fn scaled_size(base_w: u32, mark_w: u32, mark_h: u32, width_ratio: f32) -> (u32, u32) {
    let target_w = ((base_w as f32 * width_ratio).round() as u32).clamp(1, base_w.max(1));
    let target_h = if mark_w == 0 {
        1
    } else {
        ((mark_h as f64 * target_w as f64 / mark_w as f64).round() as u32).max(1)
    };
    (target_w, target_h)
}

/// MIME type sniffed from image bytes, PNG when unknown.
pub fn guess_mime(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("image/png")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(color));
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn missing_asset_returns_base_bytes() {
        let temp = tempfile::tempdir().unwrap();
        let overlay = Overlay::new(temp.path().join("nope.png"), 0.3, 0.03);
        let base = png(40, 60, [0, 0, 255, 255]);

        assert!(matches!(
            overlay.try_apply(&base),
            Err(OverlayError::MissingAsset(_))
        ));
        assert_eq!(overlay.apply(&base), base);
    }

    #[test]
    fn undecodable_base_is_passed_through() {
        let temp = tempfile::tempdir().unwrap();
        let asset = temp.path().join("mark.png");
        std::fs::write(&asset, png(10, 5, [255, 0, 0, 255])).unwrap();

        let overlay = Overlay::new(&asset, 0.3, 0.03);
        let base = b"definitely not an image".to_vec();
        assert_eq!(overlay.apply(&base), base);
    }

    #[test]
    fn watermark_lands_bottom_center() {
        let temp = tempfile::tempdir().unwrap();
        let asset = temp.path().join("mark.png");
        std::fs::write(&asset, png(10, 5, [255, 0, 0, 255])).unwrap();

        let overlay = Overlay::new(&asset, 0.5, 0.1);
        let base = png(100, 200, [0, 0, 255, 255]);
        let out = overlay.apply(&base);
        assert_ne!(out, base);

        let result = image::load_from_memory(&out).unwrap().to_rgba8();
        assert_eq!(result.dimensions(), (100, 200));

        // Mark is 50x25 at x=25, y=200-25-20=155.
        let center = result.get_pixel(50, 165);
        assert!(center[0] > 200 && center[2] < 50, "expected red, got {:?}", center);
        assert_eq!(*result.get_pixel(5, 165), Rgba([0, 0, 255, 255]));
        assert_eq!(*result.get_pixel(50, 195), Rgba([0, 0, 255, 255]));
        assert_eq!(*result.get_pixel(50, 10), Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn scaled_size_keeps_aspect_ratio() {
        assert_eq!(scaled_size(1000, 200, 100, 0.3), (300, 150));
        assert_eq!(scaled_size(10, 200, 100, 0.01), (1, 1));
    }

    #[test]
    fn guesses_mime_from_magic_bytes() {
        assert_eq!(guess_mime(&png(2, 2, [0, 0, 0, 255])), "image/png");
        assert_eq!(guess_mime(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), "image/jpeg");
        assert_eq!(guess_mime(b"????"), "image/png");
    }
}
