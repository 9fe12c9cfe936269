//! Image attachment compression.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use tracing::debug;

use crate::error::{ChatError, Result};

pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_WIDTH: u32 = 800;
pub const JPEG_QUALITY: u8 = 50;

/// Downscale to at most [`MAX_WIDTH`] and re-encode as a JPEG data URL.
pub fn compress_image(bytes: &[u8]) -> Result<String> {
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(ChatError::Validation("Image is larger than 5 MB".to_string()));
    }

    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ChatError::Image(format!("Cannot decode image: {}", e)))?;

    let resized = if decoded.width() > MAX_WIDTH {
        let height = scaled_height(decoded.width(), decoded.height());
        decoded.resize_exact(MAX_WIDTH, height, FilterType::Triangle)
    } else {
        decoded
    };

    // JPEG has no alpha channel
    let rgb = resized.to_rgb8();
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| ChatError::Image(format!("Cannot encode image: {}", e)))?;

    debug!(
        input = bytes.len(),
        output = encoded.len(),
        width = rgb.width(),
        height = rgb.height(),
        "Compressed image"
    );
    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(&encoded)))
}

fn scaled_height(width: u32, height: u32) -> u32 {
    let scaled = (height as u64 * MAX_WIDTH as u64 + width as u64 / 2) / width as u64;
    scaled.max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, RgbaImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            image::Rgba([200, 40, 90, 128]),
        ));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png).unwrap();
        out
    }

    fn decode_data_url(url: &str) -> DynamicImage {
        let encoded = url.strip_prefix("data:image/jpeg;base64,").unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        image::load_from_memory(&bytes).unwrap()
    }

    #[test]
    fn test_wide_image_is_downscaled() {
        let url = compress_image(&png(1600, 900)).unwrap();
        let out = decode_data_url(&url);
        assert_eq!(out.width(), 800);
        assert_eq!(out.height(), 450);
    }

    #[test]
    fn test_small_image_is_not_upscaled() {
        let url = compress_image(&png(320, 200)).unwrap();
        let out = decode_data_url(&url);
        assert_eq!((out.width(), out.height()), (320, 200));
    }

    #[test]
    fn test_rejects_oversized_input() {
        let big = vec![0u8; MAX_UPLOAD_BYTES + 1];
        assert!(matches!(compress_image(&big), Err(ChatError::Validation(_))));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            compress_image(b"definitely not an image"),
            Err(ChatError::Image(_))
        ));
    }

    #[test]
    fn test_scaled_height_keeps_aspect() {
        assert_eq!(scaled_height(1000, 500), 400);
        assert_eq!(scaled_height(4000, 1), 1);
    }
}
