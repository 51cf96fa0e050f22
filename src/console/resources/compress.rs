//! Image compression before upload
//!
//! Bytes that decode as an image are scaled down so the longest edge fits
//! `max_dimension` and re-encoded as JPEG. Anything else uploads unchanged.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

/// Bytes ready for upload
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Compress `bytes` if they are an image
pub fn prepare(bytes: Bytes, content_type: &str, max_dimension: u32, quality: u8) -> Prepared {
    let passthrough = |bytes: Bytes| Prepared {
        bytes,
        content_type: content_type.to_string(),
    };

    let img = match image::load_from_memory(&bytes) {
        Ok(img) => img,
        Err(_) => return passthrough(bytes),
    };

    let oversized = img.width() > max_dimension || img.height() > max_dimension;
    let img = if oversized {
        img.resize(max_dimension, max_dimension, FilterType::Triangle)
    } else {
        img
    };

    match encode_jpeg(&img, quality) {
        Ok(encoded) if oversized || encoded.len() < bytes.len() => {
            tracing::debug!(
                "[RESOURCES] Compressed {}KB -> {}KB ({}x{})",
                bytes.len() / 1024,
                encoded.len() / 1024,
                img.width(),
                img.height()
            );
            Prepared {
                bytes: Bytes::from(encoded),
                content_type: "image/jpeg".to_string(),
            }
        }
        Ok(_) => passthrough(bytes),
        Err(e) => {
            tracing::warn!("[RESOURCES] JPEG encode failed, uploading original: {}", e);
            passthrough(bytes)
        }
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut out = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)))?;
    Ok(out)
}
