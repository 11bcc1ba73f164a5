use crate::core::models::BoundingBox;
use crate::error::{PipelineError, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::fs;
use std::io::Cursor;
use std::path::Path;

/// Decode an image, guessing the format from content rather than extension.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| PipelineError::data_integrity(path.display().to_string(), e))
}

/// Decode in-memory bytes; used to validate downloads before they hit disk.
pub fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()
        .map_err(|e| PipelineError::data_integrity("<download>", e))
}

/// Width and height both inside the inclusive `[min, max]` bounds.
pub fn dimensions_within(img: &DynamicImage, min: (u32, u32), max: (u32, u32)) -> bool {
    let (width, height) = img.dimensions();
    width >= min.0 && height >= min.1 && width <= max.0 && height <= max.1
}

/// Crop `bbox` padded by `padding` of its size, clamped to the image.
pub fn crop_face(img: &DynamicImage, bbox: &BoundingBox, padding: f32) -> Option<DynamicImage> {
    let (width, height) = img.dimensions();
    let (x, y, w, h) = bbox.padded_crop(padding, width, height)?;
    Some(img.crop_imm(x, y, w, h))
}

pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut bytes = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, quality);
    rgb.write_with_encoder(encoder)?;
    Ok(bytes)
}

/// Re-encode as JPEG, optionally resized to a `size` x `size` square.
pub fn save_jpeg(img: &DynamicImage, path: &Path, quality: u8, size: Option<u32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = match size {
        Some(size) if img.dimensions() != (size, size) => {
            encode_jpeg(&img.resize_exact(size, size, FilterType::Lanczos3), quality)?
        }
        _ => encode_jpeg(img, quality)?,
    };
    fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            let intensity = ((x + y) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        }))
    }

    #[test]
    fn test_save_jpeg_resizes_to_square() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out").join("00001.jpg");

        save_jpeg(&test_image(300, 200), &path, 95, Some(256)).unwrap();

        let saved = load_image(&path).unwrap();
        assert_eq!(saved.dimensions(), (256, 256));
    }

    #[test]
    fn test_save_jpeg_keeps_size_when_unset() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keep.jpg");
        save_jpeg(&test_image(120, 80), &path, 90, None).unwrap();
        assert_eq!(load_image(&path).unwrap().dimensions(), (120, 80));
    }

    #[test]
    fn test_decode_bytes_and_dimension_bounds() {
        let bytes = encode_jpeg(&test_image(200, 160), 90).unwrap();
        let img = decode_bytes(&bytes).unwrap();
        assert!(dimensions_within(&img, (150, 150), (4000, 4000)));
        assert!(!dimensions_within(&img, (150, 170), (4000, 4000)));
        assert!(decode_bytes(b"garbage").is_err());
    }

    #[test]
    fn test_crop_face_clamps() {
        let img = test_image(100, 100);
        let bbox = BoundingBox {
            x1: 80.0,
            y1: 80.0,
            x2: 120.0,
            y2: 120.0,
        };
        let crop = crop_face(&img, &bbox, 0.1).unwrap();
        assert_eq!(crop.dimensions(), (24, 24));
    }
}
