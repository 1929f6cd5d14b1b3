//! Still-image compression for the bitmap-copy path.

use framecast_core::{CaptureError, Resolution};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb};

/// Compress a packed BGRA frame to JPEG at `quality` (1-100, clamped).
pub fn compress_bgra(bgra: &[u8], size: Resolution, quality: u8) -> Result<Vec<u8>, CaptureError> {
    if bgra.len() != size.packed_len() {
        return Err(CaptureError::CompressionFailed {
            reason: format!("expected {} bytes for {size}, got {}", size.packed_len(), bgra.len()),
        });
    }

    let rgb: Vec<u8> = bgra
        .chunks_exact(4)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    let img: ImageBuffer<Rgb<u8>, _> = ImageBuffer::from_raw(size.width, size.height, rgb)
        .ok_or_else(|| CaptureError::CompressionFailed { reason: format!("invalid buffer for {size}") })?;

    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    img.write_with_encoder(encoder)
        .map_err(|e| CaptureError::CompressionFailed { reason: e.to_string() })?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// BGRA gradient test image.
    fn make_test_bgra(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[128, (y % 256) as u8, (x % 256) as u8, 255]);
            }
        }
        data
    }

    #[test]
    fn produces_jpeg_magic() {
        let size = Resolution::new(320, 240);
        let jpeg = compress_bgra(&make_test_bgra(320, 240), size, 75).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn lower_quality_produces_smaller_output() {
        let size = Resolution::new(640, 480);
        let bgra = make_test_bgra(640, 480);
        let high = compress_bgra(&bgra, size, 90).unwrap();
        let low = compress_bgra(&bgra, size, 40).unwrap();
        assert!(
            low.len() < high.len(),
            "quality 40 ({}) should be smaller than quality 90 ({})",
            low.len(),
            high.len()
        );
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let err = compress_bgra(&[0u8; 12], Resolution::new(2, 2), 75).unwrap_err();
        assert!(matches!(err, CaptureError::CompressionFailed { .. }));
    }
}
