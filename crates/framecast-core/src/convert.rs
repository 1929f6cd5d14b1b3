//! BGRA → NV12 conversion (BT.601 limited range).
//!
//! Luma is computed for every pixel. Chroma is point-sampled from the top-left
//! pixel of each 2×2 block and written as interleaved U, V pairs after the luma
//! plane.

use crate::errors::FrameSizeError;
use crate::types::{PlaneBuffer, Resolution};

/// Convert a packed BGRA frame into a freshly allocated NV12 buffer.
///
/// `bgra` must hold exactly `width * height * 4` bytes and both dimensions
/// must be even and non-zero.
pub fn bgra_to_nv12(bgra: &[u8], width: u32, height: u32) -> Result<PlaneBuffer, FrameSizeError> {
    let res = Resolution::new(width, height);
    if res.is_unset() || !res.is_even() {
        return Err(FrameSizeError::Dimensions { width, height });
    }
    let expected = res.packed_len();
    if bgra.len() != expected {
        return Err(FrameSizeError::Length { expected, actual: bgra.len() });
    }

    let w = width as usize;
    let h = height as usize;
    let mut data = vec![0u8; res.planar_len()];
    let (y_plane, uv_plane) = data.split_at_mut(w * h);

    for (row, y_row) in y_plane.chunks_exact_mut(w).enumerate() {
        let src = &bgra[row * w * 4..(row + 1) * w * 4];
        for (dst, px) in y_row.iter_mut().zip(src.chunks_exact(4)) {
            *dst = luma(px[2], px[1], px[0]);
        }
    }

    for (block_row, uv_row) in uv_plane.chunks_exact_mut(w).enumerate() {
        let src = &bgra[block_row * 2 * w * 4..];
        for (block_col, uv) in uv_row.chunks_exact_mut(2).enumerate() {
            let i = block_col * 2 * 4;
            let (b, g, r) = (src[i], src[i + 1], src[i + 2]);
            uv[0] = chroma_u(r, g, b);
            uv[1] = chroma_v(r, g, b);
        }
    }

    Ok(PlaneBuffer { data, width, height })
}

#[inline]
fn clamp_round(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[inline]
fn luma(r: u8, g: u8, b: u8) -> u8 {
    clamp_round(0.257 * r as f32 + 0.504 * g as f32 + 0.098 * b as f32 + 16.0)
}

#[inline]
fn chroma_u(r: u8, g: u8, b: u8) -> u8 {
    clamp_round(-0.148 * r as f32 - 0.291 * g as f32 + 0.439 * b as f32 + 128.0)
}

#[inline]
fn chroma_v(r: u8, g: u8, b: u8) -> u8 {
    clamp_round(0.439 * r as f32 - 0.368 * g as f32 - 0.071 * b as f32 + 128.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, b: u8, g: u8, r: u8) -> Vec<u8> {
        [b, g, r, 255].repeat((w * h) as usize)
    }

    #[test]
    fn output_size_is_three_halves_of_pixels() {
        let planes = bgra_to_nv12(&solid(8, 4, 0, 0, 0), 8, 4).unwrap();
        assert_eq!(planes.data.len(), 8 * 4 * 3 / 2);
        assert_eq!(planes.luma().len(), 32);
        assert_eq!(planes.chroma().len(), 16);
    }

    #[test]
    fn mid_gray_is_neutral() {
        let planes = bgra_to_nv12(&solid(4, 4, 128, 128, 128), 4, 4).unwrap();
        for &y in planes.luma() {
            assert!((125..=127).contains(&y), "Y={y}");
        }
        for &c in planes.chroma() {
            assert_eq!(c, 128);
        }
    }

    #[test]
    fn black_and_white_hit_limited_range() {
        let black = bgra_to_nv12(&solid(2, 2, 0, 0, 0), 2, 2).unwrap();
        assert!(black.luma().iter().all(|&y| y == 16));
        assert_eq!(black.chroma(), &[128, 128]);

        let white = bgra_to_nv12(&solid(2, 2, 255, 255, 255), 2, 2).unwrap();
        assert!(white.luma().iter().all(|&y| y == 235));
        assert_eq!(white.chroma(), &[128, 128]);
    }

    #[test]
    fn pure_red_chroma() {
        let planes = bgra_to_nv12(&solid(2, 2, 0, 0, 255), 2, 2).unwrap();
        let (u, v) = (planes.chroma()[0], planes.chroma()[1]);
        assert!((89..=91).contains(&u), "U={u}");
        assert!((239..=241).contains(&v), "V={v}");
        assert_eq!(planes.luma()[0], 82);
    }

    #[test]
    fn chroma_sampled_from_top_left_of_block() {
        // 2×2 block: top-left blue, the rest white.
        let mut bgra = solid(2, 2, 255, 255, 255);
        bgra[..4].copy_from_slice(&[255, 0, 0, 255]);
        let planes = bgra_to_nv12(&bgra, 2, 2).unwrap();
        let (u, v) = (planes.chroma()[0], planes.chroma()[1]);
        assert!(u > 200, "U={u} should follow the blue pixel");
        assert!(v < 128, "V={v} should follow the blue pixel");
    }

    #[test]
    fn second_block_row_reads_from_row_two() {
        // 2×4 frame: rows 0-1 black, rows 2-3 red.
        let mut bgra = solid(2, 2, 0, 0, 0);
        bgra.extend(solid(2, 2, 0, 0, 255));
        let planes = bgra_to_nv12(&bgra, 2, 4).unwrap();
        assert_eq!(&planes.chroma()[..2], &[128, 128]);
        assert!(planes.chroma()[3] > 200);
    }

    #[test]
    fn rejects_length_mismatch() {
        let err = bgra_to_nv12(&[0u8; 15], 2, 2).unwrap_err();
        assert_eq!(err, FrameSizeError::Length { expected: 16, actual: 15 });
    }

    #[test]
    fn rejects_odd_or_zero_dimensions() {
        assert_eq!(
            bgra_to_nv12(&solid(3, 2, 0, 0, 0), 3, 2).unwrap_err(),
            FrameSizeError::Dimensions { width: 3, height: 2 }
        );
        assert!(bgra_to_nv12(&[], 0, 0).is_err());
    }
}
