use bytes::Bytes;
use serde::{Deserialize, Serialize};

// MARK: - Resolution

/// Width × height of a capture region or encoded stream, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self { width: 1280, height: 720 };
    pub const FHD: Self = Self { width: 1920, height: 1080 };
    pub const UHD: Self = Self { width: 3840, height: 2160 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// `true` when either dimension is zero ("use the native desktop size").
    pub fn is_unset(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Bytes in a packed 4-byte-per-pixel frame of this size.
    pub fn packed_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Bytes in an NV12 (4:2:0) plane buffer of this size.
    pub fn planar_len(&self) -> usize {
        self.width as usize * self.height as usize * 3 / 2
    }

    /// Round both dimensions down to the nearest even value.
    pub fn even_aligned(&self) -> Self {
        Self { width: self.width & !1, height: self.height & !1 }
    }

    pub fn is_even(&self) -> bool {
        self.width % 2 == 0 && self.height % 2 == 0
    }

    /// Clamp each dimension so the region fits inside `bounds`.
    pub fn clamped_to(&self, bounds: Resolution) -> Self {
        Self {
            width: self.width.min(bounds.width),
            height: self.height.min(bounds.height),
        }
    }

    /// Scale both dimensions by `factor`, never going below 1×1.
    pub fn scaled(&self, factor: f32) -> Self {
        let scale = |v: u32| ((v as f32 * factor) as u32).max(1);
        Self { width: scale(self.width), height: scale(self.height) }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - PixelFormat

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha/unused.
    Bgra,
    /// Full-resolution luma plane followed by an interleaved U/V plane at quarter resolution.
    Nv12,
}

// MARK: - FrameBuffer

/// One captured desktop frame, packed BGRA, rows compacted to `width * 4` bytes.
///
/// Only valid for the staging surface generation it was captured from; once the
/// capture dimensions change, buffers from older generations must be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Platform presentation timestamp (performance-counter ticks on Windows).
    pub present_time: i64,
    /// Staging surface generation this frame was copied through.
    pub generation: u64,
}

impl FrameBuffer {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// MARK: - PlaneBuffer

/// NV12 samples derived from a [`FrameBuffer`]; consumed immediately by the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PlaneBuffer {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn luma(&self) -> &[u8] {
        &self.data[..self.luma_len()]
    }

    /// Interleaved U/V samples, one pair per 2×2 block.
    pub fn chroma(&self) -> &[u8] {
        &self.data[self.luma_len()..]
    }

    fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

// MARK: - EncodedPacket

/// Ticks per second of the transform timebase (100 ns units).
pub const TRANSFORM_TICKS_PER_SECOND: i64 = 10_000_000;

/// One H.264 access unit emitted by the encode transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Bytes,
    /// Presentation time in transform ticks (not wall-clock).
    pub pts: i64,
    /// Duration in transform ticks.
    pub duration: i64,
    pub is_keyframe: bool,
}

// MARK: - Facade enums

/// Which capture mechanism feeds the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureMethod {
    /// GPU output duplication (DXGI on Windows, X11 image source elsewhere).
    Duplication,
    /// Whole-screen compatible bitmap copy, compressed to still images.
    BitmapCopy,
}

impl std::fmt::Display for CaptureMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplication => write!(f, "duplication"),
            Self::BitmapCopy => write!(f, "bitmap copy"),
        }
    }
}

/// Format of the bytes handed back by `capture_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    /// H.264 elementary stream access unit.
    H264,
    /// Raw packed BGRA.
    Bgra,
    /// JPEG still image from the bitmap-copy path.
    Jpeg,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_helpers() {
        let r = Resolution::new(1921, 1081);
        assert_eq!(r.even_aligned(), Resolution::new(1920, 1080));
        assert!(!r.is_even());
        assert_eq!(Resolution::FHD.packed_len(), 1920 * 1080 * 4);
        assert_eq!(Resolution::FHD.planar_len(), 1920 * 1080 * 3 / 2);
        assert_eq!(
            Resolution::new(4000, 500).clamped_to(Resolution::FHD),
            Resolution::new(1920, 500)
        );
        assert_eq!(Resolution::new(3, 3).scaled(0.1), Resolution::new(1, 1));
        assert!(Resolution::new(0, 1080).is_unset());
    }

    #[test]
    fn plane_buffer_splits_luma_and_chroma() {
        let planes = PlaneBuffer { data: vec![1; 12], width: 4, height: 2 };
        assert_eq!(planes.luma().len(), 8);
        assert_eq!(planes.chroma().len(), 4);
    }
}
