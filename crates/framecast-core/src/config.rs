use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Resolution;

/// Capture + encode configuration. Immutable once a session is created.
///
/// Accepts camelCase keys from the host runtime as well as snake_case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Requested capture width; 0 uses the native desktop size.
    pub width: u32,
    /// Requested capture height; 0 uses the native desktop size.
    pub height: u32,
    /// Target bitrate in bits per second; `<= 0` disables compression (raw mode).
    pub bitrate: i64,
    #[serde(alias = "frameRate", alias = "fps")]
    pub frame_rate: u32,
    #[serde(alias = "preferHardware", alias = "useHardware")]
    pub prefer_hardware: bool,
    /// Upper bound on a single blocking frame acquisition.
    #[serde(alias = "acquireTimeoutMs")]
    pub acquire_timeout_ms: u32,
    /// Composite the pointer into bitmap-copy captures. The duplication path never does.
    #[serde(alias = "captureCursor")]
    pub capture_cursor: bool,
    pub fallback: FallbackSettings,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            bitrate: 2_000_000,
            frame_rate: 30,
            prefer_hardware: true,
            acquire_timeout_ms: Self::DEFAULT_ACQUIRE_TIMEOUT_MS,
            capture_cursor: false,
            fallback: FallbackSettings::default(),
        }
    }
}

impl CaptureConfig {
    pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u32 = 20;

    pub fn compression_enabled(&self) -> bool {
        self.bitrate > 0
    }

    /// Requested region; [`Resolution::is_unset`] means "native desktop size".
    pub fn requested_resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Frame rate with a floor of 1 fps.
    pub fn effective_frame_rate(&self) -> u32 {
        self.frame_rate.max(1)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms as u64)
    }
}

// MARK: - FallbackSettings

/// Tuning for the bitmap-copy capture path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    #[serde(alias = "jpegQuality")]
    pub jpeg_quality: u8,
    #[serde(alias = "resolutionScale")]
    pub resolution_scale: f32,
    /// Frame-rate cap for bitmap captures; `None` uses [`FallbackSettings::DEFAULT_FPS`].
    #[serde(alias = "targetFps", alias = "targetFPS")]
    pub target_fps: Option<u32>,
    /// Skip output duplication and always use the bitmap-copy mechanism.
    #[serde(alias = "forceBitmapCapture")]
    pub force_bitmap_capture: bool,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: 75,
            resolution_scale: 0.5,
            target_fps: None,
            force_bitmap_capture: false,
        }
    }
}

impl FallbackSettings {
    pub const DEFAULT_FPS: u32 = 5;
    pub const MAX_FPS: u32 = 30;
    pub const MIN_SCALE: f32 = 0.1;
    pub const MAX_SCALE: f32 = 2.0;

    pub fn clamp_quality(quality: i64) -> u8 {
        quality.clamp(1, 100) as u8
    }

    pub fn clamp_scale(scale: f32) -> f32 {
        if scale.is_nan() {
            return Self::default().resolution_scale;
        }
        scale.clamp(Self::MIN_SCALE, Self::MAX_SCALE)
    }

    pub fn clamp_fps(fps: i64) -> u32 {
        fps.clamp(1, Self::MAX_FPS as i64) as u32
    }

    /// Copy with every field pulled into its valid range.
    pub fn normalized(&self) -> Self {
        Self {
            jpeg_quality: Self::clamp_quality(self.jpeg_quality as i64),
            resolution_scale: Self::clamp_scale(self.resolution_scale),
            target_fps: Some(Self::clamp_fps(self.target_fps.unwrap_or(Self::DEFAULT_FPS) as i64)),
            force_bitmap_capture: self.force_bitmap_capture,
        }
    }

    pub fn fps(&self) -> u32 {
        Self::clamp_fps(self.target_fps.unwrap_or(Self::DEFAULT_FPS) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::{CaptureConfig, FallbackSettings};

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "width": 1920,
            "height": 1080,
            "bitrate": 2000000,
            "frameRate": 60,
            "preferHardware": false,
            "acquireTimeoutMs": 16,
            "captureCursor": true,
            "fallback": {"jpegQuality": 90, "resolutionScale": 1.0, "targetFPS": 10}
        }"#;

        let cfg: CaptureConfig = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.requested_resolution().width, 1920);
        assert_eq!(cfg.frame_rate, 60);
        assert!(!cfg.prefer_hardware);
        assert_eq!(cfg.acquire_timeout_ms, 16);
        assert!(cfg.capture_cursor);
        assert_eq!(cfg.fallback.jpeg_quality, 90);
        assert_eq!(cfg.fallback.fps(), 10);
    }

    #[test]
    fn deserializes_snake_case_and_legacy_fields() {
        let json = r#"{ "fps": 24, "useHardware": true }"#;
        let cfg: CaptureConfig = serde_json::from_str(json).expect("valid config");
        assert_eq!(cfg.frame_rate, 24);
        assert!(cfg.prefer_hardware);

        let json = r#"{ "frame_rate": 15, "prefer_hardware": false }"#;
        let cfg: CaptureConfig = serde_json::from_str(json).expect("valid snake_case config");
        assert_eq!(cfg.frame_rate, 15);
        assert!(!cfg.prefer_hardware);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let cfg: CaptureConfig = serde_json::from_str("{}").expect("empty config");
        assert_eq!(cfg, CaptureConfig::default());
        assert!(cfg.requested_resolution().is_unset());
        assert!(cfg.compression_enabled());
        assert_eq!(cfg.acquire_timeout_ms, CaptureConfig::DEFAULT_ACQUIRE_TIMEOUT_MS);
        assert_eq!(cfg.acquire_timeout().as_millis(), 20);
    }

    #[test]
    fn non_positive_bitrate_disables_compression() {
        for bitrate in [0, -1, -2_000_000] {
            let cfg = CaptureConfig { bitrate, ..Default::default() };
            assert!(!cfg.compression_enabled());
        }
    }

    #[test]
    fn zero_frame_rate_is_floored() {
        let cfg = CaptureConfig { frame_rate: 0, ..Default::default() };
        assert_eq!(cfg.effective_frame_rate(), 1);
    }

    #[test]
    fn fallback_settings_are_clamped() {
        assert_eq!(FallbackSettings::clamp_quality(0), 1);
        assert_eq!(FallbackSettings::clamp_quality(250), 100);
        assert_eq!(FallbackSettings::clamp_scale(5.0), 2.0);
        assert_eq!(FallbackSettings::clamp_scale(0.01), 0.1);
        assert_eq!(FallbackSettings::clamp_fps(120), 30);
        assert_eq!(FallbackSettings::clamp_fps(-3), 1);

        let raw = FallbackSettings {
            jpeg_quality: 0,
            resolution_scale: 9.0,
            target_fps: Some(500),
            force_bitmap_capture: true,
        };
        let norm = raw.normalized();
        assert_eq!(norm.jpeg_quality, 1);
        assert_eq!(norm.resolution_scale, 2.0);
        assert_eq!(norm.fps(), 30);
        assert!(norm.force_bitmap_capture);
        assert_eq!(FallbackSettings::default().fps(), FallbackSettings::DEFAULT_FPS);
    }
}
