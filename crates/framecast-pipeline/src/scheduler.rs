//! Frame pacing and adaptive degradation for the bitmap-copy path.

use std::time::{Duration, Instant};

use framecast_core::Resolution;

/// Screens larger than this get their capture scale capped.
pub const HIGH_RES_THRESHOLD: Resolution = Resolution::UHD;
/// Scale used for high-resolution screens when the configured scale is near 1.
pub const HIGH_RES_SCALE: f32 = 0.75;
const HIGH_RES_SCALE_TRIGGER: f32 = 0.9;

/// Captures larger than this get their quality reduced.
pub const QUALITY_THRESHOLD: Resolution = Resolution::HD;
pub const QUALITY_STEP: u8 = 10;
pub const QUALITY_FLOOR: u8 = 65;

// MARK: - FrameScheduler

/// Decides whether enough time has passed since the last capture.
#[derive(Debug, Clone)]
pub struct FrameScheduler {
    target_fps:   u32,
    last_capture: Option<Instant>,
}

impl FrameScheduler {
    pub fn new(target_fps: u32) -> Self {
        Self { target_fps: target_fps.max(1), last_capture: None }
    }

    pub fn target_fps(&self) -> u32 {
        self.target_fps
    }

    pub fn set_target_fps(&mut self, fps: u32) {
        self.target_fps = fps.max(1);
    }

    /// `1000 / F` milliseconds.
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.target_fps as u64)
    }

    pub fn should_capture_now(&self, now: Instant) -> bool {
        match self.last_capture {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval(),
        }
    }

    pub fn mark_captured(&mut self, now: Instant) {
        self.last_capture = Some(now);
    }
}

// MARK: - Adaptive plan

/// Output size and JPEG quality for the next bitmap capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapturePlan {
    pub target:  Resolution,
    pub scale:   f32,
    pub quality: u8,
}

/// Apply the high-resolution scale cap and the large-capture quality step.
///
/// Quality is only ever lowered: a configured quality already at or below the
/// floor is kept as is.
pub fn plan_capture(screen: Resolution, scale: f32, quality: u8) -> CapturePlan {
    let scale = if screen.total_pixels() > HIGH_RES_THRESHOLD.total_pixels() && scale > HIGH_RES_SCALE_TRIGGER {
        HIGH_RES_SCALE
    } else {
        scale
    };
    let target = screen.scaled(scale);

    let quality = if target.total_pixels() > QUALITY_THRESHOLD.total_pixels() {
        quality.min(quality.saturating_sub(QUALITY_STEP).max(QUALITY_FLOOR))
    } else {
        quality
    };

    CapturePlan { target, scale, quality }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_always_captures() {
        let scheduler = FrameScheduler::new(5);
        assert!(scheduler.should_capture_now(Instant::now()));
    }

    #[test]
    fn gates_on_min_interval() {
        let mut scheduler = FrameScheduler::new(5);
        assert_eq!(scheduler.min_interval(), Duration::from_millis(200));

        let t0 = Instant::now();
        scheduler.mark_captured(t0);
        assert!(!scheduler.should_capture_now(t0));
        assert!(!scheduler.should_capture_now(t0 + Duration::from_millis(199)));
        assert!(scheduler.should_capture_now(t0 + Duration::from_millis(200)));

        scheduler.set_target_fps(30);
        assert_eq!(scheduler.min_interval(), Duration::from_millis(33));
        assert!(scheduler.should_capture_now(t0 + Duration::from_millis(40)));
    }

    #[test]
    fn zero_fps_is_floored() {
        let scheduler = FrameScheduler::new(0);
        assert_eq!(scheduler.target_fps(), 1);
        assert_eq!(scheduler.min_interval(), Duration::from_secs(1));
    }

    #[test]
    fn small_capture_is_untouched() {
        let plan = plan_capture(Resolution::FHD, 0.5, 75);
        assert_eq!(plan.target, Resolution::new(960, 540));
        assert_eq!(plan.scale, 0.5);
        assert_eq!(plan.quality, 75);
    }

    #[test]
    fn large_capture_drops_quality_with_floor() {
        let plan = plan_capture(Resolution::FHD, 1.0, 75);
        assert_eq!(plan.target, Resolution::FHD);
        assert_eq!(plan.quality, 65);

        assert_eq!(plan_capture(Resolution::FHD, 1.0, 90).quality, 80);
        assert_eq!(plan_capture(Resolution::FHD, 1.0, 70).quality, 65);
        // Never raised.
        assert_eq!(plan_capture(Resolution::FHD, 1.0, 40).quality, 40);
    }

    #[test]
    fn above_uhd_caps_scale() {
        let screen = Resolution::new(5120, 2880);
        let plan = plan_capture(screen, 1.0, 80);
        assert_eq!(plan.scale, HIGH_RES_SCALE);
        assert_eq!(plan.target, Resolution::new(3840, 2160));
        assert_eq!(plan.quality, 70);

        // Exactly UHD is not above the threshold.
        assert_eq!(plan_capture(Resolution::UHD, 1.0, 80).scale, 1.0);
        // A scale already at or below the trigger is kept.
        assert_eq!(plan_capture(screen, 0.5, 80).scale, 0.5);
    }
}
