//! Bitmap-copy capture session: paced whole-screen grabs compressed to JPEG.

use std::time::Instant;

use bytes::Bytes;
use framecast_capture::{jpeg, BitmapGrabber};
use framecast_core::{CaptureConfig, CaptureError, FallbackSettings, Resolution};
use tracing::{debug, info, warn};

use crate::scheduler::{plan_capture, FrameScheduler};

// MARK: - BitmapSettings

/// Runtime-tunable knobs of the bitmap path. Values are always in range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitmapSettings {
    pub quality:        u8,
    pub scale:          f32,
    pub fps:            u32,
    pub capture_cursor: bool,
    /// With no active clients nothing is captured and the cache is dropped.
    pub active_clients: bool,
}

impl Default for BitmapSettings {
    fn default() -> Self {
        Self::from_fallback(&FallbackSettings::default(), false)
    }
}

impl BitmapSettings {
    pub fn from_fallback(fallback: &FallbackSettings, capture_cursor: bool) -> Self {
        let fallback = fallback.normalized();
        Self {
            quality: fallback.jpeg_quality,
            scale: fallback.resolution_scale,
            fps: fallback.fps(),
            capture_cursor,
            active_clients: true,
        }
    }

    /// Settings from `config`, keeping the current active-clients switch.
    pub fn with_config(self, config: &CaptureConfig) -> Self {
        Self {
            active_clients: self.active_clients,
            ..Self::from_fallback(&config.fallback, config.capture_cursor)
        }
    }
}

// MARK: - StillImage

/// One compressed screen image.
#[derive(Debug, Clone, PartialEq)]
pub struct StillImage {
    pub data:    Bytes,
    pub size:    Resolution,
    pub quality: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BitmapOutcome {
    /// `fresh` is false when the cached image is handed back (throttled or a
    /// failed grab).
    Image { image: StillImage, fresh: bool },
    NoImage,
}

// MARK: - BitmapCaptureSession

pub struct BitmapCaptureSession {
    grabber:   Box<dyn BitmapGrabber>,
    settings:  BitmapSettings,
    scheduler: FrameScheduler,
    cached:    Option<StillImage>,
    screen:    Resolution,
}

impl BitmapCaptureSession {
    /// Check the grabber can see a screen and start an empty session.
    pub fn open(mut grabber: Box<dyn BitmapGrabber>, settings: BitmapSettings) -> Result<Self, CaptureError> {
        let screen = grabber.screen_size()?;
        if screen.is_unset() {
            return Err(CaptureError::DeviceCreationFailed {
                reason: format!("{} reported an empty screen", grabber.name()),
            });
        }
        info!(
            backend = grabber.name(),
            screen = %screen,
            quality = settings.quality,
            scale = settings.scale,
            fps = settings.fps,
            "Bitmap capture session open"
        );
        Ok(Self {
            grabber,
            scheduler: FrameScheduler::new(settings.fps),
            settings,
            cached: None,
            screen,
        })
    }

    pub fn settings(&self) -> BitmapSettings {
        self.settings
    }

    pub fn screen_size(&self) -> Resolution {
        self.screen
    }

    /// Size of the most recent image, or the screen scaled by the current scale.
    pub fn output_size(&self) -> Resolution {
        match &self.cached {
            Some(image) => image.size,
            None => plan_capture(self.screen, self.settings.scale, self.settings.quality).target,
        }
    }

    pub fn apply(&mut self, settings: BitmapSettings) {
        if settings.fps != self.settings.fps {
            self.scheduler.set_target_fps(settings.fps);
        }
        if !settings.active_clients {
            self.cached = None;
        }
        self.settings = settings;
    }

    /// Produce the next image, honoring pacing.
    ///
    /// A throttled call or a failed grab returns the cached image when there is
    /// one. A failure with nothing cached is an error.
    pub fn capture(&mut self, now: Instant) -> Result<BitmapOutcome, CaptureError> {
        if !self.scheduler.should_capture_now(now) {
            return Ok(self.cached_outcome());
        }
        self.scheduler.mark_captured(now);

        if !self.settings.active_clients {
            self.cached = None;
            return Ok(BitmapOutcome::NoImage);
        }

        let screen = self.grabber.screen_size()?;
        if screen != self.screen {
            info!(from = %self.screen, to = %screen, "Screen size changed, dropping cached image");
            self.screen = screen;
            self.cached = None;
        }

        match self.grab_and_compress(screen) {
            Ok(image) => {
                debug!(bytes = image.data.len(), size = %image.size, quality = image.quality, "Bitmap image");
                self.cached = Some(image.clone());
                Ok(BitmapOutcome::Image { image, fresh: true })
            }
            Err(e) if self.cached.is_some() => {
                warn!("Bitmap capture failed, reusing last image: {e}");
                Ok(self.cached_outcome())
            }
            Err(e) => Err(e),
        }
    }

    fn grab_and_compress(&mut self, screen: Resolution) -> Result<StillImage, CaptureError> {
        let plan = plan_capture(screen, self.settings.scale, self.settings.quality);
        let pixels = self.grabber.grab(plan.target, self.settings.capture_cursor)?;
        let data = jpeg::compress_bgra(&pixels, plan.target, plan.quality)?;
        Ok(StillImage { data: Bytes::from(data), size: plan.target, quality: plan.quality })
    }

    fn cached_outcome(&self) -> BitmapOutcome {
        match &self.cached {
            Some(image) => BitmapOutcome::Image { image: image.clone(), fresh: false },
            None => BitmapOutcome::NoImage,
        }
    }
}

impl Drop for BitmapCaptureSession {
    fn drop(&mut self) {
        info!(backend = self.grabber.name(), "Bitmap capture session closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use framecast_capture::synthetic::SyntheticGrabber;

    use super::*;

    fn open(grabber: &SyntheticGrabber, settings: BitmapSettings) -> BitmapCaptureSession {
        BitmapCaptureSession::open(Box::new(grabber.clone()), settings).unwrap()
    }

    fn image(outcome: BitmapOutcome) -> (StillImage, bool) {
        match outcome {
            BitmapOutcome::Image { image, fresh } => (image, fresh),
            BitmapOutcome::NoImage => panic!("expected an image"),
        }
    }

    #[test]
    fn settings_from_config_are_clamped() {
        let config: CaptureConfig = serde_json::from_str(
            r#"{"captureCursor": true, "fallback": {"jpegQuality": 0, "resolutionScale": 9.0, "targetFps": 120}}"#,
        )
        .unwrap();
        let settings = BitmapSettings { active_clients: false, ..BitmapSettings::default() }.with_config(&config);
        assert_eq!(settings.quality, 1);
        assert_eq!(settings.scale, FallbackSettings::MAX_SCALE);
        assert_eq!(settings.fps, FallbackSettings::MAX_FPS);
        assert!(settings.capture_cursor);
        assert!(!settings.active_clients);
    }

    #[test]
    fn first_capture_is_scaled_jpeg() {
        let grabber = SyntheticGrabber::new(Resolution::FHD);
        let mut session = open(&grabber, BitmapSettings::default());

        let (image, fresh) = image(session.capture(Instant::now()).unwrap());
        assert!(fresh);
        assert_eq!(image.size, Resolution::new(960, 540));
        assert_eq!(image.quality, 75);
        assert_eq!(&image.data[..2], &[0xFF, 0xD8]);
        assert_eq!(grabber.stats().last_target, Some(Resolution::new(960, 540)));
        assert!(!grabber.stats().last_cursor);
    }

    #[test]
    fn throttled_call_returns_cached_image() {
        let grabber = SyntheticGrabber::new(Resolution::HD);
        let mut session = open(&grabber, BitmapSettings::default());
        let t0 = Instant::now();

        let (first, _) = image(session.capture(t0).unwrap());
        let (again, fresh) = image(session.capture(t0 + Duration::from_millis(50)).unwrap());
        assert!(!fresh);
        assert_eq!(again, first);
        assert_eq!(grabber.stats().grabs, 1);

        let (_, fresh) = image(session.capture(t0 + Duration::from_millis(200)).unwrap());
        assert!(fresh);
        assert_eq!(grabber.stats().grabs, 2);
    }

    #[test]
    fn inactive_clients_clear_cache() {
        let grabber = SyntheticGrabber::new(Resolution::HD);
        let mut session = open(&grabber, BitmapSettings::default());
        let t0 = Instant::now();
        session.capture(t0).unwrap();

        session.apply(BitmapSettings { active_clients: false, ..session.settings() });
        assert_eq!(session.capture(t0 + Duration::from_secs(1)).unwrap(), BitmapOutcome::NoImage);
        // Throttled with nothing cached.
        assert_eq!(session.capture(t0 + Duration::from_millis(1010)).unwrap(), BitmapOutcome::NoImage);
        assert_eq!(grabber.stats().grabs, 1);
    }

    #[test]
    fn screen_change_drops_cache() {
        let grabber = SyntheticGrabber::new(Resolution::HD);
        let mut session = open(&grabber, BitmapSettings::default());
        let t0 = Instant::now();
        session.capture(t0).unwrap();

        grabber.set_screen_size(Resolution::FHD);
        grabber.set_failing(true);
        let err = session.capture(t0 + Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CaptureError::AcquireFailed { .. }));
        assert_eq!(session.screen_size(), Resolution::FHD);
    }

    #[test]
    fn failed_grab_reuses_cached_image() {
        let grabber = SyntheticGrabber::new(Resolution::HD);
        let mut session = open(&grabber, BitmapSettings::default());
        let t0 = Instant::now();
        let (first, _) = image(session.capture(t0).unwrap());

        grabber.set_failing(true);
        let (again, fresh) = image(session.capture(t0 + Duration::from_secs(1)).unwrap());
        assert!(!fresh);
        assert_eq!(again, first);
    }

    #[test]
    fn large_capture_lowers_quality() {
        let grabber = SyntheticGrabber::new(Resolution::FHD);
        let settings = BitmapSettings { scale: 1.0, quality: 90, ..BitmapSettings::default() };
        let mut session = open(&grabber, settings);

        let (image, _) = image(session.capture(Instant::now()).unwrap());
        assert_eq!(image.size, Resolution::FHD);
        assert_eq!(image.quality, 80);
    }

    #[test]
    fn cursor_and_fps_changes_apply() {
        let grabber = SyntheticGrabber::new(Resolution::HD);
        let mut session = open(&grabber, BitmapSettings::default());
        session.apply(BitmapSettings { capture_cursor: true, fps: 30, ..session.settings() });

        let t0 = Instant::now();
        session.capture(t0).unwrap();
        assert!(grabber.stats().last_cursor);

        let (_, fresh) = image(session.capture(t0 + Duration::from_millis(34)).unwrap());
        assert!(fresh);
    }

    #[test]
    fn empty_screen_is_rejected() {
        let grabber = SyntheticGrabber::new(Resolution::default());
        let err = BitmapCaptureSession::open(Box::new(grabber), BitmapSettings::default()).err();
        assert!(matches!(err, Some(CaptureError::DeviceCreationFailed { .. })));
    }
}
