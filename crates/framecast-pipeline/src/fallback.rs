//! Degradation policy for the two independent fallback axes.
//!
//! * Capture mechanism: output duplication, or whole-screen bitmap copy when
//!   duplication is not supported at all. Chosen once per `initialize`.
//! * Encoder: hardware transform, or software when no hardware transform can
//!   be negotiated. Reported through [`FallbackController::hardware_active`],
//!   never as an error.

use framecast_capture::{BitmapGrabber, CaptureSession, DuplicationFactory};
use framecast_core::{CaptureError, CaptureMethod, EncodeError, Resolution};
use framecast_encoder::{EncodeSession, EncoderSettings, TransformProvider};
use tracing::{info, warn};

use crate::bitmap::{BitmapCaptureSession, BitmapSettings};

/// Capture mechanism selected at open time.
pub enum CaptureStrategy {
    Duplication(CaptureSession),
    BitmapCopy(BitmapCaptureSession),
}

impl CaptureStrategy {
    pub fn method(&self) -> CaptureMethod {
        match self {
            Self::Duplication(_) => CaptureMethod::Duplication,
            Self::BitmapCopy(_) => CaptureMethod::BitmapCopy,
        }
    }

    /// Size of the frames or images this strategy produces.
    pub fn output_size(&self) -> Resolution {
        match self {
            Self::Duplication(session) => session.size(),
            Self::BitmapCopy(session) => session.output_size(),
        }
    }
}

/// Duplication open failures that mean "this machine cannot duplicate", as
/// opposed to a transient denial the caller should retry.
pub fn falls_back_to_bitmap(err: &CaptureError) -> bool {
    matches!(err, CaptureError::Unsupported { .. } | CaptureError::DeviceCreationFailed { .. })
}

#[derive(Debug, Clone, Default)]
pub struct FallbackController {
    prefer_hardware: bool,
    force_bitmap:    bool,
    capture_method:  Option<CaptureMethod>,
    hardware_active: bool,
    encoder_name:    Option<String>,
}

impl FallbackController {
    pub fn new(prefer_hardware: bool, force_bitmap: bool) -> Self {
        Self { prefer_hardware, force_bitmap, ..Self::default() }
    }

    pub fn capture_method(&self) -> Option<CaptureMethod> {
        self.capture_method
    }

    /// `true` while the active encoder is a hardware transform.
    pub fn hardware_active(&self) -> bool {
        self.hardware_active
    }

    pub fn encoder_name(&self) -> Option<&str> {
        self.encoder_name.as_deref()
    }

    /// Open the best available capture mechanism.
    ///
    /// Retryable duplication errors are returned as is. Only when duplication
    /// is unsupported does the bitmap path get a try, and if that fails too the
    /// duplication error is reported.
    pub fn open_capture(
        &mut self,
        factory: &mut dyn DuplicationFactory,
        grabber: Box<dyn BitmapGrabber>,
        requested: Resolution,
        bitmap: BitmapSettings,
    ) -> Result<CaptureStrategy, CaptureError> {
        if self.force_bitmap {
            info!("Bitmap capture forced by configuration");
            return self.select(CaptureStrategy::BitmapCopy(BitmapCaptureSession::open(grabber, bitmap)?));
        }

        match CaptureSession::open(factory, requested) {
            Ok(session) => self.select(CaptureStrategy::Duplication(session)),
            Err(e) if falls_back_to_bitmap(&e) => {
                warn!("Output duplication unavailable ({e}), falling back to bitmap copy");
                match BitmapCaptureSession::open(grabber, bitmap) {
                    Ok(session) => self.select(CaptureStrategy::BitmapCopy(session)),
                    Err(bitmap_err) => {
                        warn!("Bitmap copy unavailable as well: {bitmap_err}");
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Configure and start an encoder, downgrading to software when needed.
    pub fn open_encoder(
        &mut self,
        provider: &mut dyn TransformProvider,
        settings: EncoderSettings,
    ) -> Result<EncodeSession, EncodeError> {
        self.hardware_active = false;
        self.encoder_name = None;

        let mut session = EncodeSession::new();
        session.configure(provider, EncoderSettings { prefer_hardware: self.prefer_hardware, ..settings })?;
        session.start()?;

        self.hardware_active = session.hardware_active();
        self.encoder_name = session.transform_name().map(str::to_owned);
        if self.prefer_hardware && !self.hardware_active {
            warn!(encoder = ?self.encoder_name, "Hardware encoding unavailable, running on a software transform");
        }
        Ok(session)
    }

    fn select(&mut self, strategy: CaptureStrategy) -> Result<CaptureStrategy, CaptureError> {
        let method = strategy.method();
        info!(method = %method, size = %strategy.output_size(), "Capture mechanism selected");
        self.capture_method = Some(method);
        Ok(strategy)
    }
}

#[cfg(test)]
mod tests {
    use framecast_capture::synthetic::{OpenFault, SyntheticDisplay, SyntheticGrabber};
    use framecast_encoder::synthetic::SyntheticProvider;

    use super::*;

    fn settings() -> EncoderSettings {
        EncoderSettings { width: 640, height: 480, bitrate: 1_000_000, frame_rate: 30, prefer_hardware: true }
    }

    fn open(
        controller: &mut FallbackController,
        display: &SyntheticDisplay,
        grabber: &SyntheticGrabber,
    ) -> Result<CaptureStrategy, CaptureError> {
        let mut factory = display.clone();
        controller.open_capture(&mut factory, Box::new(grabber.clone()), Resolution::HD, BitmapSettings::default())
    }

    #[test]
    fn prefers_duplication() {
        let display = SyntheticDisplay::new(Resolution::FHD);
        let grabber = SyntheticGrabber::new(Resolution::FHD);
        let mut controller = FallbackController::new(true, false);

        let strategy = open(&mut controller, &display, &grabber).unwrap();
        assert_eq!(strategy.method(), CaptureMethod::Duplication);
        assert_eq!(strategy.output_size(), Resolution::HD);
        assert_eq!(controller.capture_method(), Some(CaptureMethod::Duplication));
    }

    #[test]
    fn unsupported_duplication_falls_back_to_bitmap() {
        let display = SyntheticDisplay::new(Resolution::FHD);
        display.deny_next_open(OpenFault::Unsupported);
        let grabber = SyntheticGrabber::new(Resolution::FHD);
        let mut controller = FallbackController::new(true, false);

        let strategy = open(&mut controller, &display, &grabber).unwrap();
        assert_eq!(strategy.method(), CaptureMethod::BitmapCopy);
        assert_eq!(strategy.output_size(), Resolution::new(960, 540));
    }

    #[test]
    fn session_limit_is_not_a_fallback() {
        let display = SyntheticDisplay::new(Resolution::FHD);
        display.deny_next_open(OpenFault::SessionLimit);
        let grabber = SyntheticGrabber::new(Resolution::FHD);
        let mut controller = FallbackController::new(true, false);

        let err = open(&mut controller, &display, &grabber).err();
        assert!(matches!(err, Some(CaptureError::DuplicationUnavailable { .. })));
        assert_eq!(controller.capture_method(), None);
    }

    #[test]
    fn both_mechanisms_missing_reports_duplication_error() {
        let display = SyntheticDisplay::new(Resolution::FHD);
        display.deny_next_open(OpenFault::NoDevice);
        let grabber = SyntheticGrabber::new(Resolution::default());
        let mut controller = FallbackController::new(true, false);

        let err = open(&mut controller, &display, &grabber).err();
        assert!(matches!(err, Some(CaptureError::DeviceCreationFailed { .. })));
    }

    #[test]
    fn forced_bitmap_skips_duplication() {
        let display = SyntheticDisplay::new(Resolution::FHD);
        let grabber = SyntheticGrabber::new(Resolution::FHD);
        let mut controller = FallbackController::new(true, true);

        let strategy = open(&mut controller, &display, &grabber).unwrap();
        assert_eq!(strategy.method(), CaptureMethod::BitmapCopy);
        assert_eq!(display.stats().opens, 0);
    }

    #[test]
    fn missing_hardware_downgrades_without_error() {
        let mut provider = SyntheticProvider::new();
        provider.set_hardware_available(false);
        let mut controller = FallbackController::new(true, false);

        let session = controller.open_encoder(&mut provider, settings()).unwrap();
        assert!(!controller.hardware_active());
        assert_eq!(controller.encoder_name(), Some("synthetic-sw"));
        assert_eq!(session.transform_name(), Some("synthetic-sw"));
    }

    #[test]
    fn hardware_used_when_present() {
        let mut provider = SyntheticProvider::new();
        let mut controller = FallbackController::new(true, false);

        controller.open_encoder(&mut provider, settings()).unwrap();
        assert!(controller.hardware_active());
        assert_eq!(controller.encoder_name(), Some("synthetic-hw"));
    }

    #[test]
    fn no_transform_at_all_is_an_error() {
        let mut provider = SyntheticProvider::new();
        provider.set_hardware_available(false);
        provider.set_software_available(false);
        let mut controller = FallbackController::new(true, false);

        let err = controller.open_encoder(&mut provider, settings()).err();
        assert_eq!(err, Some(EncodeError::NoEncoderAvailable));
        assert!(!controller.hardware_active());
    }

    #[test]
    fn axes_are_independent() {
        // Bitmap capture does not touch the encoder flag.
        let display = SyntheticDisplay::new(Resolution::FHD);
        let grabber = SyntheticGrabber::new(Resolution::FHD);
        let mut controller = FallbackController::new(true, true);
        let mut provider = SyntheticProvider::new();
        controller.open_encoder(&mut provider, settings()).unwrap();
        open(&mut controller, &display, &grabber).unwrap();
        assert!(controller.hardware_active());
        assert_eq!(controller.capture_method(), Some(CaptureMethod::BitmapCopy));

        // Software encoding does not move the capture path.
        let mut controller = FallbackController::new(true, false);
        provider.set_hardware_available(false);
        open(&mut controller, &display, &grabber).unwrap();
        controller.open_encoder(&mut provider, settings()).unwrap();
        assert!(!controller.hardware_active());
        assert_eq!(controller.capture_method(), Some(CaptureMethod::Duplication));
    }
}
