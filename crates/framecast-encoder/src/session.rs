use framecast_core::{
    EncodeError, EncodedPacket, FrameSizeError, PixelFormat, PlaneBuffer, Resolution,
    TRANSFORM_TICKS_PER_SECOND,
};
use tracing::{debug, info, warn};

use crate::transform::{
    InputFormat, OutputFormat, RateControl, Transform, TransformClass, TransformOutput,
    TransformProvider,
};

// MARK: - EncoderState

/// `Uninitialized → Configured → Streaming → Stopped`; a stopped session is
/// replaced, never restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    Configured,
    Streaming,
    Stopped,
}

impl EncoderState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Configured => "configured",
            Self::Streaming => "streaming",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for EncoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// MARK: - EncoderSettings

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width:           u32,
    pub height:          u32,
    /// Bits per second; must be positive.
    pub bitrate:         i64,
    pub frame_rate:      u32,
    pub prefer_hardware: bool,
}

impl EncoderSettings {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Duration of one frame in 100 ns ticks.
    pub fn frame_duration(&self) -> i64 {
        TRANSFORM_TICKS_PER_SECOND / self.frame_rate.max(1) as i64
    }

    fn validate(&self) -> Result<(), EncodeError> {
        if self.bitrate <= 0 {
            return Err(EncodeError::InvalidConfiguration {
                reason: format!("bitrate must be positive (got {}); use raw mode instead", self.bitrate),
            });
        }
        if self.frame_rate == 0 {
            return Err(EncodeError::InvalidConfiguration { reason: "frame rate must be positive".into() });
        }
        let res = self.resolution();
        if res.is_unset() || !res.is_even() {
            return Err(FrameSizeError::Dimensions { width: self.width, height: self.height }.into());
        }
        Ok(())
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat {
            width:        self.width,
            height:       self.height,
            frame_rate:   self.frame_rate,
            bitrate:      self.bitrate.min(u32::MAX as i64) as u32,
            rate_control: RateControl::ConstantBitrate,
            progressive:  true,
            low_latency:  true,
        }
    }

    fn input_format(&self) -> InputFormat {
        InputFormat {
            width:        self.width,
            height:       self.height,
            frame_rate:   self.frame_rate,
            pixel_format: PixelFormat::Nv12,
        }
    }
}

// MARK: - EncodeOutcome

/// Result of [`EncodeSession::submit_and_drain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    Packet(EncodedPacket),
    /// The transform is still warming up. Not an error.
    NeedsMoreInput,
}

// MARK: - EncodeSession

/// Owns one H.264 transform and drives its push/pull protocol.
pub struct EncodeSession {
    state:            EncoderState,
    transform:        Option<Box<dyn Transform>>,
    settings:         Option<EncoderSettings>,
    hardware_active:  bool,
    sample_time:      i64,
    frames_submitted: u64,
}

impl Default for EncodeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeSession {
    pub fn new() -> Self {
        Self {
            state:            EncoderState::Uninitialized,
            transform:        None,
            settings:         None,
            hardware_active:  false,
            sample_time:      0,
            frames_submitted: 0,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    /// `true` when the active transform is hardware accelerated.
    pub fn hardware_active(&self) -> bool {
        self.hardware_active
    }

    pub fn transform_name(&self) -> Option<&str> {
        self.transform.as_deref().map(|t| t.name())
    }

    pub fn settings(&self) -> Option<&EncoderSettings> {
        self.settings.as_ref()
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// Select and negotiate a transform.
    ///
    /// Hardware transforms are tried first when `prefer_hardware` is set; if
    /// none can be activated and negotiated, software transforms are tried once
    /// before failing with [`EncodeError::NoEncoderAvailable`].
    pub fn configure(
        &mut self,
        provider: &mut dyn TransformProvider,
        settings: EncoderSettings,
    ) -> Result<(), EncodeError> {
        self.expect_state(EncoderState::Uninitialized)?;
        settings.validate()?;

        let classes: &[TransformClass] = if settings.prefer_hardware {
            &[TransformClass::Hardware, TransformClass::Software]
        } else {
            &[TransformClass::Software]
        };

        for &class in classes {
            if let Some(transform) = negotiate_class(provider, class, &settings) {
                info!(
                    encoder = transform.name(),
                    %class,
                    width = settings.width,
                    height = settings.height,
                    fps = settings.frame_rate,
                    bitrate = settings.bitrate,
                    "H.264 transform configured"
                );
                self.hardware_active = class == TransformClass::Hardware;
                self.transform = Some(transform);
                self.settings = Some(settings);
                self.state = EncoderState::Configured;
                return Ok(());
            }
            if class == TransformClass::Hardware {
                warn!("No usable hardware H.264 transform, falling back to software");
            }
        }

        Err(EncodeError::NoEncoderAvailable)
    }

    /// Begin streaming: resets the sample clock and flushes the transform.
    pub fn start(&mut self) -> Result<(), EncodeError> {
        self.expect_state(EncoderState::Configured)?;
        let Some(transform) = self.transform.as_mut() else {
            return Err(self.invalid_state(EncoderState::Configured));
        };
        if let Err(e) = transform.begin_streaming() {
            self.abort(&e);
            return Err(e);
        }
        self.sample_time = 0;
        self.state = EncoderState::Streaming;
        debug!("Encode session streaming");
        Ok(())
    }

    /// Feed one NV12 frame and attempt exactly one pull.
    ///
    /// The sample clock advances by one frame duration on every call that gets
    /// past validation. A frame of the wrong size is rejected without touching
    /// the session; any transform failure stops it.
    pub fn submit_and_drain(&mut self, planes: &PlaneBuffer) -> Result<EncodeOutcome, EncodeError> {
        self.expect_state(EncoderState::Streaming)?;
        let (Some(settings), Some(transform)) = (self.settings.as_ref(), self.transform.as_mut()) else {
            return Err(self.invalid_state(EncoderState::Streaming));
        };

        let expected = settings.resolution();
        if planes.resolution() != expected {
            return Err(FrameSizeError::Dimensions { width: planes.width, height: planes.height }.into());
        }
        if planes.data.len() != expected.planar_len() {
            return Err(FrameSizeError::Length {
                expected: expected.planar_len(),
                actual: planes.data.len(),
            }
            .into());
        }

        let pts = self.sample_time;
        let duration = settings.frame_duration();
        self.sample_time += duration;
        self.frames_submitted += 1;

        let result = transform
            .process_input(planes, pts, duration)
            .and_then(|()| transform.process_output());

        match result {
            Ok(TransformOutput::Packet(packet)) => {
                debug!(bytes = packet.data.len(), pts = packet.pts, keyframe = packet.is_keyframe, "Packet");
                Ok(EncodeOutcome::Packet(packet))
            }
            Ok(TransformOutput::NeedMoreInput) => Ok(EncodeOutcome::NeedsMoreInput),
            Err(e) => {
                self.abort(&e);
                Err(e)
            }
        }
    }

    /// Signal end of stream, flush and release the transform. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut transform) = self.transform.take() {
            if self.state == EncoderState::Streaming {
                if let Err(e) = transform.end_of_stream() {
                    warn!("End of stream on {} failed: {e}", transform.name());
                }
            }
            info!(encoder = transform.name(), frames = self.frames_submitted, "Encode session stopped");
        }
        if self.state != EncoderState::Uninitialized {
            self.state = EncoderState::Stopped;
        }
    }

    fn abort(&mut self, err: &EncodeError) {
        warn!("Encoder failure, stopping session: {err}");
        self.transform = None;
        self.state = EncoderState::Stopped;
    }

    fn expect_state(&self, expected: EncoderState) -> Result<(), EncodeError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid_state(expected))
        }
    }

    fn invalid_state(&self, expected: EncoderState) -> EncodeError {
        EncodeError::InvalidState { expected: expected.as_str(), actual: self.state.as_str() }
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// First transform of `class` that activates and accepts both formats.
fn negotiate_class(
    provider: &mut dyn TransformProvider,
    class: TransformClass,
    settings: &EncoderSettings,
) -> Option<Box<dyn Transform>> {
    let candidates = provider.enumerate(class);
    if candidates.is_empty() {
        debug!(provider = provider.name(), %class, "No transforms enumerated");
    }

    let output = settings.output_format();
    let input = settings.input_format();
    for info in candidates {
        let negotiated = provider.activate(&info).and_then(|mut transform| {
            transform.set_output_format(&output)?;
            transform.set_input_format(&input)?;
            Ok(transform)
        });
        match negotiated {
            Ok(transform) => return Some(transform),
            Err(e) => warn!(encoder = %info.name, "Transform rejected: {e}"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticProvider;

    fn settings(prefer_hardware: bool) -> EncoderSettings {
        EncoderSettings { width: 64, height: 32, bitrate: 2_000_000, frame_rate: 30, prefer_hardware }
    }

    fn planes(width: u32, height: u32) -> PlaneBuffer {
        let len = Resolution::new(width, height).planar_len();
        PlaneBuffer { data: vec![128; len], width, height }
    }

    fn streaming(provider: &mut SyntheticProvider, prefer_hardware: bool) -> EncodeSession {
        let mut session = EncodeSession::new();
        session.configure(provider, settings(prefer_hardware)).unwrap();
        session.start().unwrap();
        session
    }

    #[test]
    fn prefers_hardware_when_available() {
        let mut provider = SyntheticProvider::new();
        let session = streaming(&mut provider, true);
        assert!(session.hardware_active());
        assert_eq!(session.transform_name(), Some("synthetic-hw"));
        assert_eq!(session.state(), EncoderState::Streaming);
    }

    #[test]
    fn falls_back_to_software_once() {
        let mut provider = SyntheticProvider::new();
        provider.set_hardware_available(false);
        let session = streaming(&mut provider, true);
        assert!(!session.hardware_active());
        assert_eq!(session.transform_name(), Some("synthetic-sw"));
    }

    #[test]
    fn hardware_that_rejects_formats_falls_back() {
        let mut provider = SyntheticProvider::new();
        provider.set_hardware_rejects_formats(true);
        let session = streaming(&mut provider, true);
        assert!(!session.hardware_active());
    }

    #[test]
    fn no_transform_at_all_is_no_encoder_available() {
        let mut provider = SyntheticProvider::new();
        provider.set_hardware_available(false);
        provider.set_software_available(false);
        let mut session = EncodeSession::new();
        let err = session.configure(&mut provider, settings(true)).unwrap_err();
        assert_eq!(err, EncodeError::NoEncoderAvailable);
        assert_eq!(session.state(), EncoderState::Uninitialized);
    }

    #[test]
    fn software_only_when_hardware_not_preferred() {
        let mut provider = SyntheticProvider::new();
        let session = streaming(&mut provider, false);
        assert!(!session.hardware_active());
        assert_eq!(provider.stats().activations, 1);
    }

    #[test]
    fn negotiates_cbr_progressive_low_latency() {
        let mut provider = SyntheticProvider::new();
        let _session = streaming(&mut provider, true);
        let output = provider.stats().last_output.unwrap();
        assert_eq!(output.rate_control, RateControl::ConstantBitrate);
        assert!(output.progressive && output.low_latency);
        assert_eq!(output.bitrate, 2_000_000);
        let input = provider.stats().last_input.unwrap();
        assert_eq!(input.pixel_format, PixelFormat::Nv12);
        assert_eq!((input.width, input.height, input.frame_rate), (64, 32, 30));
    }

    #[test]
    fn zero_bitrate_is_rejected() {
        let mut provider = SyntheticProvider::new();
        let mut session = EncodeSession::new();
        let err = session
            .configure(&mut provider, EncoderSettings { bitrate: 0, ..settings(true) })
            .unwrap_err();
        assert!(matches!(err, EncodeError::InvalidConfiguration { .. }));
        assert_eq!(provider.stats().activations, 0);
    }

    #[test]
    fn odd_dimensions_are_rejected() {
        let mut provider = SyntheticProvider::new();
        let mut session = EncodeSession::new();
        let err = session
            .configure(&mut provider, EncoderSettings { width: 63, ..settings(true) })
            .unwrap_err();
        assert!(matches!(err, EncodeError::InvalidFrameSize(FrameSizeError::Dimensions { .. })));
    }

    #[test]
    fn warm_up_then_packets_with_monotonic_timestamps() {
        let mut provider = SyntheticProvider::new();
        provider.set_warmup(3);
        let mut session = streaming(&mut provider, true);
        let frame = planes(64, 32);

        for _ in 0..3 {
            assert_eq!(session.submit_and_drain(&frame).unwrap(), EncodeOutcome::NeedsMoreInput);
        }

        let duration = TRANSFORM_TICKS_PER_SECOND / 30;
        let mut last_pts = -1;
        for i in 0..5 {
            let EncodeOutcome::Packet(packet) = session.submit_and_drain(&frame).unwrap() else {
                panic!("expected a packet after warm-up");
            };
            assert!(!packet.data.is_empty());
            assert!(packet.pts > last_pts);
            assert_eq!(packet.pts, i * duration);
            assert_eq!(packet.duration, duration);
            assert_eq!(packet.is_keyframe, i == 0);
            last_pts = packet.pts;
        }
        assert_eq!(session.frames_submitted(), 8);
        assert_eq!(provider.stats().last_input_pts, Some(7 * duration));
    }

    #[test]
    fn wrong_frame_size_leaves_session_streaming() {
        let mut provider = SyntheticProvider::new();
        let mut session = streaming(&mut provider, true);

        let err = session.submit_and_drain(&planes(32, 32)).unwrap_err();
        assert!(matches!(err, EncodeError::InvalidFrameSize(_)));

        let mut short = planes(64, 32);
        short.data.pop();
        let err = session.submit_and_drain(&short).unwrap_err();
        assert_eq!(
            err,
            EncodeError::InvalidFrameSize(FrameSizeError::Length { expected: 3072, actual: 3071 })
        );

        assert_eq!(session.state(), EncoderState::Streaming);
        assert_eq!(session.frames_submitted(), 0);
        session.submit_and_drain(&planes(64, 32)).unwrap();
    }

    #[test]
    fn transform_failure_is_fatal() {
        let mut provider = SyntheticProvider::new();
        provider.fail_output_after(2);
        let mut session = streaming(&mut provider, true);
        let frame = planes(64, 32);

        session.submit_and_drain(&frame).unwrap();
        session.submit_and_drain(&frame).unwrap();
        let err = session.submit_and_drain(&frame).unwrap_err();
        assert!(matches!(err, EncodeError::TransformFailed { .. }));
        assert_eq!(session.state(), EncoderState::Stopped);
        assert_eq!(session.transform_name(), None);
        assert_eq!(provider.stats().live_transforms, 0);

        let err = session.submit_and_drain(&frame).unwrap_err();
        assert!(matches!(err, EncodeError::InvalidState { .. }));
    }

    #[test]
    fn submit_requires_streaming() {
        let mut provider = SyntheticProvider::new();
        let mut session = EncodeSession::new();
        assert!(matches!(
            session.submit_and_drain(&planes(64, 32)),
            Err(EncodeError::InvalidState { expected: "streaming", actual: "uninitialized" })
        ));
        session.configure(&mut provider, settings(true)).unwrap();
        assert!(session.submit_and_drain(&planes(64, 32)).is_err());
        assert!(session.configure(&mut provider, settings(true)).is_err());
    }

    #[test]
    fn stop_is_idempotent_from_any_state() {
        let mut provider = SyntheticProvider::new();

        let mut fresh = EncodeSession::new();
        fresh.stop();
        assert_eq!(fresh.state(), EncoderState::Uninitialized);

        let mut configured = EncodeSession::new();
        configured.configure(&mut provider, settings(true)).unwrap();
        configured.stop();
        configured.stop();
        assert_eq!(configured.state(), EncoderState::Stopped);
        assert_eq!(provider.stats().end_of_streams, 0);

        let mut session = streaming(&mut provider, true);
        session.submit_and_drain(&planes(64, 32)).unwrap();
        session.stop();
        session.stop();
        assert_eq!(session.state(), EncoderState::Stopped);
        assert_eq!(provider.stats().end_of_streams, 1);
        assert_eq!(provider.stats().live_transforms, 0);
    }

    #[test]
    fn start_flushes_transform() {
        let mut provider = SyntheticProvider::new();
        let _session = streaming(&mut provider, true);
        assert_eq!(provider.stats().begin_streaming_calls, 1);
    }
}
