//! `CapturePipeline`: the single per-process capture → encode facade.
//!
//! ```text
//! initialize(config)
//!   ├─ FallbackController::open_capture ── Duplication(CaptureSession)
//!   │                                   └─ BitmapCopy(BitmapCaptureSession)
//!   └─ FallbackController::open_encoder  (duplication + bitrate > 0 only)
//!
//! capture_frame()
//!   Duplication: acquire → [crop to even] → NV12 → submit_and_drain
//!   BitmapCopy:  paced grab → JPEG
//! ```
//!
//! Every operation takes the one session mutex, so configuration, capture and
//! teardown never interleave. Nothing here returns `Err` across the boundary:
//! each call yields a serializable result struct.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use framecast_capture::synthetic::{SyntheticDisplay, SyntheticGrabber};
use framecast_capture::{AcquireOutcome, BitmapGrabber, DuplicationFactory};
use framecast_core::convert::bgra_to_nv12;
use framecast_core::{
    CaptureConfig, CaptureMethod, EncodedPacket, ErrorKind, FallbackSettings, FrameBuffer,
    FrameSizeError, FramecastError, Resolution, StreamFormat,
};
use framecast_encoder::synthetic::SyntheticProvider;
use framecast_encoder::{EncodeOutcome, EncodeSession, EncoderSettings, TransformProvider};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bitmap::{BitmapOutcome, BitmapSettings, StillImage};
use crate::fallback::{CaptureStrategy, FallbackController};

// ── Single-instance claim ─────────────────────────────────────────────────────

static PIPELINE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Held by the live [`CapturePipeline`]; only one can exist per process.
struct InstanceClaim;

impl InstanceClaim {
    fn acquire() -> Result<Self, FramecastError> {
        PIPELINE_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self)
            .map_err(|_| FramecastError::AlreadyActive)
    }
}

impl Drop for InstanceClaim {
    fn drop(&mut self) {
        PIPELINE_ACTIVE.store(false, Ordering::Release);
    }
}

// ── Backends ──────────────────────────────────────────────────────────────────

/// Platform collaborators the pipeline drives.
pub struct Backends {
    pub duplication: Box<dyn DuplicationFactory>,
    /// A fresh grabber per bitmap session.
    pub bitmap:      Box<dyn Fn() -> Box<dyn BitmapGrabber> + Send>,
    pub transforms:  Box<dyn TransformProvider>,
}

impl Backends {
    /// Duplication, bitmap copy and H.264 transforms for this platform.
    pub fn platform() -> Self {
        Self {
            duplication: framecast_capture::platform_factory(),
            bitmap:      Box::new(framecast_capture::platform_grabber),
            transforms:  framecast_encoder::platform_provider(),
        }
    }

    /// In-process backends; the handles stay usable for fault injection.
    pub fn synthetic(display: SyntheticDisplay, grabber: SyntheticGrabber, provider: SyntheticProvider) -> Self {
        Self {
            duplication: Box::new(display),
            bitmap:      Box::new(move || Box::new(grabber.clone()) as Box<dyn BitmapGrabber>),
            transforms:  Box::new(provider),
        }
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResult {
    pub success:         bool,
    pub width:           u32,
    pub height:          u32,
    pub encoder_enabled: bool,
    pub hardware_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_method:  Option<CaptureMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoder:         Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error:           Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind:      Option<ErrorKind>,
}

impl InitResult {
    fn failed(err: &FramecastError) -> Self {
        Self {
            success: false,
            width: 0,
            height: 0,
            encoder_enabled: false,
            hardware_active: false,
            capture_method: None,
            encoder: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenInfo {
    pub width:       u32,
    pub height:      u32,
    pub initialized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResult {
    pub success: bool,
}

/// What a `capture_frame` call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameStatus {
    /// One compressed H.264 access unit.
    Packet,
    /// Packed BGRA frame (compression disabled).
    Raw,
    /// JPEG still from the bitmap-copy path.
    Image,
    NoNewFrame,
    NeedsMoreInput,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureFrameResult {
    pub success:    bool,
    pub encoded:    bool,
    pub status:     FrameStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format:     Option<StreamFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data:       Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size:       Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width:      Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height:     Option<u32>,
    /// Transform ticks (100 ns).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pts:        Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration:   Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyframe:   Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error:      Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl CaptureFrameResult {
    fn empty(status: FrameStatus) -> Self {
        Self {
            success: true,
            encoded: false,
            status,
            format: None,
            data: None,
            size: None,
            width: None,
            height: None,
            pts: None,
            duration: None,
            keyframe: None,
            error: None,
            error_kind: None,
        }
    }

    fn with_data(status: FrameStatus, format: StreamFormat, data: Bytes, size: Resolution) -> Self {
        Self {
            encoded: status != FrameStatus::Raw,
            format: Some(format),
            size: Some(data.len()),
            data: Some(data),
            width: Some(size.width),
            height: Some(size.height),
            ..Self::empty(status)
        }
    }

    fn packet(packet: EncodedPacket, size: Resolution) -> Self {
        Self {
            pts: Some(packet.pts),
            duration: Some(packet.duration),
            keyframe: Some(packet.is_keyframe),
            ..Self::with_data(FrameStatus::Packet, StreamFormat::H264, packet.data, size)
        }
    }

    fn raw(frame: FrameBuffer) -> Self {
        let size = frame.resolution();
        Self::with_data(FrameStatus::Raw, StreamFormat::Bgra, Bytes::from(frame.data), size)
    }

    fn image(image: StillImage) -> Self {
        Self::with_data(FrameStatus::Image, StreamFormat::Jpeg, image.data, image.size)
    }

    fn failed(err: &FramecastError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            ..Self::empty(FrameStatus::Failed)
        }
    }
}

// ── Active session ────────────────────────────────────────────────────────────

/// The capture strategy and its encoder, always replaced or dropped together.
struct ActiveSession {
    config:   CaptureConfig,
    capture:  CaptureStrategy,
    encoder:  Option<EncodeSession>,
    fallback: FallbackController,
}

impl ActiveSession {
    fn open(
        backends: &mut Backends,
        config: CaptureConfig,
        bitmap: BitmapSettings,
    ) -> Result<Self, FramecastError> {
        let mut requested = config.requested_resolution();
        if config.compression_enabled() && !requested.is_unset() {
            requested = requested.even_aligned();
        }

        let mut fallback = FallbackController::new(config.prefer_hardware, config.fallback.force_bitmap_capture);
        let capture = fallback.open_capture(
            backends.duplication.as_mut(),
            (backends.bitmap)(),
            requested,
            bitmap,
        )?;

        let encoder_size = match &capture {
            CaptureStrategy::Duplication(session) if config.compression_enabled() => {
                Some(session.size().even_aligned())
            }
            _ => None,
        };

        let mut session = Self { config, capture, encoder: None, fallback };
        if let Some(size) = encoder_size {
            session.encoder = Some(session.open_encoder(backends.transforms.as_mut(), size)?);
        }
        Ok(session)
    }

    /// Size reported to the caller: the encoded size when an encoder runs.
    fn output_size(&self) -> Resolution {
        match &self.encoder {
            Some(encoder) => encoder.settings().map(|s| s.resolution()).unwrap_or_default(),
            None => self.capture.output_size(),
        }
    }

    fn desktop_size(&self) -> Resolution {
        match &self.capture {
            CaptureStrategy::Duplication(session) => session.desktop_size(),
            CaptureStrategy::BitmapCopy(session) => session.screen_size(),
        }
    }

    fn open_encoder(
        &mut self,
        provider: &mut dyn TransformProvider,
        size: Resolution,
    ) -> Result<EncodeSession, FramecastError> {
        if size.width == 0 || size.height == 0 {
            return Err(FrameSizeError::Dimensions { width: size.width, height: size.height }.into());
        }
        let settings = EncoderSettings {
            width: size.width,
            height: size.height,
            bitrate: self.config.bitrate,
            frame_rate: self.config.effective_frame_rate(),
            prefer_hardware: self.config.prefer_hardware,
        };
        Ok(self.fallback.open_encoder(provider, settings)?)
    }

    fn capture(
        &mut self,
        provider: &mut dyn TransformProvider,
        now: Instant,
    ) -> Result<CaptureFrameResult, FramecastError> {
        let frame = match &mut self.capture {
            CaptureStrategy::BitmapCopy(session) => {
                return Ok(match session.capture(now)? {
                    BitmapOutcome::Image { image, .. } => CaptureFrameResult::image(image),
                    BitmapOutcome::NoImage => CaptureFrameResult::empty(FrameStatus::NoNewFrame),
                });
            }
            CaptureStrategy::Duplication(session) => match session.acquire_frame(self.config.acquire_timeout())? {
                AcquireOutcome::Frame(frame) => frame,
                AcquireOutcome::NoNewFrame => return Ok(CaptureFrameResult::empty(FrameStatus::NoNewFrame)),
            },
        };

        if !self.config.compression_enabled() {
            return Ok(CaptureFrameResult::raw(frame));
        }
        self.encode(provider, crop_to_even(frame))
    }

    fn encode(
        &mut self,
        provider: &mut dyn TransformProvider,
        frame: FrameBuffer,
    ) -> Result<CaptureFrameResult, FramecastError> {
        let size = frame.resolution();
        let configured = self.encoder.as_ref().and_then(|e| e.settings()).map(|s| s.resolution());
        if configured != Some(size) {
            if let Some(mut stale) = self.encoder.take() {
                info!(from = ?configured, to = %size, "Frame size changed, recreating encoder");
                stale.stop();
            }
            self.encoder = Some(self.open_encoder(provider, size)?);
        }

        let planes = bgra_to_nv12(&frame.data, frame.width, frame.height)?;
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(FramecastError::NotInitialized);
        };
        Ok(match encoder.submit_and_drain(&planes)? {
            EncodeOutcome::Packet(packet) => CaptureFrameResult::packet(packet, size),
            EncodeOutcome::NeedsMoreInput => CaptureFrameResult::empty(FrameStatus::NeedsMoreInput),
        })
    }

    fn apply_bitmap_settings(&mut self, settings: BitmapSettings) {
        if let CaptureStrategy::BitmapCopy(session) = &mut self.capture {
            session.apply(settings);
        }
    }

    fn close(mut self) {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.stop();
        }
        if let CaptureStrategy::Duplication(session) = &mut self.capture {
            session.close();
        }
        info!(method = %self.capture.method(), "Capture pipeline stopped");
    }
}

/// Drop the last column and/or row so both dimensions are even.
fn crop_to_even(frame: FrameBuffer) -> FrameBuffer {
    let size = frame.resolution();
    let even = size.even_aligned();
    if even == size {
        return frame;
    }
    let src_stride = size.width as usize * 4;
    let dst_stride = even.width as usize * 4;
    let data = frame
        .data
        .chunks_exact(src_stride)
        .take(even.height as usize)
        .flat_map(|row| &row[..dst_stride])
        .copied()
        .collect();
    FrameBuffer { data, width: even.width, height: even.height, ..frame }
}

// ── CapturePipeline ───────────────────────────────────────────────────────────

struct PipelineState {
    backends: Backends,
    bitmap:   BitmapSettings,
    active:   Option<ActiveSession>,
}

impl PipelineState {
    fn teardown(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                active.close();
                true
            }
            None => false,
        }
    }
}

/// Owned handle to the process-wide capture pipeline.
pub struct CapturePipeline {
    state:  Mutex<PipelineState>,
    _claim: InstanceClaim,
}

impl CapturePipeline {
    /// Claim the process-wide pipeline slot.
    ///
    /// Fails with [`FramecastError::AlreadyActive`] while another pipeline is
    /// alive; dropping that pipeline frees the slot.
    pub fn new(backends: Backends) -> Result<Self, FramecastError> {
        let claim = InstanceClaim::acquire()?;
        Ok(Self {
            state: Mutex::new(PipelineState { backends, bitmap: BitmapSettings::default(), active: None }),
            _claim: claim,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().active.is_some()
    }

    /// Tear down any running session and open a new one from `config`.
    ///
    /// Bitmap-path settings are taken from `config`; only the active-clients
    /// switch carries over from earlier setter calls.
    pub fn initialize(&self, config: CaptureConfig) -> InitResult {
        let mut state = self.lock();
        state.teardown();

        let bitmap = state.bitmap.with_config(&config);
        state.bitmap = bitmap;
        info!(
            width = config.width,
            height = config.height,
            bitrate = config.bitrate,
            fps = config.effective_frame_rate(),
            prefer_hardware = config.prefer_hardware,
            "Initializing capture pipeline"
        );

        match ActiveSession::open(&mut state.backends, config, bitmap) {
            Ok(active) => {
                let size = active.output_size();
                let result = InitResult {
                    success: true,
                    width: size.width,
                    height: size.height,
                    encoder_enabled: active.encoder.is_some(),
                    hardware_active: active.fallback.hardware_active(),
                    capture_method: active.fallback.capture_method(),
                    encoder: active.fallback.encoder_name().map(str::to_owned),
                    error: None,
                    error_kind: None,
                };
                info!(
                    width = size.width,
                    height = size.height,
                    method = ?result.capture_method,
                    encoder = ?result.encoder,
                    hardware = result.hardware_active,
                    "Capture pipeline ready"
                );
                state.active = Some(active);
                result
            }
            Err(e) => {
                warn!(kind = ?e.kind(), "Initialize failed: {e}");
                InitResult::failed(&e)
            }
        }
    }

    /// Desktop size of the live session, or a probe when none is open.
    pub fn screen_info(&self) -> ScreenInfo {
        let mut state = self.lock();
        if let Some(active) = &state.active {
            let size = active.desktop_size();
            return ScreenInfo { width: size.width, height: size.height, initialized: true };
        }

        let size = state
            .backends
            .duplication
            .probe_desktop_size()
            .or_else(|_| (state.backends.bitmap)().screen_size())
            .unwrap_or_default();
        ScreenInfo { width: size.width, height: size.height, initialized: false }
    }

    /// Capture one frame and, when compression is on, push it through the encoder.
    ///
    /// Any error tears down the capture and encode sessions together.
    pub fn capture_frame(&self) -> CaptureFrameResult {
        self.capture_frame_at(Instant::now())
    }

    /// [`CapturePipeline::capture_frame`] with bitmap pacing measured at `now`.
    pub(crate) fn capture_frame_at(&self, now: Instant) -> CaptureFrameResult {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(active) = state.active.as_mut() else {
            return CaptureFrameResult::failed(&FramecastError::NotInitialized);
        };

        match active.capture(state.backends.transforms.as_mut(), now) {
            Ok(result) => {
                debug!(status = ?result.status, bytes = result.size.unwrap_or(0), "capture_frame");
                result
            }
            Err(e) => {
                warn!(kind = ?e.kind(), "Capture failed, tearing down session: {e}");
                state.teardown();
                CaptureFrameResult::failed(&e)
            }
        }
    }

    /// Stop the active session. Idempotent.
    pub fn stop_capture(&self) -> StopResult {
        self.lock().teardown();
        StopResult { success: true }
    }

    /// Stop the active session and restore default bitmap-path settings. Idempotent.
    pub fn cleanup(&self) -> StopResult {
        let mut state = self.lock();
        state.teardown();
        state.bitmap = BitmapSettings::default();
        StopResult { success: true }
    }

    pub fn set_quality(&self, quality: i64) {
        self.update_bitmap(|s| s.quality = FallbackSettings::clamp_quality(quality));
    }

    pub fn set_resolution_scale(&self, scale: f32) {
        self.update_bitmap(|s| s.scale = FallbackSettings::clamp_scale(scale));
    }

    pub fn set_target_fps(&self, fps: i64) {
        self.update_bitmap(|s| s.fps = FallbackSettings::clamp_fps(fps));
    }

    pub fn set_active_clients(&self, active: bool) {
        self.update_bitmap(|s| s.active_clients = active);
    }

    pub fn set_capture_cursor(&self, capture: bool) {
        self.update_bitmap(|s| s.capture_cursor = capture);
    }

    pub fn bitmap_settings(&self) -> BitmapSettings {
        self.lock().bitmap
    }

    fn update_bitmap(&self, update: impl FnOnce(&mut BitmapSettings)) {
        let mut state = self.lock();
        update(&mut state.bitmap);
        let settings = state.bitmap;
        debug!(?settings, "Bitmap settings updated");
        if let Some(active) = state.active.as_mut() {
            active.apply_bitmap_settings(settings);
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.lock().teardown();
    }
}
