//! In-process H.264 transform stand-in for tests and headless runs.
//!
//! Output is Annex-B shaped (start codes, SPS/PPS before the first IDR) but the
//! slice payloads are not decodable video.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{BufMut, Bytes, BytesMut};
use framecast_core::{EncodeError, EncodedPacket, PixelFormat, PlaneBuffer};

use crate::transform::{
    InputFormat, OutputFormat, Transform, TransformClass, TransformInfo, TransformOutput,
    TransformProvider,
};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub activations:           u64,
    pub live_transforms:       u64,
    pub begin_streaming_calls: u64,
    pub end_of_streams:        u64,
    pub last_output:           Option<OutputFormat>,
    pub last_input:            Option<InputFormat>,
    pub last_input_pts:        Option<i64>,
}

struct ProviderState {
    hardware:                bool,
    software:                bool,
    hardware_rejects_formats: bool,
    warmup:                  usize,
    /// Fail `process_output` once this many pulls have succeeded.
    fail_after:              Option<u64>,
    pulls:                   u64,
    stats:                   ProviderStats,
}

/// Provider with one hardware and one software transform, both configurable.
#[derive(Clone)]
pub struct SyntheticProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl Default for SyntheticProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticProvider {
    /// Both classes available, three frames of warm-up latency.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProviderState {
                hardware: true,
                software: true,
                hardware_rejects_formats: false,
                warmup: 3,
                fail_after: None,
                pulls: 0,
                stats: ProviderStats::default(),
            })),
        }
    }

    pub fn set_hardware_available(&self, available: bool) {
        self.lock().hardware = available;
    }

    pub fn set_software_available(&self, available: bool) {
        self.lock().software = available;
    }

    /// Hardware transforms enumerate and activate but refuse media types.
    pub fn set_hardware_rejects_formats(&self, reject: bool) {
        self.lock().hardware_rejects_formats = reject;
    }

    /// Frames buffered before the first packet comes out.
    pub fn set_warmup(&self, frames: usize) {
        self.lock().warmup = frames;
    }

    pub fn fail_output_after(&self, pulls: u64) {
        let mut state = self.lock();
        state.fail_after = Some(state.pulls + pulls);
    }

    pub fn stats(&self) -> ProviderStats {
        self.lock().stats.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<ProviderState>) -> MutexGuard<'_, ProviderState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransformProvider for SyntheticProvider {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn enumerate(&mut self, class: TransformClass) -> Vec<TransformInfo> {
        let state = self.lock();
        let (available, name) = match class {
            TransformClass::Hardware => (state.hardware, "synthetic-hw"),
            TransformClass::Software => (state.software, "synthetic-sw"),
        };
        if available {
            vec![TransformInfo { name: name.into(), class }]
        } else {
            Vec::new()
        }
    }

    fn activate(&mut self, info: &TransformInfo) -> Result<Box<dyn Transform>, EncodeError> {
        let mut state = self.lock();
        state.stats.activations += 1;
        state.stats.live_transforms += 1;
        let rejects_formats = info.class == TransformClass::Hardware && state.hardware_rejects_formats;
        Ok(Box::new(SyntheticTransform {
            provider: Arc::clone(&self.state),
            info: info.clone(),
            rejects_formats,
            gop: 60,
            queue: VecDeque::new(),
            emitted: 0,
            payload_len: 0,
        }))
    }
}

// ── Transform ─────────────────────────────────────────────────────────────────

struct SyntheticTransform {
    provider:        Arc<Mutex<ProviderState>>,
    info:            TransformInfo,
    rejects_formats: bool,
    gop:             u64,
    /// Buffered (pts, duration) pairs.
    queue:           VecDeque<(i64, i64)>,
    emitted:         u64,
    payload_len:     usize,
}

impl SyntheticTransform {
    fn packet(&mut self, pts: i64, duration: i64) -> EncodedPacket {
        let is_keyframe = self.emitted % self.gop == 0;
        self.emitted += 1;

        let mut buf = BytesMut::with_capacity(self.payload_len + 32);
        if is_keyframe {
            buf.put_slice(&START_CODE);
            buf.put_slice(&[0x67, 0x42, 0xC0, 0x1F]);
            buf.put_slice(&START_CODE);
            buf.put_slice(&[0x68, 0xCE, 0x3C, 0x80]);
        }
        buf.put_slice(&START_CODE);
        buf.put_u8(if is_keyframe { 0x65 } else { 0x41 });
        buf.put_bytes((self.emitted & 0x7F) as u8, self.payload_len.max(1));

        EncodedPacket { data: Bytes::from(buf), pts, duration, is_keyframe }
    }
}

impl Transform for SyntheticTransform {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn class(&self) -> TransformClass {
        self.info.class
    }

    fn set_output_format(&mut self, format: &OutputFormat) -> Result<(), EncodeError> {
        if self.rejects_formats {
            return Err(EncodeError::InvalidConfiguration {
                reason: format!("{} rejected output type", self.info.name),
            });
        }
        self.gop = (format.frame_rate as u64 * 2).max(1);
        // Roughly one frame's share of the bitrate, kept small for tests.
        self.payload_len = (format.bitrate / 8 / format.frame_rate.max(1)).min(4096) as usize;
        lock(&self.provider).stats.last_output = Some(format.clone());
        Ok(())
    }

    fn set_input_format(&mut self, format: &InputFormat) -> Result<(), EncodeError> {
        if format.pixel_format != PixelFormat::Nv12 {
            return Err(EncodeError::InvalidConfiguration {
                reason: format!("{} accepts NV12 input only", self.info.name),
            });
        }
        lock(&self.provider).stats.last_input = Some(format.clone());
        Ok(())
    }

    fn begin_streaming(&mut self) -> Result<(), EncodeError> {
        self.queue.clear();
        self.emitted = 0;
        lock(&self.provider).stats.begin_streaming_calls += 1;
        Ok(())
    }

    fn process_input(&mut self, _planes: &PlaneBuffer, pts: i64, duration: i64) -> Result<(), EncodeError> {
        self.queue.push_back((pts, duration));
        lock(&self.provider).stats.last_input_pts = Some(pts);
        Ok(())
    }

    fn process_output(&mut self) -> Result<TransformOutput, EncodeError> {
        let warmup = {
            let mut state = lock(&self.provider);
            if state.fail_after.is_some_and(|limit| state.pulls >= limit) {
                return Err(EncodeError::TransformFailed {
                    reason: format!("{}: injected failure", self.info.name),
                });
            }
            state.pulls += 1;
            state.warmup
        };

        if self.queue.len() <= warmup {
            return Ok(TransformOutput::NeedMoreInput);
        }
        match self.queue.pop_front() {
            Some((pts, duration)) => Ok(TransformOutput::Packet(self.packet(pts, duration))),
            None => Ok(TransformOutput::NeedMoreInput),
        }
    }

    fn end_of_stream(&mut self) -> Result<(), EncodeError> {
        self.queue.clear();
        lock(&self.provider).stats.end_of_streams += 1;
        Ok(())
    }
}

impl Drop for SyntheticTransform {
    fn drop(&mut self) {
        let mut state = lock(&self.provider);
        state.stats.live_transforms = state.stats.live_transforms.saturating_sub(1);
    }
}
