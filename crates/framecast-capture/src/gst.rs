//! X11 duplication backend built on GStreamer.
//!
//! ```text
//! ximagesrc (root window, no pointer)
//!     │
//! videoconvert
//!     │
//! video/x-raw,format=BGRx
//!     │
//! appsink (max-buffers=1, drop) ──► try_pull_sample(timeout)
//! ```
//!
//! A pulled sample plays the role of an acquired frame: it is held until
//! `release_frame`. A bus error or EOS is treated as loss of the output.

use std::time::Duration;

use framecast_core::{CaptureError, Resolution};
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use tracing::{debug, info, warn};

use crate::device::{AcquireStatus, DeviceFault, DisplayDevice, DuplicationFactory, MappedSurface};

/// How long `open` waits for the first frame to learn the screen size.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
pub struct GstFactory;

impl DuplicationFactory for GstFactory {
    fn name(&self) -> &'static str {
        "gstreamer-ximagesrc"
    }

    fn probe_desktop_size(&mut self) -> Result<Resolution, CaptureError> {
        let device = GstDevice::start()?;
        Ok(device.desktop)
    }

    fn open(&mut self) -> Result<Box<dyn DisplayDevice>, CaptureError> {
        Ok(Box::new(GstDevice::start()?))
    }
}

/// A pulled BGRx sample and its row stride.
struct HeldFrame {
    sample: gstreamer::Sample,
    stride: usize,
    size:   Resolution,
}

struct GstDevice {
    pipeline:  gstreamer::Pipeline,
    appsink:   AppSink,
    desktop:   Resolution,
    /// First sample pulled during `start`, handed out by the first acquisition.
    pending:   Option<HeldFrame>,
    held:      Option<HeldFrame>,
    staging:   Vec<u8>,
    staging_size: Resolution,
}

impl GstDevice {
    fn start() -> Result<Self, CaptureError> {
        gstreamer::init().map_err(|e| CaptureError::Unsupported {
            reason: format!("GStreamer init: {e}"),
        })?;

        let desc = "ximagesrc use-damage=false show-pointer=false \
                    ! videoconvert \
                    ! video/x-raw,format=BGRx \
                    ! appsink name=sink max-buffers=1 drop=true sync=false emit-signals=false";
        debug!("GStreamer capture pipeline: {}", desc);

        let pipeline = gstreamer::parse::launch(desc)
            .map_err(|e| CaptureError::Unsupported { reason: format!("ximagesrc pipeline: {e}") })?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| CaptureError::DeviceCreationFailed { reason: "expected Pipeline element".into() })?;

        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<AppSink>().ok())
            .ok_or_else(|| CaptureError::DeviceCreationFailed { reason: "appsink 'sink' missing".into() })?;

        pipeline.set_state(gstreamer::State::Playing).map_err(|e| {
            let _ = pipeline.set_state(gstreamer::State::Null);
            CaptureError::DuplicationUnavailable { reason: format!("ximagesrc set Playing: {e}") }
        })?;

        let first = appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(FIRST_FRAME_TIMEOUT.as_millis() as u64))
            .ok_or_else(|| CaptureError::DuplicationUnavailable {
                reason: "no frame from ximagesrc within 2s (no X display?)".into(),
            })
            .and_then(|sample| {
                held_frame(sample).map_err(|reason| CaptureError::DeviceCreationFailed { reason })
            });
        let first = match first {
            Ok(first) => first,
            Err(e) => {
                let _ = pipeline.set_state(gstreamer::State::Null);
                return Err(e);
            }
        };

        let desktop = first.size;
        info!("GStreamer ximagesrc capture started ({desktop})");
        Ok(Self {
            pipeline,
            appsink,
            desktop,
            pending: Some(first),
            held: None,
            staging: Vec::new(),
            staging_size: Resolution::default(),
        })
    }

    /// Error or EOS posted on the bus since the last check.
    fn bus_failure(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gstreamer::MessageType::Error, gstreamer::MessageType::Eos])?;
        match msg.view() {
            gstreamer::MessageView::Error(e) => Some(e.error().to_string()),
            _ => Some("end of stream".into()),
        }
    }
}

fn held_frame(sample: gstreamer::Sample) -> Result<HeldFrame, String> {
    let caps = sample.caps().ok_or("sample without caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).map_err(|e| e.to_string())?;
    let stride = info.stride().first().copied().unwrap_or(0).max(0) as usize;
    let size = Resolution::new(info.width(), info.height());
    Ok(HeldFrame { sample, stride, size })
}

impl DisplayDevice for GstDevice {
    fn desktop_size(&self) -> Resolution {
        self.desktop
    }

    fn create_staging(&mut self, size: Resolution) -> Result<(), DeviceFault> {
        self.staging = vec![0; size.packed_len()];
        self.staging_size = size;
        Ok(())
    }

    fn acquire_next_frame(&mut self, timeout: Duration) -> Result<AcquireStatus, DeviceFault> {
        let frame = match self.pending.take() {
            Some(frame) => frame,
            None => {
                let ms = timeout.as_millis() as u64;
                match self.appsink.try_pull_sample(gstreamer::ClockTime::from_mseconds(ms)) {
                    Some(sample) => held_frame(sample).map_err(DeviceFault::Failed)?,
                    None => {
                        if let Some(reason) = self.bus_failure() {
                            return Err(DeviceFault::AccessLost(reason));
                        }
                        if self.appsink.is_eos() {
                            return Err(DeviceFault::AccessLost("appsink reached EOS".into()));
                        }
                        return Ok(AcquireStatus::Timeout);
                    }
                }
            }
        };

        if frame.size != self.desktop {
            info!(from = %self.desktop, to = %frame.size, "X screen size changed");
            self.desktop = frame.size;
        }
        let pts = frame
            .sample
            .buffer()
            .and_then(|b| b.pts())
            .map(|t| t.nseconds() as i64)
            .unwrap_or(0);
        self.held = Some(frame);
        // Every pulled sample is a full new image; never report a zero present time.
        Ok(AcquireStatus::Acquired { last_present: pts.max(1) })
    }

    fn copy_to_staging(&mut self, region: Resolution) -> Result<(), DeviceFault> {
        let Some(frame) = &self.held else {
            return Err(DeviceFault::Failed("no frame held".into()));
        };
        if region != self.staging_size || region.width > frame.size.width || region.height > frame.size.height {
            return Err(DeviceFault::Failed(format!(
                "region {region} does not fit staging {} / frame {}",
                self.staging_size, frame.size
            )));
        }
        let buffer = frame.sample.buffer().ok_or_else(|| DeviceFault::Failed("sample without buffer".into()))?;
        let map = buffer.map_readable().map_err(|e| DeviceFault::Failed(e.to_string()))?;
        let src = map.as_slice();

        let row_bytes = region.width as usize * 4;
        for (y, dst) in self.staging.chunks_exact_mut(row_bytes).enumerate() {
            let start = y * frame.stride;
            let row = src
                .get(start..start + row_bytes)
                .ok_or_else(|| DeviceFault::Failed(format!("buffer too short at row {y}")))?;
            dst.copy_from_slice(row);
        }
        Ok(())
    }

    fn read_staging(&mut self, read: &mut dyn FnMut(MappedSurface<'_>)) -> Result<(), DeviceFault> {
        read(MappedSurface {
            data:      &self.staging,
            row_pitch: self.staging_size.width as usize * 4,
        });
        Ok(())
    }

    fn release_frame(&mut self) -> Result<(), DeviceFault> {
        self.held = None;
        Ok(())
    }
}

impl Drop for GstDevice {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            warn!("GStreamer capture pipeline shutdown: {e}");
        }
    }
}
