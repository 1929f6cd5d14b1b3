//! GStreamer H.264 transforms.
//!
//! | Element        | Class    | Notes |
//! |----------------|----------|-------|
//! | `nvh264enc`    | Hardware | NVIDIA NVENC |
//! | `vaapih264enc` | Hardware | Intel / AMD VA-API |
//! | `qsvh264enc`   | Hardware | Intel Quick Sync |
//! | `mfh264enc`    | Hardware | Windows Media Foundation |
//! | `x264enc`      | Software | gst-plugins-ugly |
//! | `openh264enc`  | Software | Cisco OpenH264 |
//!
//! ```text
//! appsrc (NV12, 100 ns timestamps → ns)
//!   → <encoder> (CBR, low latency)
//!   → video/x-h264,stream-format=byte-stream,alignment=au
//!   → h264parse (config-interval=-1: SPS/PPS on every IDR)
//!   → appsink
//! ```
//!
//! Each submitted sample is pushed synchronously and followed by one
//! `try_pull_sample`; an empty pull is reported as need-more-input.

use bytes::Bytes;
use framecast_core::{EncodeError, EncodedPacket, PixelFormat, PlaneBuffer};
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSrc};
use tracing::{debug, info, warn};

use crate::transform::{
    InputFormat, OutputFormat, Transform, TransformClass, TransformInfo, TransformOutput,
    TransformProvider,
};

/// How long one pull waits for the encoder after a push.
const PULL_TIMEOUT_MS: u64 = 10;

/// Element name and a property template; `{kbps}`, `{bps}` and `{gop}` are substituted.
const HARDWARE_CANDIDATES: &[(&str, &str)] = &[
    ("nvh264enc",    "rc-mode=cbr preset=low-latency-hq zerolatency=true bframes=0 bitrate={kbps} gop-size={gop}"),
    ("vaapih264enc", "rate-control=cbr quality-level=6 bitrate={kbps} keyframe-period={gop}"),
    ("qsvh264enc",   "rate-control=cbr low-latency=true bitrate={kbps} gop-size={gop}"),
    ("mfh264enc",    "rc-mode=cbr low-latency=true quality-vs-speed=100 bitrate={kbps} gop-size={gop}"),
];

const SOFTWARE_CANDIDATES: &[(&str, &str)] = &[
    ("x264enc",     "pass=cbr tune=zerolatency speed-preset=ultrafast bitrate={kbps} key-int-max={gop}"),
    ("openh264enc", "rate-control=bitrate complexity=low bitrate={bps} gop-size={gop}"),
];

fn candidates(class: TransformClass) -> &'static [(&'static str, &'static str)] {
    match class {
        TransformClass::Hardware => HARDWARE_CANDIDATES,
        TransformClass::Software => SOFTWARE_CANDIDATES,
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct GstProvider {
    initialized: bool,
}

impl GstProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_init(&mut self) -> bool {
        if !self.initialized {
            match gstreamer::init() {
                Ok(()) => self.initialized = true,
                Err(e) => warn!("GStreamer init failed: {e}"),
            }
        }
        self.initialized
    }
}

impl TransformProvider for GstProvider {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn enumerate(&mut self, class: TransformClass) -> Vec<TransformInfo> {
        if !self.ensure_init() {
            return Vec::new();
        }
        candidates(class)
            .iter()
            .filter(|(name, _)| gstreamer::ElementFactory::find(name).is_some())
            .map(|(name, _)| TransformInfo { name: (*name).to_string(), class })
            .collect()
    }

    fn activate(&mut self, info: &TransformInfo) -> Result<Box<dyn Transform>, EncodeError> {
        let props = candidates(info.class)
            .iter()
            .find(|(name, _)| *name == info.name)
            .map(|(_, props)| *props)
            .ok_or_else(|| EncodeError::InvalidConfiguration {
                reason: format!("unknown encoder element {}", info.name),
            })?;
        Ok(Box::new(GstTransform {
            info: info.clone(),
            props,
            output: None,
            pipeline: None,
        }))
    }
}

// ── Transform ─────────────────────────────────────────────────────────────────

struct Pipeline {
    pipeline: gstreamer::Pipeline,
    appsrc:   AppSrc,
    appsink:  AppSink,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

struct GstTransform {
    info:     TransformInfo,
    props:    &'static str,
    output:   Option<OutputFormat>,
    pipeline: Option<Pipeline>,
}

fn failed(what: &str, e: impl std::fmt::Display) -> EncodeError {
    EncodeError::TransformFailed { reason: format!("{what}: {e}") }
}

impl GstTransform {
    fn build(&self, output: &OutputFormat) -> Result<Pipeline, EncodeError> {
        let OutputFormat { width, height, frame_rate: fps, bitrate, .. } = *output;
        let props = self
            .props
            .replace("{kbps}", &(bitrate / 1000).max(1).to_string())
            .replace("{bps}", &bitrate.to_string())
            .replace("{gop}", &(fps * 2).to_string());

        let desc = format!(
            "appsrc name=src is-live=true format=time do-timestamp=false block=false \
               caps=\"video/x-raw,format=NV12,width={width},height={height},\
                      framerate={fps}/1,interlace-mode=progressive,pixel-aspect-ratio=1/1\" \
             ! {enc} {props} \
             ! video/x-h264,stream-format=byte-stream,alignment=au \
             ! h264parse config-interval=-1 \
             ! appsink name=sink sync=false max-buffers=8 emit-signals=false",
            enc = self.info.name,
        );
        debug!("GStreamer encode pipeline: {}", desc);

        let invalid = |what: &str, e: &dyn std::fmt::Display| EncodeError::InvalidConfiguration {
            reason: format!("{}: {what}: {e}", self.info.name),
        };
        let pipeline = gstreamer::parse::launch(&desc)
            .map_err(|e| invalid("pipeline parse", &e))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| invalid("downcast", &"expected Pipeline"))?;
        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.downcast::<AppSrc>().ok())
            .ok_or_else(|| invalid("appsrc", &"missing"))?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<AppSink>().ok())
            .ok_or_else(|| invalid("appsink", &"missing"))?;

        // Reaching Paused proves the element accepts the caps and properties.
        pipeline
            .set_state(gstreamer::State::Paused)
            .map_err(|e| invalid("set Paused", &e))?;

        Ok(Pipeline { pipeline, appsrc, appsink })
    }

    fn pipeline(&self) -> Result<&Pipeline, EncodeError> {
        self.pipeline.as_ref().ok_or_else(|| EncodeError::TransformFailed {
            reason: format!("{} not negotiated", self.info.name),
        })
    }

    fn bus_error(&self) -> Option<String> {
        let bus = self.pipeline.as_ref()?.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gstreamer::MessageType::Error])?;
        match msg.view() {
            gstreamer::MessageView::Error(e) => Some(e.error().to_string()),
            _ => None,
        }
    }
}

impl Transform for GstTransform {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn class(&self) -> TransformClass {
        self.info.class
    }

    fn set_output_format(&mut self, format: &OutputFormat) -> Result<(), EncodeError> {
        self.output = Some(format.clone());
        Ok(())
    }

    fn set_input_format(&mut self, format: &InputFormat) -> Result<(), EncodeError> {
        let output = self.output.clone().ok_or_else(|| EncodeError::InvalidConfiguration {
            reason: "output format must be set before input format".into(),
        })?;
        if format.pixel_format != PixelFormat::Nv12
            || (format.width, format.height, format.frame_rate) != (output.width, output.height, output.frame_rate)
        {
            return Err(EncodeError::InvalidConfiguration {
                reason: format!("{} input {:?} does not match output", self.info.name, format),
            });
        }
        self.pipeline = Some(self.build(&output)?);
        Ok(())
    }

    fn begin_streaming(&mut self) -> Result<(), EncodeError> {
        let p = self.pipeline()?;
        p.pipeline.set_state(gstreamer::State::Playing).map_err(|e| failed("set Playing", e))?;
        info!("[{}] Encode pipeline running", self.info.name);
        Ok(())
    }

    fn process_input(&mut self, planes: &PlaneBuffer, pts: i64, duration: i64) -> Result<(), EncodeError> {
        let p = self.pipeline()?;
        let mut buffer = gstreamer::Buffer::from_slice(planes.data.clone());
        if let Some(buf) = buffer.get_mut() {
            // 100 ns ticks → ns.
            buf.set_pts(gstreamer::ClockTime::from_nseconds(pts.max(0) as u64 * 100));
            buf.set_duration(gstreamer::ClockTime::from_nseconds(duration.max(0) as u64 * 100));
        }
        p.appsrc.push_buffer(buffer).map_err(|e| failed("push_buffer", e))?;
        Ok(())
    }

    fn process_output(&mut self) -> Result<TransformOutput, EncodeError> {
        let p = self.pipeline()?;
        let Some(sample) = p.appsink.try_pull_sample(gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT_MS)) else {
            if let Some(err) = self.bus_error() {
                return Err(failed("encoder error", err));
            }
            return Ok(TransformOutput::NeedMoreInput);
        };

        let buffer = sample.buffer().ok_or_else(|| failed("pull", "sample without buffer"))?;
        let map = buffer.map_readable().map_err(|e| failed("map", e))?;
        let to_ticks = |t: gstreamer::ClockTime| (t.nseconds() / 100) as i64;
        Ok(TransformOutput::Packet(EncodedPacket {
            data:        Bytes::copy_from_slice(map.as_slice()),
            pts:         buffer.pts().map(to_ticks).unwrap_or(0),
            duration:    buffer.duration().map(to_ticks).unwrap_or(0),
            is_keyframe: !buffer.flags().contains(gstreamer::BufferFlags::DELTA_UNIT),
        }))
    }

    fn end_of_stream(&mut self) -> Result<(), EncodeError> {
        let Some(p) = self.pipeline.take() else { return Ok(()) };
        p.appsrc.end_of_stream().map_err(|e| failed("end_of_stream", e))?;
        // Drain what the encoder flushes so the pipeline can reach Null cleanly.
        while p.appsink.try_pull_sample(gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT_MS)).is_some() {}
        Ok(())
    }
}
