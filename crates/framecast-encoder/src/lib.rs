//! framecast-encoder: H.264 encode session.
//!
//! [`EncodeSession`] owns one compression [`Transform`] selected through a
//! [`TransformProvider`]: hardware transforms first when preferred, then a
//! single fallback to software. Frames are submitted as NV12
//! [`framecast_core::PlaneBuffer`]s and each submission attempts exactly one
//! pull, yielding a packet or [`EncodeOutcome::NeedsMoreInput`] during warm-up.
//!
//! Providers:
//! - [`synthetic::SyntheticProvider`]: deterministic stand-in for tests and headless runs
//! - `gst::GstProvider`: GStreamer encoder elements (feature `gstreamer`)

pub mod session;
pub mod synthetic;
pub mod transform;

#[cfg(feature = "gstreamer")]
pub mod gst;

pub use session::{EncodeOutcome, EncodeSession, EncoderSettings, EncoderState};
pub use transform::{
    InputFormat, OutputFormat, RateControl, Transform, TransformClass, TransformInfo,
    TransformOutput, TransformProvider,
};

/// Transform provider for this build.
///
/// Without the `gstreamer` feature no real encoder is compiled in and the
/// returned provider enumerates nothing, so compression fails with
/// `NoEncoderAvailable`.
pub fn platform_provider() -> Box<dyn TransformProvider> {
    #[cfg(feature = "gstreamer")]
    return Box::new(gst::GstProvider::new());
    #[cfg(not(feature = "gstreamer"))]
    return Box::new(NoTransforms);
}

#[cfg(not(feature = "gstreamer"))]
struct NoTransforms;

#[cfg(not(feature = "gstreamer"))]
impl TransformProvider for NoTransforms {
    fn name(&self) -> &'static str {
        "none"
    }

    fn enumerate(&mut self, _class: TransformClass) -> Vec<TransformInfo> {
        Vec::new()
    }

    fn activate(&mut self, info: &TransformInfo) -> Result<Box<dyn Transform>, framecast_core::EncodeError> {
        Err(framecast_core::EncodeError::InvalidConfiguration {
            reason: format!("{} is not compiled in", info.name),
        })
    }
}
