//! Push/pull compression transform seam.
//!
//! A [`TransformProvider`] enumerates H.264 transforms by class and activates
//! one; the [`Transform`] is then negotiated (output format first, then input
//! format), started, and fed one NV12 sample at a time.

use framecast_core::{EncodeError, EncodedPacket, PixelFormat, PlaneBuffer};

/// Hardware-accelerated or CPU-only transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformClass {
    Hardware,
    Software,
}

impl std::fmt::Display for TransformClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hardware => write!(f, "hardware"),
            Self::Software => write!(f, "software"),
        }
    }
}

/// An enumerated transform that can be activated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformInfo {
    pub name:  String,
    pub class: TransformClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    ConstantBitrate,
}

/// Compressed output type: H.264, progressive, low latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFormat {
    pub width:        u32,
    pub height:       u32,
    pub frame_rate:   u32,
    /// Bits per second.
    pub bitrate:      u32,
    pub rate_control: RateControl,
    pub progressive:  bool,
    pub low_latency:  bool,
}

/// Uncompressed input type: same size and rate as the output, 4:2:0 planar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFormat {
    pub width:        u32,
    pub height:       u32,
    pub frame_rate:   u32,
    pub pixel_format: PixelFormat,
}

/// Result of one pull from a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutput {
    Packet(EncodedPacket),
    /// The transform is buffering input; not an error.
    NeedMoreInput,
}

pub trait Transform: Send {
    fn name(&self) -> &str;

    fn class(&self) -> TransformClass;

    fn set_output_format(&mut self, format: &OutputFormat) -> Result<(), EncodeError>;

    fn set_input_format(&mut self, format: &InputFormat) -> Result<(), EncodeError>;

    /// Start of stream; drops any stale internal state.
    fn begin_streaming(&mut self) -> Result<(), EncodeError>;

    /// Feed one sample. `pts` and `duration` are in 100 ns ticks.
    fn process_input(&mut self, planes: &PlaneBuffer, pts: i64, duration: i64) -> Result<(), EncodeError>;

    fn process_output(&mut self) -> Result<TransformOutput, EncodeError>;

    /// Signal end of stream and flush.
    fn end_of_stream(&mut self) -> Result<(), EncodeError>;
}

pub trait TransformProvider: Send {
    fn name(&self) -> &'static str;

    /// Available H.264 transforms of `class`, best first.
    fn enumerate(&mut self, class: TransformClass) -> Vec<TransformInfo>;

    fn activate(&mut self, info: &TransformInfo) -> Result<Box<dyn Transform>, EncodeError>;
}
