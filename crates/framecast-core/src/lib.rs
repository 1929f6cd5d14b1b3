pub mod config;
pub mod convert;
pub mod errors;
pub mod types;

pub use config::{CaptureConfig, FallbackSettings};
pub use errors::{CaptureError, EncodeError, ErrorKind, FrameSizeError, FramecastError};
pub use types::*;
