use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error surfaced by the pipeline facade.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FramecastError {
    #[error("Initialization failed: {reason}")]
    InitializationFailure { reason: String },

    #[error("Desktop duplication unavailable: {reason}")]
    DuplicationUnavailable { reason: String },

    #[error("Access lost, reinitialize required: {reason}")]
    AccessLost { reason: String },

    /// A frame could not be copied, read back or compressed on a running session.
    #[error("Capture failed, reinitialize required: {reason}")]
    CaptureFailure { reason: String },

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(#[from] FrameSizeError),

    #[error("No H.264 encoder available (hardware and software enumeration failed)")]
    NoEncoderAvailable,

    #[error("Encoder failure: {reason}")]
    EncodeFailure { reason: String },

    #[error("Not initialized")]
    NotInitialized,

    #[error("A capture pipeline is already active in this process")]
    AlreadyActive,
}

impl FramecastError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InitializationFailure { .. } => ErrorKind::InitializationFailure,
            Self::DuplicationUnavailable { .. } => ErrorKind::DuplicationUnavailable,
            Self::AccessLost { .. } => ErrorKind::AccessLost,
            Self::CaptureFailure { .. } => ErrorKind::CaptureFailure,
            Self::InvalidFrameSize(_) => ErrorKind::InvalidFrameSize,
            Self::NoEncoderAvailable => ErrorKind::NoEncoderAvailable,
            Self::EncodeFailure { .. } => ErrorKind::EncodeFailure,
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::AlreadyActive => ErrorKind::AlreadyActive,
        }
    }
}

impl From<CaptureError> for FramecastError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::DuplicationUnavailable { reason } => Self::DuplicationUnavailable { reason },
            CaptureError::AccessLost { reason } => Self::AccessLost { reason },
            CaptureError::NotOpen => Self::NotInitialized,
            err @ (CaptureError::AcquireFailed { .. } | CaptureError::CompressionFailed { .. }) => {
                Self::CaptureFailure { reason: err.to_string() }
            }
            other => Self::InitializationFailure { reason: other.to_string() },
        }
    }
}

impl From<EncodeError> for FramecastError {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::NoEncoderAvailable => Self::NoEncoderAvailable,
            EncodeError::InvalidFrameSize(e) => Self::InvalidFrameSize(e),
            EncodeError::InvalidConfiguration { reason } => Self::InitializationFailure { reason },
            other => Self::EncodeFailure { reason: other.to_string() },
        }
    }
}

/// Serializable error category for callers across the external boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InitializationFailure,
    DuplicationUnavailable,
    AccessLost,
    CaptureFailure,
    InvalidFrameSize,
    NoEncoderAvailable,
    EncodeFailure,
    NotInitialized,
    AlreadyActive,
}

impl ErrorKind {
    /// Worth calling `initialize` again after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DuplicationUnavailable | Self::AccessLost | Self::CaptureFailure)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Failed to create capture device: {reason}")]
    DeviceCreationFailed { reason: String },

    #[error("Desktop duplication unavailable: {reason}")]
    DuplicationUnavailable { reason: String },

    #[error("Access to the duplicated output was lost: {reason}")]
    AccessLost { reason: String },

    #[error("Capture mechanism not supported here: {reason}")]
    Unsupported { reason: String },

    #[error("Frame acquisition failed: {reason}")]
    AcquireFailed { reason: String },

    #[error("Still image compression failed: {reason}")]
    CompressionFailed { reason: String },

    #[error("Capture session is not open")]
    NotOpen,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("No H.264 transform available after hardware and software enumeration")]
    NoEncoderAvailable,

    #[error("Invalid encoder configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Encoder is {actual}, operation requires {expected}")]
    InvalidState { expected: &'static str, actual: &'static str },

    #[error("Transform failure: {reason}")]
    TransformFailed { reason: String },

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(#[from] FrameSizeError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameSizeError {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("{width}×{height} cannot be subsampled to 4:2:0 (dimensions must be even and non-zero)")]
    Dimensions { width: u32, height: u32 },
}
