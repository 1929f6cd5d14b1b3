//! Platform seam for output duplication.
//!
//! A [`DuplicationFactory`] binds to the primary display output and hands back a
//! [`DisplayDevice`]. The device owns the adapter/output/duplication handles and
//! the GPU staging surface; [`crate::CaptureSession`] drives it.

use std::time::Duration;

use framecast_core::{CaptureError, Resolution};

/// Result of one blocking wait for a new desktop presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    /// Nothing was presented within the timeout. No frame is held.
    Timeout,
    /// A frame is held and must be released with [`DisplayDevice::release_frame`].
    ///
    /// `last_present` is 0 when only the pointer moved.
    Acquired { last_present: i64 },
}

/// Device-level failure during acquisition or readback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFault {
    /// The duplication binding is gone (mode change, secure desktop, driver reset).
    AccessLost(String),
    Failed(String),
}

impl std::fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessLost(reason) => write!(f, "access lost: {reason}"),
            Self::Failed(reason) => write!(f, "{reason}"),
        }
    }
}

/// CPU view of the mapped staging surface.
///
/// `row_pitch` may exceed `width * 4`; bytes past that in each row are padding.
pub struct MappedSurface<'a> {
    pub data:      &'a [u8],
    pub row_pitch: usize,
}

pub trait DisplayDevice: Send {
    /// Current size of the duplicated output.
    fn desktop_size(&self) -> Resolution;

    /// (Re)allocate the CPU-readable staging surface.
    fn create_staging(&mut self, size: Resolution) -> Result<(), DeviceFault>;

    /// Wait up to `timeout` for the next presented frame.
    fn acquire_next_frame(&mut self, timeout: Duration) -> Result<AcquireStatus, DeviceFault>;

    /// Copy the held frame into the staging surface.
    ///
    /// When `region` is smaller than the desktop, the top-left `region` is
    /// copied pixel for pixel; the frame is never scaled.
    fn copy_to_staging(&mut self, region: Resolution) -> Result<(), DeviceFault>;

    /// Map the staging surface for reading and hand it to `read`.
    fn read_staging(&mut self, read: &mut dyn FnMut(MappedSurface<'_>)) -> Result<(), DeviceFault>;

    /// Release the frame returned by the last successful acquisition.
    fn release_frame(&mut self) -> Result<(), DeviceFault>;
}

pub trait DuplicationFactory: Send {
    fn name(&self) -> &'static str;

    /// Native size of the primary output without opening a duplication session.
    fn probe_desktop_size(&mut self) -> Result<Resolution, CaptureError>;

    /// Bind to the primary output and start duplicating it.
    ///
    /// Returns [`CaptureError::DuplicationUnavailable`] when the platform denies
    /// the session (session limit reached, unsupported configuration).
    fn open(&mut self) -> Result<Box<dyn DisplayDevice>, CaptureError>;
}
