//! Bitmap-copy capture seam.
//!
//! The lower-fidelity path used when output duplication is unavailable: the
//! platform rasterizes the whole screen into a compatible bitmap, scaled to the
//! target size, and the result is compressed to a still image with
//! [`crate::jpeg::compress_bgra`].

use framecast_core::{CaptureError, Resolution};

pub trait BitmapGrabber: Send {
    fn name(&self) -> &'static str;

    /// Current size of the primary screen.
    fn screen_size(&mut self) -> Result<Resolution, CaptureError>;

    /// Copy the whole primary screen scaled to `target`, as packed BGRA
    /// (`target.packed_len()` bytes, top-down rows).
    fn grab(&mut self, target: Resolution, capture_cursor: bool) -> Result<Vec<u8>, CaptureError>;
}
