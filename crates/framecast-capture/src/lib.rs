//! framecast-capture: desktop capture for the framecast pipeline.
//!
//! Two capture mechanisms sit behind small traits:
//!
//! | Mechanism | Seam | Windows | Other platforms |
//! |-----------|------|---------|-----------------|
//! | Output duplication | [`DuplicationFactory`] / [`DisplayDevice`] | DXGI Desktop Duplication | GStreamer `ximagesrc` (feature `gstreamer`) |
//! | Bitmap copy | [`BitmapGrabber`] | GDI `StretchBlt` | unsupported |
//!
//! [`CaptureSession`] drives a duplication device: blocking acquisition with a
//! timeout, staging readback with row-pitch compaction, and self-teardown on
//! device loss. Bitmap copies are compressed with [`jpeg::compress_bgra`].
//!
//! [`synthetic`] provides deterministic backends for tests and headless runs.

pub mod bitmap;
pub mod device;
pub mod jpeg;
pub mod session;
pub mod synthetic;

pub use bitmap::BitmapGrabber;
pub use device::{AcquireStatus, DeviceFault, DisplayDevice, DuplicationFactory, MappedSurface};
pub use session::{resolve_capture_size, AcquireOutcome, CaptureSession};

// ── Platform split ────────────────────────────────────────────────────────────

#[cfg(target_os = "windows")]
mod dxgi;
#[cfg(target_os = "windows")]
mod gdi;
#[cfg(target_os = "windows")]
pub use dxgi::DxgiFactory;
#[cfg(target_os = "windows")]
pub use gdi::GdiGrabber;

#[cfg(all(not(target_os = "windows"), feature = "gstreamer"))]
mod gst;
#[cfg(all(not(target_os = "windows"), feature = "gstreamer"))]
pub use gst::GstFactory;

#[cfg(not(target_os = "windows"))]
mod stub;
#[cfg(not(target_os = "windows"))]
pub use stub::{StubFactory, StubGrabber};

/// Duplication backend for the current platform.
pub fn platform_factory() -> Box<dyn DuplicationFactory> {
    #[cfg(target_os = "windows")]
    return Box::new(DxgiFactory);
    #[cfg(all(not(target_os = "windows"), feature = "gstreamer"))]
    return Box::new(GstFactory);
    #[cfg(all(not(target_os = "windows"), not(feature = "gstreamer")))]
    return Box::new(StubFactory);
}

/// Bitmap-copy backend for the current platform.
pub fn platform_grabber() -> Box<dyn BitmapGrabber> {
    #[cfg(target_os = "windows")]
    return Box::new(GdiGrabber);
    #[cfg(not(target_os = "windows"))]
    return Box::new(StubGrabber);
}
