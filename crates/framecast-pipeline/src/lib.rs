//! framecast-pipeline: composes capture, conversion and encoding behind one facade.
//!
//! [`CapturePipeline`] is the entry point for a host runtime: it owns the
//! process-wide session, picks the capture mechanism and encoder through
//! [`FallbackController`], and answers every call with a serializable result.
//! The bitmap-copy path is paced by [`FrameScheduler`].

pub mod bitmap;
pub mod facade;
pub mod fallback;
pub mod scheduler;

pub use bitmap::{BitmapCaptureSession, BitmapOutcome, BitmapSettings, StillImage};
pub use facade::{
    Backends, CaptureFrameResult, CapturePipeline, FrameStatus, InitResult, ScreenInfo, StopResult,
};
pub use fallback::{falls_back_to_bitmap, CaptureStrategy, FallbackController};
pub use scheduler::{plan_capture, CapturePlan, FrameScheduler};
