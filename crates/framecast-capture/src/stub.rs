//! Capture backends for platforms without a duplication or bitmap-copy mechanism.

use framecast_core::{CaptureError, Resolution};

use crate::bitmap::BitmapGrabber;
use crate::device::{DisplayDevice, DuplicationFactory};

fn unsupported(what: &str) -> CaptureError {
    CaptureError::Unsupported {
        reason: format!("{what} is not available on {}", std::env::consts::OS),
    }
}

#[derive(Debug, Default)]
pub struct StubFactory;

impl DuplicationFactory for StubFactory {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn probe_desktop_size(&mut self) -> Result<Resolution, CaptureError> {
        Err(unsupported("output duplication"))
    }

    fn open(&mut self) -> Result<Box<dyn DisplayDevice>, CaptureError> {
        tracing::warn!("Output duplication requested on an unsupported platform");
        Err(unsupported("output duplication"))
    }
}

#[derive(Debug, Default)]
pub struct StubGrabber;

impl BitmapGrabber for StubGrabber {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn screen_size(&mut self) -> Result<Resolution, CaptureError> {
        Err(unsupported("bitmap screen copy"))
    }

    fn grab(&mut self, _target: Resolution, _capture_cursor: bool) -> Result<Vec<u8>, CaptureError> {
        Err(unsupported("bitmap screen copy"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_reports_unsupported() {
        assert!(matches!(StubFactory.open().err(), Some(CaptureError::Unsupported { .. })));
        assert!(matches!(StubGrabber.screen_size(), Err(CaptureError::Unsupported { .. })));
    }
}
