use std::time::Duration;

use framecast_core::{CaptureError, FrameBuffer, Resolution};
use tracing::{debug, info, trace, warn};

use crate::device::{AcquireStatus, DeviceFault, DisplayDevice, DuplicationFactory, MappedSurface};

/// Outcome of [`CaptureSession::acquire_frame`].
#[derive(Debug)]
pub enum AcquireOutcome {
    Frame(FrameBuffer),
    /// Nothing new was presented within the timeout. The session stays open.
    NoNewFrame,
}

/// Size of the staging surface and the desktop it was negotiated against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StagingSurface {
    size:       Resolution,
    desktop:    Resolution,
    generation: u64,
}

// ── FrameLease ────────────────────────────────────────────────────────────────

/// Holds an acquired frame; releases it exactly once, on every exit path.
struct FrameLease<'a> {
    device:   &'a mut dyn DisplayDevice,
    released: bool,
}

impl<'a> FrameLease<'a> {
    fn new(device: &'a mut dyn DisplayDevice) -> Self {
        Self { device, released: false }
    }

    fn device(&mut self) -> &mut dyn DisplayDevice {
        &mut *self.device
    }

    fn release(mut self) -> Result<(), DeviceFault> {
        self.released = true;
        self.device.release_frame()
    }
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(fault) = self.device.release_frame() {
                warn!("ReleaseFrame failed after aborted acquisition: {fault}");
            }
        }
    }
}

// ── CaptureSession ────────────────────────────────────────────────────────────

/// An open duplication binding on the primary output plus its staging surface.
///
/// Closing drops the device, which releases the duplication, adapter and
/// staging handles together.
pub struct CaptureSession {
    device:    Option<Box<dyn DisplayDevice>>,
    requested: Resolution,
    staging:   StagingSurface,
}

impl CaptureSession {
    /// Bind to the primary output and allocate a staging surface.
    ///
    /// A request with a zero dimension captures the native desktop size; a
    /// request larger than the desktop is clamped to it. The negotiated size is
    /// available from [`CaptureSession::size`].
    pub fn open(
        factory: &mut dyn DuplicationFactory,
        requested: Resolution,
    ) -> Result<Self, CaptureError> {
        let mut device = factory.open()?;
        let desktop = device.desktop_size();
        if desktop.is_unset() {
            return Err(CaptureError::DeviceCreationFailed {
                reason: format!("{} reported an empty desktop ({desktop})", factory.name()),
            });
        }

        let size = resolve_capture_size(requested, desktop);
        device
            .create_staging(size)
            .map_err(|fault| CaptureError::DeviceCreationFailed {
                reason: format!("staging surface {size}: {fault}"),
            })?;

        info!(
            backend = factory.name(),
            desktop = %desktop,
            width = size.width,
            height = size.height,
            "Capture session open"
        );

        Ok(Self {
            device: Some(device),
            requested,
            staging: StagingSurface { size, desktop, generation: 1 },
        })
    }

    /// Negotiated capture size.
    pub fn size(&self) -> Resolution {
        self.staging.size
    }

    pub fn desktop_size(&self) -> Resolution {
        self.staging.desktop
    }

    /// Generation of the current staging surface; bumps whenever it is recreated.
    pub fn generation(&self) -> u64 {
        self.staging.generation
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Wait up to `timeout` for a new frame and copy it off the GPU.
    ///
    /// On [`CaptureError::AccessLost`] the session has already closed itself and
    /// must be reopened by the caller.
    pub fn acquire_frame(&mut self, timeout: Duration) -> Result<AcquireOutcome, CaptureError> {
        let Some(device) = self.device.as_mut() else {
            return Err(CaptureError::NotOpen);
        };

        let result = sync_staging(device.as_mut(), &mut self.staging, self.requested)
            .and_then(|()| acquire_into(device.as_mut(), &mut self.staging, self.requested, timeout));

        match result {
            Ok(outcome) => Ok(outcome),
            Err(DeviceFault::AccessLost(reason)) => {
                warn!("Duplication access lost ({reason}), closing capture session");
                self.close();
                Err(CaptureError::AccessLost { reason })
            }
            Err(DeviceFault::Failed(reason)) => Err(CaptureError::AcquireFailed { reason }),
        }
    }

    /// Release the device, duplication and staging surface. Idempotent.
    pub fn close(&mut self) {
        if self.device.take().is_some() {
            info!(width = self.staging.size.width, height = self.staging.size.height, "Capture session closed");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Capture size for a request against the current desktop.
pub fn resolve_capture_size(requested: Resolution, desktop: Resolution) -> Resolution {
    if requested.is_unset() {
        desktop
    } else {
        requested.clamped_to(desktop)
    }
}

/// Recreate the staging surface if the desktop size moved since it was allocated.
fn sync_staging(
    device: &mut dyn DisplayDevice,
    staging: &mut StagingSurface,
    requested: Resolution,
) -> Result<(), DeviceFault> {
    let desktop = device.desktop_size();
    if desktop == staging.desktop {
        return Ok(());
    }

    let size = resolve_capture_size(requested, desktop);
    if size != staging.size {
        device.create_staging(size)?;
        staging.generation += 1;
        info!(
            from = %staging.size,
            to = %size,
            generation = staging.generation,
            "Desktop size changed, staging surface recreated"
        );
    }
    staging.size = size;
    staging.desktop = desktop;
    Ok(())
}

fn acquire_into(
    device: &mut dyn DisplayDevice,
    staging: &mut StagingSurface,
    requested: Resolution,
    timeout: Duration,
) -> Result<AcquireOutcome, DeviceFault> {
    let last_present = match device.acquire_next_frame(timeout)? {
        AcquireStatus::Timeout => {
            trace!(timeout_ms = timeout.as_millis() as u64, "No new frame");
            return Ok(AcquireOutcome::NoNewFrame);
        }
        AcquireStatus::Acquired { last_present } => last_present,
    };

    let mut lease = FrameLease::new(device);
    if last_present == 0 {
        trace!("Pointer-only update, no new desktop image");
        return Ok(AcquireOutcome::NoNewFrame);
    }

    // Backends that learn the desktop size from the frame itself only report
    // a resize once that frame is held.
    sync_staging(lease.device(), staging, requested)?;

    let size = staging.size;
    lease.device().copy_to_staging(size)?;

    let mut data = Vec::with_capacity(size.packed_len());
    let mut compacted = Ok(());
    lease
        .device()
        .read_staging(&mut |mapped| compacted = compact_rows(&mapped, size, &mut data))?;
    compacted?;
    lease.release()?;

    debug!(bytes = data.len(), present = last_present, "Frame captured");
    Ok(AcquireOutcome::Frame(FrameBuffer {
        data,
        width: size.width,
        height: size.height,
        present_time: last_present,
        generation: staging.generation,
    }))
}

/// Copy the meaningful `width * 4` bytes of each row, dropping row-pitch padding.
pub(crate) fn compact_rows(
    mapped: &MappedSurface<'_>,
    size: Resolution,
    out: &mut Vec<u8>,
) -> Result<(), DeviceFault> {
    let row_bytes = size.width as usize * 4;
    let rows = size.height as usize;
    if rows == 0 {
        return Ok(());
    }
    let needed = mapped.row_pitch * (rows - 1) + row_bytes;
    if mapped.row_pitch < row_bytes || mapped.data.len() < needed {
        return Err(DeviceFault::Failed(format!(
            "mapped surface too small: pitch {} × {} rows, {} bytes for {size}",
            mapped.row_pitch,
            rows,
            mapped.data.len()
        )));
    }

    out.clear();
    for row in mapped.data.chunks(mapped.row_pitch).take(rows) {
        out.extend_from_slice(&row[..row_bytes]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{OpenFault, Step, SyntheticDisplay};

    const FHD: Resolution = Resolution::FHD;
    const TIMEOUT: Duration = Duration::from_millis(5);

    fn open(display: &SyntheticDisplay, requested: Resolution) -> CaptureSession {
        let mut factory = display.clone();
        CaptureSession::open(&mut factory, requested).unwrap()
    }

    fn frame(outcome: AcquireOutcome) -> FrameBuffer {
        match outcome {
            AcquireOutcome::Frame(f) => f,
            AcquireOutcome::NoNewFrame => panic!("expected a frame"),
        }
    }

    #[test]
    fn zero_request_uses_native_size() {
        let display = SyntheticDisplay::new(FHD);
        let session = open(&display, Resolution::new(0, 0));
        assert_eq!(session.size(), FHD);

        let session = open(&display, Resolution::new(1280, 0));
        assert_eq!(session.size(), FHD);
    }

    #[test]
    fn oversized_request_is_clamped_to_desktop() {
        let display = SyntheticDisplay::new(Resolution::HD);
        let session = open(&display, Resolution::new(4000, 600));
        assert_eq!(session.size(), Resolution::new(1280, 600));
    }

    #[test]
    fn frame_rows_are_compacted_to_width() {
        let display = SyntheticDisplay::new(Resolution::new(64, 16));
        let mut session = open(&display, Resolution::new(0, 0));
        let frame = frame(session.acquire_frame(TIMEOUT).unwrap());
        assert_eq!(frame.len(), 64 * 16 * 4);
        assert_eq!(frame.resolution(), Resolution::new(64, 16));
        // Pixel (x, y) carries x in blue and y in green.
        let px = |x: usize, y: usize| &frame.data[(y * 64 + x) * 4..(y * 64 + x) * 4 + 4];
        assert_eq!(px(0, 0)[..2], [0, 0]);
        assert_eq!(px(63, 15)[..2], [63, 15]);
        assert_eq!(px(10, 7)[..2], [10, 7]);
    }

    #[test]
    fn subregion_is_cropped_not_scaled() {
        let display = SyntheticDisplay::new(Resolution::new(64, 32));
        let mut session = open(&display, Resolution::new(16, 8));
        let frame = frame(session.acquire_frame(TIMEOUT).unwrap());
        assert_eq!(frame.len(), 16 * 8 * 4);
        let last = &frame.data[frame.len() - 4..];
        assert_eq!(last[..2], [15, 7]);
    }

    #[test]
    fn timeout_is_no_new_frame_and_session_stays_usable() {
        let display = SyntheticDisplay::new(FHD);
        display.push_steps([Step::Timeout, Step::Timeout]);
        let mut session = open(&display, FHD);

        assert!(matches!(session.acquire_frame(TIMEOUT).unwrap(), AcquireOutcome::NoNewFrame));
        assert!(matches!(session.acquire_frame(TIMEOUT).unwrap(), AcquireOutcome::NoNewFrame));
        assert!(session.is_open());
        frame(session.acquire_frame(TIMEOUT).unwrap());
        assert_eq!(display.stats().in_flight, 0);
    }

    #[test]
    fn pointer_only_update_is_released_as_no_new_frame() {
        let display = SyntheticDisplay::new(FHD);
        display.push_steps([Step::PointerOnly]);
        let mut session = open(&display, FHD);

        assert!(matches!(session.acquire_frame(TIMEOUT).unwrap(), AcquireOutcome::NoNewFrame));
        let stats = display.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn every_acquired_frame_is_released_once() {
        let display = SyntheticDisplay::new(Resolution::new(32, 32));
        display.push_steps([Step::Frame, Step::CopyFails, Step::Frame, Step::ReadFails, Step::Frame]);
        let mut session = open(&display, Resolution::new(0, 0));

        let mut errors = 0;
        for _ in 0..5 {
            if session.acquire_frame(TIMEOUT).is_err() {
                errors += 1;
            }
        }
        assert_eq!(errors, 2);
        let stats = display.stats();
        assert_eq!(stats.acquired, 5);
        assert_eq!(stats.released, 5);
        assert_eq!(stats.double_releases, 0);
        assert!(session.is_open());
    }

    #[test]
    fn access_lost_closes_session_and_reopen_succeeds() {
        let display = SyntheticDisplay::new(FHD);
        display.push_steps([Step::AccessLost]);
        let mut session = open(&display, FHD);

        let err = session.acquire_frame(TIMEOUT).unwrap_err();
        assert!(matches!(err, CaptureError::AccessLost { .. }));
        assert!(!session.is_open());
        assert_eq!(display.stats().open_devices, 0);
        assert_eq!(session.acquire_frame(TIMEOUT).unwrap_err(), CaptureError::NotOpen);

        let mut reopened = open(&display, FHD);
        assert_eq!(reopened.size(), FHD);
        frame(reopened.acquire_frame(TIMEOUT).unwrap());
        assert_eq!(display.stats().opens, 2);
    }

    #[test]
    fn session_limit_is_reported_distinctly() {
        let display = SyntheticDisplay::new(FHD);
        display.deny_next_open(OpenFault::SessionLimit);
        let mut factory = display.clone();
        let err = CaptureSession::open(&mut factory, FHD).err().unwrap();
        assert!(matches!(err, CaptureError::DuplicationUnavailable { .. }));

        // Transient: the next attempt goes through.
        assert!(CaptureSession::open(&mut factory, FHD).is_ok());
    }

    #[test]
    fn close_is_idempotent() {
        let display = SyntheticDisplay::new(FHD);
        let mut session = open(&display, FHD);
        session.close();
        session.close();
        assert!(!session.is_open());
        assert_eq!(display.stats().open_devices, 0);
    }

    #[test]
    fn desktop_resize_recreates_staging_and_bumps_generation() {
        let display = SyntheticDisplay::new(FHD);
        let mut session = open(&display, Resolution::new(0, 0));
        let before = frame(session.acquire_frame(TIMEOUT).unwrap());
        assert_eq!(before.generation, 1);

        display.set_desktop_size(Resolution::HD);
        let after = frame(session.acquire_frame(TIMEOUT).unwrap());
        assert_eq!(after.resolution(), Resolution::HD);
        assert_eq!(after.generation, 2);
        assert_eq!(session.size(), Resolution::HD);
        assert_eq!(display.stats().staging_allocations, 2);
    }

    #[test]
    fn resize_seen_during_acquisition_copies_at_new_size() {
        let display = SyntheticDisplay::new(FHD);
        let mut session = open(&display, Resolution::new(0, 0));
        frame(session.acquire_frame(TIMEOUT).unwrap());

        display.push_steps([Step::Resize(Resolution::HD), Step::Resize(FHD)]);
        let shrunk = frame(session.acquire_frame(TIMEOUT).unwrap());
        assert_eq!(shrunk.resolution(), Resolution::HD);
        assert_eq!(shrunk.generation, 2);
        assert!(session.is_open());

        let grown = frame(session.acquire_frame(TIMEOUT).unwrap());
        assert_eq!(grown.resolution(), FHD);
        assert_eq!(grown.generation, 3);

        let stats = display.stats();
        assert_eq!(stats.staging_allocations, 3);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.double_releases, 0);
    }

    #[test]
    fn compact_rows_rejects_short_mapping() {
        let data = vec![0u8; 10];
        let mapped = MappedSurface { data: &data, row_pitch: 8 };
        let mut out = Vec::new();
        assert!(compact_rows(&mapped, Resolution::new(2, 2), &mut out).is_err());
    }
}
