//! Deterministic in-process display for tests and headless runs.
//!
//! Pixel `(x, y)` of frame `n` is `B = x, G = y, R = n, A = 255` (each mod 256),
//! so crops and row compaction can be checked byte for byte. Faults are queued
//! with [`SyntheticDisplay::push_steps`]; counters are read back with
//! [`SyntheticDisplay::stats`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use framecast_core::{CaptureError, Resolution};
use tracing::debug;

use crate::bitmap::BitmapGrabber;
use crate::device::{AcquireStatus, DeviceFault, DisplayDevice, DuplicationFactory, MappedSurface};

/// Extra bytes appended to every staging row.
const ROW_PADDING: usize = 64;

/// What the next acquisition does. An empty queue means [`Step::Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Frame,
    Timeout,
    /// Acquired with a zero present time.
    PointerOnly,
    AccessLost,
    /// Acquisition itself fails with a non-loss error.
    AcquireFails,
    /// Frame is acquired but the GPU copy fails.
    CopyFails,
    /// Frame is acquired and copied but mapping the staging surface fails.
    ReadFails,
    /// The desktop takes this size as the frame is acquired.
    Resize(Resolution),
}

/// Why [`DuplicationFactory::open`] should fail on the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFault {
    SessionLimit,
    NoDevice,
    Unsupported,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayStats {
    pub opens:               u64,
    pub open_devices:        usize,
    pub acquired:            u64,
    pub released:            u64,
    pub in_flight:           u64,
    pub double_releases:     u64,
    pub staging_allocations: u64,
}

#[derive(Default)]
struct DisplayState {
    desktop:      Resolution,
    steps:        VecDeque<Step>,
    open_fault:   Option<OpenFault>,
    always_fault: Option<OpenFault>,
    sequence:     u64,
    stats:        DisplayStats,
}

/// Shared handle to a fake primary output. Clones observe the same state.
#[derive(Clone, Default)]
pub struct SyntheticDisplay {
    state: Arc<Mutex<DisplayState>>,
}

impl SyntheticDisplay {
    pub fn new(desktop: Resolution) -> Self {
        let display = Self::default();
        display.lock().desktop = desktop;
        display
    }

    pub fn push_steps(&self, steps: impl IntoIterator<Item = Step>) {
        self.lock().steps.extend(steps);
    }

    pub fn set_desktop_size(&self, desktop: Resolution) {
        self.lock().desktop = desktop;
    }

    /// Fail the next `open` only.
    pub fn deny_next_open(&self, fault: OpenFault) {
        self.lock().open_fault = Some(fault);
    }

    /// Fail every `open` until cleared with `None`.
    pub fn deny_all_opens(&self, fault: Option<OpenFault>) {
        self.lock().always_fault = fault;
    }

    pub fn stats(&self) -> DisplayStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, DisplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DuplicationFactory for SyntheticDisplay {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn probe_desktop_size(&mut self) -> Result<Resolution, CaptureError> {
        Ok(self.lock().desktop)
    }

    fn open(&mut self) -> Result<Box<dyn DisplayDevice>, CaptureError> {
        let mut state = self.lock();
        if let Some(fault) = state.open_fault.take().or(state.always_fault) {
            return Err(match fault {
                OpenFault::SessionLimit => CaptureError::DuplicationUnavailable {
                    reason: "too many active duplication sessions".into(),
                },
                OpenFault::NoDevice => CaptureError::DeviceCreationFailed {
                    reason: "no synthetic adapter".into(),
                },
                OpenFault::Unsupported => CaptureError::Unsupported {
                    reason: "duplication disabled on synthetic display".into(),
                },
            });
        }
        state.stats.opens += 1;
        state.stats.open_devices += 1;
        drop(state);

        Ok(Box::new(SyntheticDevice {
            display:   self.clone(),
            staging:   Resolution::default(),
            pixels:    Vec::new(),
            row_pitch: 0,
            held:      None,
        }))
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

struct SyntheticDevice {
    display:   SyntheticDisplay,
    staging:   Resolution,
    pixels:    Vec<u8>,
    row_pitch: usize,
    /// Step and sequence number of the currently held frame.
    held:      Option<(Step, u64)>,
}

impl DisplayDevice for SyntheticDevice {
    fn desktop_size(&self) -> Resolution {
        self.display.lock().desktop
    }

    fn create_staging(&mut self, size: Resolution) -> Result<(), DeviceFault> {
        self.row_pitch = size.width as usize * 4 + ROW_PADDING;
        self.pixels = vec![0; self.row_pitch * size.height as usize];
        self.staging = size;
        self.display.lock().stats.staging_allocations += 1;
        Ok(())
    }

    fn acquire_next_frame(&mut self, timeout: Duration) -> Result<AcquireStatus, DeviceFault> {
        let mut state = self.display.lock();
        let step = state.steps.pop_front().unwrap_or(Step::Frame);
        debug!(?step, timeout_ms = timeout.as_millis() as u64, "synthetic acquire");
        match step {
            Step::Timeout => return Ok(AcquireStatus::Timeout),
            Step::AccessLost => return Err(DeviceFault::AccessLost("synthetic device removed".into())),
            Step::AcquireFails => return Err(DeviceFault::Failed("synthetic acquire failure".into())),
            Step::Resize(desktop) => state.desktop = desktop,
            _ => {}
        }
        state.sequence += 1;
        state.stats.acquired += 1;
        state.stats.in_flight += 1;
        self.held = Some((step, state.sequence));
        let last_present = if step == Step::PointerOnly { 0 } else { state.sequence as i64 };
        Ok(AcquireStatus::Acquired { last_present })
    }

    fn copy_to_staging(&mut self, region: Resolution) -> Result<(), DeviceFault> {
        let Some((step, sequence)) = self.held else {
            return Err(DeviceFault::Failed("no frame held".into()));
        };
        if step == Step::CopyFails {
            return Err(DeviceFault::Failed("synthetic copy failure".into()));
        }
        if region != self.staging {
            return Err(DeviceFault::Failed(format!(
                "region {region} does not match staging {}",
                self.staging
            )));
        }
        for y in 0..region.height as usize {
            for x in 0..region.width as usize {
                let i = y * self.row_pitch + x * 4;
                self.pixels[i..i + 4].copy_from_slice(&[x as u8, y as u8, sequence as u8, 255]);
            }
        }
        Ok(())
    }

    fn read_staging(&mut self, read: &mut dyn FnMut(MappedSurface<'_>)) -> Result<(), DeviceFault> {
        if matches!(self.held, Some((Step::ReadFails, _))) {
            return Err(DeviceFault::Failed("synthetic map failure".into()));
        }
        read(MappedSurface { data: &self.pixels, row_pitch: self.row_pitch });
        Ok(())
    }

    fn release_frame(&mut self) -> Result<(), DeviceFault> {
        let mut state = self.display.lock();
        if self.held.take().is_some() {
            state.stats.released += 1;
            state.stats.in_flight -= 1;
        } else {
            state.stats.double_releases += 1;
        }
        Ok(())
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        let mut state = self.display.lock();
        state.stats.open_devices = state.stats.open_devices.saturating_sub(1);
    }
}

// ── Bitmap grabber ────────────────────────────────────────────────────────────

/// Bitmap-copy grabber over a solid-gray synthetic screen.
#[derive(Clone)]
pub struct SyntheticGrabber {
    state: Arc<Mutex<GrabberState>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrabberStats {
    pub grabs:        u64,
    pub last_target:  Option<Resolution>,
    pub last_cursor:  bool,
}

struct GrabberState {
    screen: Resolution,
    fail:   bool,
    stats:  GrabberStats,
}

impl SyntheticGrabber {
    pub fn new(screen: Resolution) -> Self {
        Self {
            state: Arc::new(Mutex::new(GrabberState {
                screen,
                fail: false,
                stats: GrabberStats::default(),
            })),
        }
    }

    pub fn set_screen_size(&self, screen: Resolution) {
        self.lock().screen = screen;
    }

    pub fn set_failing(&self, fail: bool) {
        self.lock().fail = fail;
    }

    pub fn stats(&self) -> GrabberStats {
        self.lock().stats.clone()
    }

    fn lock(&self) -> MutexGuard<'_, GrabberState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BitmapGrabber for SyntheticGrabber {
    fn name(&self) -> &'static str {
        "synthetic-bitmap"
    }

    fn screen_size(&mut self) -> Result<Resolution, CaptureError> {
        Ok(self.lock().screen)
    }

    fn grab(&mut self, target: Resolution, capture_cursor: bool) -> Result<Vec<u8>, CaptureError> {
        let mut state = self.lock();
        if state.fail {
            return Err(CaptureError::AcquireFailed { reason: "synthetic bitmap copy failure".into() });
        }
        state.stats.grabs += 1;
        state.stats.last_target = Some(target);
        state.stats.last_cursor = capture_cursor;
        Ok([96, 96, 96, 255].repeat(target.width as usize * target.height as usize))
    }
}
