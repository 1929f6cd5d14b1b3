//! GDI bitmap-copy grabber for the primary screen.
//!
//! `GetDC(NULL)` → compatible DC + bitmap → `StretchBlt` (HALFTONE) → `GetDIBits`
//! as a top-down 32-bit DIB. Each GDI handle is wrapped in a guard that frees it
//! on every exit path.

use framecast_core::{CaptureError, Resolution};
use tracing::debug;
use windows::Win32::{
    Foundation::HWND,
    Graphics::Gdi::{
        CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC, GetDIBits,
        ReleaseDC, SelectObject, SetStretchBltMode, StretchBlt, BITMAPINFO, BITMAPINFOHEADER,
        BI_RGB, CAPTUREBLT, DIB_RGB_COLORS, HALFTONE, HBITMAP, HDC, HGDIOBJ, SRCCOPY,
    },
    UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN},
};

use crate::bitmap::BitmapGrabber;

#[derive(Debug, Default)]
pub struct GdiGrabber;

impl BitmapGrabber for GdiGrabber {
    fn name(&self) -> &'static str {
        "gdi"
    }

    fn screen_size(&mut self) -> Result<Resolution, CaptureError> {
        let (w, h) = unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
        if w <= 0 || h <= 0 {
            return Err(CaptureError::DeviceCreationFailed {
                reason: format!("GetSystemMetrics reported {w}x{h}"),
            });
        }
        Ok(Resolution::new(w as u32, h as u32))
    }

    fn grab(&mut self, target: Resolution, capture_cursor: bool) -> Result<Vec<u8>, CaptureError> {
        let screen = self.screen_size()?;
        let screen_dc = ScreenDc::get()?;
        let memory_dc = MemoryDc::compatible(&screen_dc)?;
        let bitmap = Bitmap::compatible(&screen_dc, target)?;
        let _selected = memory_dc.select(&bitmap);

        let mut rop = SRCCOPY;
        if capture_cursor {
            rop |= CAPTUREBLT;
        }
        let copied = unsafe {
            SetStretchBltMode(memory_dc.0, HALFTONE);
            StretchBlt(
                memory_dc.0,
                0,
                0,
                target.width as i32,
                target.height as i32,
                screen_dc.hdc,
                0,
                0,
                screen.width as i32,
                screen.height as i32,
                rop,
            )
        };
        if !copied.as_bool() {
            return Err(CaptureError::AcquireFailed { reason: "StretchBlt failed".into() });
        }

        let mut info = BITMAPINFO {
            bmiHeader: BITMAPINFOHEADER {
                biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: target.width as i32,
                // Negative height: top-down rows.
                biHeight: -(target.height as i32),
                biPlanes: 1,
                biBitCount: 32,
                biCompression: BI_RGB.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut pixels = vec![0u8; target.packed_len()];
        let lines = unsafe {
            GetDIBits(
                memory_dc.0,
                bitmap.0,
                0,
                target.height,
                Some(pixels.as_mut_ptr().cast()),
                &mut info,
                DIB_RGB_COLORS,
            )
        };
        if lines != target.height as i32 {
            return Err(CaptureError::AcquireFailed {
                reason: format!("GetDIBits copied {lines} of {} lines", target.height),
            });
        }

        debug!(screen = %screen, target = %target, cursor = capture_cursor, "GDI bitmap copy");
        Ok(pixels)
    }
}

// ── Handle guards ─────────────────────────────────────────────────────────────

struct ScreenDc {
    hdc: HDC,
}

impl ScreenDc {
    fn get() -> Result<Self, CaptureError> {
        let hdc = unsafe { GetDC(HWND::default()) };
        if hdc.is_invalid() {
            return Err(CaptureError::DeviceCreationFailed { reason: "GetDC(NULL) failed".into() });
        }
        Ok(Self { hdc })
    }
}

impl Drop for ScreenDc {
    fn drop(&mut self) {
        unsafe { ReleaseDC(HWND::default(), self.hdc) };
    }
}

struct MemoryDc(HDC);

impl MemoryDc {
    fn compatible(screen: &ScreenDc) -> Result<Self, CaptureError> {
        let hdc = unsafe { CreateCompatibleDC(screen.hdc) };
        if hdc.is_invalid() {
            return Err(CaptureError::DeviceCreationFailed { reason: "CreateCompatibleDC failed".into() });
        }
        Ok(Self(hdc))
    }

    fn select<'a>(&'a self, bitmap: &Bitmap) -> Selection<'a> {
        let previous = unsafe { SelectObject(self.0, HGDIOBJ::from(bitmap.0)) };
        Selection { dc: self, previous }
    }
}

impl Drop for MemoryDc {
    fn drop(&mut self) {
        let _ = unsafe { DeleteDC(self.0) };
    }
}

/// Restores the DC's previous object so the bitmap can be deleted.
struct Selection<'a> {
    dc:       &'a MemoryDc,
    previous: HGDIOBJ,
}

impl Drop for Selection<'_> {
    fn drop(&mut self) {
        unsafe { SelectObject(self.dc.0, self.previous) };
    }
}

struct Bitmap(HBITMAP);

impl Bitmap {
    fn compatible(screen: &ScreenDc, size: Resolution) -> Result<Self, CaptureError> {
        let bitmap = unsafe { CreateCompatibleBitmap(screen.hdc, size.width as i32, size.height as i32) };
        if bitmap.is_invalid() {
            return Err(CaptureError::DeviceCreationFailed {
                reason: format!("CreateCompatibleBitmap {size} failed"),
            });
        }
        Ok(Self(bitmap))
    }
}

impl Drop for Bitmap {
    fn drop(&mut self) {
        let _ = unsafe { DeleteObject(HGDIOBJ::from(self.0)) };
    }
}
