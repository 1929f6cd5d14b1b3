//! DXGI Desktop Duplication backend.
//!
//! ```text
//! D3D11CreateDevice (hardware, BGRA support)
//!   │  IDXGIDevice → GetAdapter → EnumOutputs(0)
//!   ▼
//! IDXGIOutput1::DuplicateOutput
//!   │  AcquireNextFrame(timeout)
//!   ▼
//! desktop ID3D11Texture2D ─ CopyResource / CopySubresourceRegion ─► staging texture
//!   │  Map(READ)
//!   ▼
//! rows (RowPitch) ─► CaptureSession compaction ─► FrameBuffer
//! ```

use std::time::Duration;

use framecast_core::{CaptureError, Resolution};
use tracing::{debug, info};
use windows::{
    core::Interface,
    Win32::{
        Foundation::{E_ACCESSDENIED, RECT},
        Graphics::{
            Direct3D::D3D_DRIVER_TYPE_HARDWARE,
            Direct3D11::{
                D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
                D3D11_BIND_FLAG, D3D11_BOX, D3D11_CPU_ACCESS_READ,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ,
                D3D11_RESOURCE_MISC_FLAG, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC,
                D3D11_USAGE_STAGING,
            },
            Dxgi::{
                Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC},
                IDXGIDevice, IDXGIOutput, IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
                DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET,
                DXGI_ERROR_NOT_CURRENTLY_AVAILABLE,
                DXGI_ERROR_SESSION_DISCONNECTED, DXGI_ERROR_UNSUPPORTED, DXGI_ERROR_WAIT_TIMEOUT,
                DXGI_OUTDUPL_FRAME_INFO,
            },
        },
    },
};

use crate::device::{AcquireStatus, DeviceFault, DisplayDevice, DuplicationFactory, MappedSurface};

// ── Factory ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct DxgiFactory;

impl DuplicationFactory for DxgiFactory {
    fn name(&self) -> &'static str {
        "dxgi"
    }

    fn probe_desktop_size(&mut self) -> Result<Resolution, CaptureError> {
        let (_, _, output) = create_device()?;
        output_size(&output).map_err(|e| CaptureError::DeviceCreationFailed {
            reason: format!("IDXGIOutput::GetDesc: {e}"),
        })
    }

    fn open(&mut self) -> Result<Box<dyn DisplayDevice>, CaptureError> {
        let (device, context, output) = create_device()?;
        let desktop = output_size(&output).map_err(|e| CaptureError::DeviceCreationFailed {
            reason: format!("IDXGIOutput::GetDesc: {e}"),
        })?;

        let output1: IDXGIOutput1 = output.cast().map_err(|e| CaptureError::Unsupported {
            reason: format!("IDXGIOutput1 not supported: {e}"),
        })?;
        let duplication = unsafe { output1.DuplicateOutput(&device) }.map_err(|e| {
            let code = e.code();
            if code == DXGI_ERROR_NOT_CURRENTLY_AVAILABLE {
                CaptureError::DuplicationUnavailable {
                    reason: format!("session limit reached: {e}"),
                }
            } else if code == E_ACCESSDENIED || code == DXGI_ERROR_SESSION_DISCONNECTED {
                CaptureError::DuplicationUnavailable { reason: e.to_string() }
            } else if code == DXGI_ERROR_UNSUPPORTED {
                CaptureError::Unsupported { reason: format!("DuplicateOutput: {e}") }
            } else {
                CaptureError::DeviceCreationFailed { reason: format!("DuplicateOutput: {e}") }
            }
        })?;

        info!("DXGI duplication open on primary output ({desktop})");
        Ok(Box::new(DxgiDevice {
            device,
            context,
            output,
            duplication,
            desktop,
            staging: None,
            staging_size: Resolution::default(),
            frame: None,
        }))
    }
}

fn create_device() -> Result<(ID3D11Device, ID3D11DeviceContext, IDXGIOutput), CaptureError> {
    let mut device: Option<ID3D11Device> = None;
    let mut context: Option<ID3D11DeviceContext> = None;
    unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            None,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
    }
    .map_err(|e| CaptureError::DeviceCreationFailed { reason: format!("D3D11CreateDevice: {e}") })?;

    let (Some(device), Some(context)) = (device, context) else {
        return Err(CaptureError::DeviceCreationFailed {
            reason: "D3D11CreateDevice returned no device".into(),
        });
    };

    let fail = |what: &str, e: windows::core::Error| CaptureError::DeviceCreationFailed {
        reason: format!("{what}: {e}"),
    };
    let dxgi_device: IDXGIDevice = device.cast().map_err(|e| fail("cast IDXGIDevice", e))?;
    let adapter = unsafe { dxgi_device.GetAdapter() }.map_err(|e| fail("GetAdapter", e))?;
    let output = unsafe { adapter.EnumOutputs(0) }.map_err(|e| fail("EnumOutputs(0)", e))?;
    Ok((device, context, output))
}

fn output_size(output: &IDXGIOutput) -> windows::core::Result<Resolution> {
    let desc = unsafe { output.GetDesc() }?;
    Ok(rect_size(&desc.DesktopCoordinates))
}

fn rect_size(rect: &RECT) -> Resolution {
    Resolution::new(
        (rect.right - rect.left).max(0) as u32,
        (rect.bottom - rect.top).max(0) as u32,
    )
}

// ── Device ────────────────────────────────────────────────────────────────────

struct DxgiDevice {
    device:       ID3D11Device,
    context:      ID3D11DeviceContext,
    output:       IDXGIOutput,
    duplication:  IDXGIOutputDuplication,
    desktop:      Resolution,
    staging:      Option<ID3D11Texture2D>,
    staging_size: Resolution,
    /// Desktop texture of the currently held frame.
    frame:        Option<ID3D11Texture2D>,
}

// SAFETY: the immediate context and duplication are only used from one thread
// at a time; the owning pipeline serializes every call behind its mutex.
unsafe impl Send for DxgiDevice {}

impl DisplayDevice for DxgiDevice {
    fn desktop_size(&self) -> Resolution {
        output_size(&self.output).unwrap_or(self.desktop)
    }

    fn create_staging(&mut self, size: Resolution) -> Result<(), DeviceFault> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width:          size.width,
            Height:         size.height,
            MipLevels:      1,
            ArraySize:      1,
            Format:         DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc:     DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage:          D3D11_USAGE_STAGING,
            BindFlags:      D3D11_BIND_FLAG(0).0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags:      D3D11_RESOURCE_MISC_FLAG(0).0 as u32,
        };
        let mut tex: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut tex)) }.map_err(fault)?;
        self.staging = Some(tex.ok_or_else(|| DeviceFault::Failed("CreateTexture2D returned nothing".into()))?);
        self.staging_size = size;
        debug!("DXGI staging texture {size}");
        Ok(())
    }

    fn acquire_next_frame(&mut self, timeout: Duration) -> Result<AcquireStatus, DeviceFault> {
        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;

        match unsafe { self.duplication.AcquireNextFrame(timeout_ms, &mut info, &mut resource) } {
            Ok(()) => {}
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(AcquireStatus::Timeout),
            Err(e) => return Err(fault(e)),
        }

        let texture = match resource.map(|r| r.cast::<ID3D11Texture2D>()) {
            Some(Ok(texture)) => texture,
            other => {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                return Err(match other {
                    Some(Err(e)) => fault(e),
                    _ => DeviceFault::Failed("AcquireNextFrame returned no resource".into()),
                });
            }
        };
        self.frame = Some(texture);
        Ok(AcquireStatus::Acquired { last_present: info.LastPresentTime })
    }

    fn copy_to_staging(&mut self, region: Resolution) -> Result<(), DeviceFault> {
        let (Some(frame), Some(staging)) = (&self.frame, &self.staging) else {
            return Err(DeviceFault::Failed("no frame held or staging texture missing".into()));
        };
        if region != self.staging_size {
            return Err(DeviceFault::Failed(format!(
                "region {region} does not match staging {}",
                self.staging_size
            )));
        }

        unsafe {
            if region == self.desktop {
                self.context.CopyResource(staging, frame);
            } else {
                let src = D3D11_BOX {
                    left: 0,
                    top: 0,
                    front: 0,
                    right: region.width,
                    bottom: region.height,
                    back: 1,
                };
                self.context.CopySubresourceRegion(staging, 0, 0, 0, 0, frame, 0, Some(&src));
            }
        }
        Ok(())
    }

    fn read_staging(&mut self, read: &mut dyn FnMut(MappedSurface<'_>)) -> Result<(), DeviceFault> {
        let Some(staging) = &self.staging else {
            return Err(DeviceFault::Failed("staging texture missing".into()));
        };

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { self.context.Map(staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) }.map_err(fault)?;

        let row_pitch = mapped.RowPitch as usize;
        let len = row_pitch * self.staging_size.height as usize;
        // SAFETY: the mapping covers RowPitch × Height bytes until Unmap.
        let data = unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, len) };
        read(MappedSurface { data, row_pitch });

        unsafe { self.context.Unmap(staging, 0) };
        Ok(())
    }

    fn release_frame(&mut self) -> Result<(), DeviceFault> {
        self.frame = None;
        unsafe { self.duplication.ReleaseFrame() }.map_err(fault)
    }
}

fn fault(e: windows::core::Error) -> DeviceFault {
    // A removed or reset device invalidates the duplication just like a mode change.
    let code = e.code();
    if code == DXGI_ERROR_ACCESS_LOST || code == DXGI_ERROR_DEVICE_REMOVED || code == DXGI_ERROR_DEVICE_RESET {
        DeviceFault::AccessLost(e.to_string())
    } else {
        DeviceFault::Failed(e.to_string())
    }
}
