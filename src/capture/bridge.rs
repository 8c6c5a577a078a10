//! HDMI-over-MIPI bridge sub-device handshake
//!
//! Bridge chips (LT6911-class HDMI-to-MIPI converters behind the SoC's
//! camera interface) report the incoming HDMI timing on a V4L2 sub-device.
//! The capture node will not stream until its active format matches the
//! sub-device's, so before the first capture — and again after every signal
//! recovery or resolution change — the sub-device format is read and pushed
//! down onto the capture node.
//!
//! The standard `v4l` crate covers the capture node; the sub-device ioctls
//! are not part of the videodev2 capture API, so they are declared here
//! directly against the kernel ABI.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::video::Capture;
use v4l::Device;

use super::probe::{run_with_timeout, CaptureCapabilities, PROBE_TIMEOUT_MS};
use crate::error::{AppError, Result};

/// v4l2_subdev_format.which for the currently applied format
const V4L2_SUBDEV_FORMAT_ACTIVE: u32 = 1;

/// struct v4l2_mbus_framefmt (uapi/linux/v4l2-mediabus.h)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct MbusFramefmt {
    width: u32,
    height: u32,
    code: u32,
    field: u32,
    colorspace: u32,
    ycbcr_enc: u16,
    quantization: u16,
    xfer_func: u16,
    flags: u16,
    reserved: [u16; 10],
}

/// struct v4l2_subdev_format (uapi/linux/v4l2-subdev.h)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct SubdevFormat {
    which: u32,
    pad: u32,
    format: MbusFramefmt,
    stream: u32,
    reserved: [u32; 7],
}

/// struct v4l2_fract
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct Fract {
    numerator: u32,
    denominator: u32,
}

/// struct v4l2_subdev_frame_interval (uapi/linux/v4l2-subdev.h)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct SubdevFrameInterval {
    pad: u32,
    interval: Fract,
    stream: u32,
    reserved: [u32; 8],
}

// VIDIOC_SUBDEV_G_FMT = _IOWR('V', 4, struct v4l2_subdev_format)
nix::ioctl_readwrite!(vidioc_subdev_g_fmt, b'V', 4, SubdevFormat);
// VIDIOC_SUBDEV_G_FRAME_INTERVAL = _IOWR('V', 21, struct v4l2_subdev_frame_interval)
nix::ioctl_readwrite!(vidioc_subdev_g_frame_interval, b'V', 21, SubdevFrameInterval);

/// Read the sub-device's active resolution. `(0, 0)` means no HDMI signal.
fn read_subdev_format(subdev: &Path) -> Result<(u32, u32)> {
    let file = File::options()
        .read(true)
        .write(true)
        .open(subdev)
        .map_err(|e| AppError::CapabilitiesUnavailable {
            device: subdev.display().to_string(),
            reason: format!("open: {}", e),
        })?;

    let mut fmt = SubdevFormat {
        which: V4L2_SUBDEV_FORMAT_ACTIVE,
        pad: 0,
        ..SubdevFormat::default()
    };

    // SAFETY: fd is a valid open sub-device and fmt matches the kernel ABI
    unsafe { vidioc_subdev_g_fmt(file.as_raw_fd(), &mut fmt) }.map_err(|e| {
        AppError::CapabilitiesUnavailable {
            device: subdev.display().to_string(),
            reason: format!("VIDIOC_SUBDEV_G_FMT: {}", e),
        }
    })?;

    Ok((fmt.format.width, fmt.format.height))
}

/// Read the sub-device's frame interval as a framerate, if it reports one.
fn read_subdev_framerate(subdev: &Path) -> Option<u32> {
    let file = File::options().read(true).write(true).open(subdev).ok()?;

    let mut ival = SubdevFrameInterval::default();
    // SAFETY: fd is a valid open sub-device and ival matches the kernel ABI
    unsafe { vidioc_subdev_g_frame_interval(file.as_raw_fd(), &mut ival) }.ok()?;

    (ival.interval.numerator > 0)
        .then(|| ival.interval.denominator / ival.interval.numerator)
}

/// Probe a bridge camera through its sub-device only.
///
/// Used by the health loop: it never touches the capture node, so it is
/// safe while a pipeline owns the device. Framerate falls back to the
/// configured default when the sub-device does not report an interval.
pub fn probe_subdev(subdev: &str, default_fps: u32) -> CaptureCapabilities {
    run_with_timeout(subdev, Duration::from_millis(PROBE_TIMEOUT_MS), {
        let subdev = subdev.to_string();
        move || {
            let path = Path::new(&subdev);
            match read_subdev_format(path) {
                Ok((width, height)) if width > 0 && height > 0 => CaptureCapabilities {
                    has_signal: true,
                    width,
                    height,
                    framerate: read_subdev_framerate(path).unwrap_or(default_fps),
                    pixel_format: "NV12".to_string(),
                },
                Ok(_) => CaptureCapabilities::no_signal(),
                Err(e) => {
                    debug!("Sub-device probe failed on {}: {}", subdev, e);
                    CaptureCapabilities::no_signal()
                }
            }
        }
    })
}

/// Perform the bridge handshake: read the sub-device's active HDMI timing
/// and configure the capture node's format to match.
///
/// Idempotent — re-running against an unchanged signal re-applies the same
/// format. Returns the resulting capabilities; an input without signal is
/// reported as `has_signal=false`, not as an error.
pub fn initialize_bridge(device: &str, subdev: &str, default_fps: u32) -> Result<CaptureCapabilities> {
    let subdev_path = Path::new(subdev);
    let (width, height) = read_subdev_format(subdev_path)?;

    if width == 0 || height == 0 {
        debug!("No HDMI signal on bridge {}", subdev);
        return Ok(CaptureCapabilities::no_signal());
    }

    let framerate = read_subdev_framerate(subdev_path).unwrap_or(default_fps);

    let dev = Device::with_path(device).map_err(|e| AppError::CapabilitiesUnavailable {
        device: device.to_string(),
        reason: format!("open: {}", e),
    })?;

    let mut format = Capture::format(&dev).map_err(|e| AppError::CapabilitiesUnavailable {
        device: device.to_string(),
        reason: format!("get format: {}", e),
    })?;
    format.width = width;
    format.height = height;

    let applied =
        Capture::set_format(&dev, &format).map_err(|e| AppError::CapabilitiesUnavailable {
            device: device.to_string(),
            reason: format!("set format: {}", e),
        })?;

    if applied.width != width || applied.height != height {
        warn!(
            "Bridge {} requested {}x{}, capture node applied {}x{}",
            subdev, width, height, applied.width, applied.height
        );
    }

    info!(
        "Bridge initialized: {} -> {} at {}x{}@{}",
        subdev, device, applied.width, applied.height, framerate
    );

    Ok(CaptureCapabilities {
        has_signal: true,
        width: applied.width,
        height: applied.height,
        framerate,
        pixel_format: applied.fourcc.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // The ioctl declarations encode the kernel struct sizes; a mismatch
    // would corrupt the ioctl number and fail on real hardware only.
    #[test]
    fn test_subdev_struct_abi_sizes() {
        assert_eq!(std::mem::size_of::<MbusFramefmt>(), 48);
        assert_eq!(std::mem::size_of::<SubdevFormat>(), 88);
        assert_eq!(std::mem::size_of::<SubdevFrameInterval>(), 48);
    }

    #[test]
    fn test_probe_subdev_missing_node() {
        let caps = probe_subdev("/dev/v4l-subdev-does-not-exist", 30);
        assert!(!caps.has_signal);
    }

    #[test]
    fn test_initialize_bridge_missing_subdev_is_error() {
        let err = initialize_bridge("/dev/video60", "/dev/v4l-subdev-does-not-exist", 30)
            .unwrap_err();
        assert_eq!(err.kind(), "capabilities-unavailable");
    }
}
