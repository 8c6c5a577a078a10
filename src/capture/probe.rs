//! Non-intrusive capability probing for V4L2 capture nodes

use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use v4l::video::Capture;
use v4l::Device;

/// Upper bound on any single device probe. Misbehaving drivers can wedge
/// ioctls indefinitely; the probe thread is abandoned after this.
pub const PROBE_TIMEOUT_MS: u64 = 500;

/// Observed capabilities of a capture input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureCapabilities {
    pub has_signal: bool,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// FourCC tag of the active pixel format, opaque to callers
    pub pixel_format: String,
}

impl CaptureCapabilities {
    pub fn no_signal() -> Self {
        Self {
            has_signal: false,
            width: 0,
            height: 0,
            framerate: 0,
            pixel_format: String::new(),
        }
    }

    /// "WIDTHxHEIGHT" label, None without signal
    pub fn resolution_label(&self) -> Option<String> {
        self.has_signal
            .then(|| format!("{}x{}", self.width, self.height))
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.has_signal.then_some((self.width, self.height))
    }
}

/// Probe a capture node for signal presence, resolution and framerate.
///
/// Safe to call while another component holds a streaming handle on the
/// same device: only read-side ioctls are issued. Failures of any kind are
/// reported as `has_signal=false`.
pub fn probe(device: &str) -> CaptureCapabilities {
    run_with_timeout(device, Duration::from_millis(PROBE_TIMEOUT_MS), {
        let device = device.to_string();
        move || query_capture_node(&device)
    })
}

fn query_capture_node(device: &str) -> CaptureCapabilities {
    let path = Path::new(device);
    if !path.exists() {
        debug!("Capture node {} does not exist", device);
        return CaptureCapabilities::no_signal();
    }

    let dev = match Device::with_path(path) {
        Ok(dev) => dev,
        Err(e) => {
            debug!("Failed to open {}: {}", device, e);
            return CaptureCapabilities::no_signal();
        }
    };

    let format = match Capture::format(&dev) {
        Ok(format) => format,
        Err(e) => {
            debug!("Failed to query format on {}: {}", device, e);
            return CaptureCapabilities::no_signal();
        }
    };

    if format.width == 0 || format.height == 0 {
        return CaptureCapabilities::no_signal();
    }

    // Frame interval is advisory; a missing value is not a missing signal.
    let framerate = match Capture::params(&dev) {
        Ok(params) if params.interval.numerator > 0 => {
            params.interval.denominator / params.interval.numerator
        }
        _ => 0,
    };

    CaptureCapabilities {
        has_signal: true,
        width: format.width,
        height: format.height,
        framerate,
        pixel_format: format.fourcc.to_string(),
    }
}

/// Run a probe closure on a disposable thread, abandoning it on timeout.
///
/// The thread is detached rather than joined: a wedged ioctl must not take
/// the caller down with it.
pub(crate) fn run_with_timeout<F>(device: &str, timeout: Duration, probe_fn: F) -> CaptureCapabilities
where
    F: FnOnce() -> CaptureCapabilities + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(probe_fn());
    });

    match rx.recv_timeout(timeout) {
        Ok(caps) => caps,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!("Timed out probing {}", device);
            CaptureCapabilities::no_signal()
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => CaptureCapabilities::no_signal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_missing_device_is_no_signal() {
        let caps = probe("/dev/video-does-not-exist");
        assert!(!caps.has_signal);
        assert_eq!(caps.width, 0);
        assert!(caps.resolution_label().is_none());
    }

    #[test]
    fn test_probe_regular_file_is_no_signal() {
        // A plain file exists but is not a V4L2 device
        let file = tempfile::NamedTempFile::new().unwrap();
        let caps = probe(file.path().to_str().unwrap());
        assert!(!caps.has_signal);
    }

    #[test]
    fn test_timeout_abandons_wedged_probe() {
        let caps = run_with_timeout("/dev/video-wedged", Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_secs(10));
            CaptureCapabilities::no_signal()
        });
        assert!(!caps.has_signal);
    }

    #[test]
    fn test_resolution_label() {
        let caps = CaptureCapabilities {
            has_signal: true,
            width: 1920,
            height: 1080,
            framerate: 60,
            pixel_format: "NV12".to_string(),
        };
        assert_eq!(caps.resolution_label().as_deref(), Some("1920x1080"));
        assert_eq!(caps.resolution(), Some((1920, 1080)));
    }
}
