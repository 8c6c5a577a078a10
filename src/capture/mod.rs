//! Capture device probing and vendor bridge initialization
//!
//! Translates capture device identifiers into observed capabilities without
//! opening a streaming session. Two device classes exist:
//!
//! - Plain V4L2 capture nodes, queried through the standard capture ioctls.
//! - HDMI-over-MIPI bridge devices, which expose the incoming HDMI timing on
//!   a V4L2 sub-device and require an explicit active-format handshake
//!   before the first capture.
//!
//! Probing is bounded and never raises: a device that cannot be queried is
//! reported as having no signal, and the supervisor treats that as an
//! operational state rather than an error.

pub mod bridge;
pub mod enumerate;
pub mod probe;

pub use bridge::initialize_bridge;
pub use enumerate::{enumerate_capture_nodes, CaptureNode};
pub use probe::{probe, CaptureCapabilities, PROBE_TIMEOUT_MS};

use crate::config::CameraConfig;

/// Probe a configured camera without disturbing a running capture.
///
/// Bridge devices are inspected through their sub-device only (the capture
/// node may be owned by a streaming pipeline); plain devices are queried
/// directly.
pub fn probe_camera(camera: &CameraConfig) -> CaptureCapabilities {
    match &camera.bridge_subdev {
        Some(subdev) => bridge::probe_subdev(subdev, camera.fps),
        None => probe(&camera.device),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraConfig;

    #[test]
    fn test_probe_camera_missing_device_reports_no_signal() {
        let camera = CameraConfig {
            device: "/dev/video-does-not-exist".to_string(),
            bridge_subdev: None,
            ..CameraConfig::default()
        };
        let caps = probe_camera(&camera);
        assert!(!caps.has_signal);
    }

    #[test]
    fn test_probe_camera_missing_subdev_reports_no_signal() {
        let camera = CameraConfig {
            device: "/dev/video-does-not-exist".to_string(),
            bridge_subdev: Some("/dev/v4l-subdev-does-not-exist".to_string()),
            ..CameraConfig::default()
        };
        let caps = probe_camera(&camera);
        assert!(!caps.has_signal);
    }
}
