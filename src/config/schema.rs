use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Stable identifier for this unit, stamped on every event envelope
    pub device_id: String,
    /// Camera table, keyed by camera identifier
    pub cameras: BTreeMap<String, CameraConfig>,
    /// Recording storage settings
    pub recording: RecordingConfig,
    /// Media broker (RTSP republish) settings
    pub broker: BrokerConfig,
    /// Ingest supervisor tuning
    pub supervisor: SupervisorConfig,
    /// Event bus tuning
    pub events: EventBusConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        // Default camera table for the 2-input HDMI carrier board.
        let mut cameras = BTreeMap::new();
        cameras.insert(
            "cam1".to_string(),
            CameraConfig {
                device: "/dev/video60".to_string(),
                bridge_subdev: Some("/dev/v4l-subdev2".to_string()),
                ..CameraConfig::default()
            },
        );
        cameras.insert(
            "cam2".to_string(),
            CameraConfig {
                device: "/dev/video11".to_string(),
                bridge_subdev: Some("/dev/v4l-subdev5".to_string()),
                ..CameraConfig::default()
            },
        );

        Self {
            device_id: "camcore".to_string(),
            cameras,
            recording: RecordingConfig::default(),
            broker: BrokerConfig::default(),
            supervisor: SupervisorConfig::default(),
            events: EventBusConfig::default(),
        }
    }
}

/// How recording is produced for a camera.
///
/// A camera uses one variant for its entire pipeline lifetime; the two are
/// never mixed on the same input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingVariant {
    /// Recorders subscribe to the broker output and remux (default).
    /// Fault-isolating: a recorder crash cannot disturb the ingest side.
    Subscriber,
    /// In-pipeline tee with a frame-dropping valve on the recording branch.
    /// Keeps the encoded stream single-copy and the broker subscriber
    /// count at one.
    Valve,
}

/// Configuration for a single camera input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Capture device path (e.g., /dev/video60)
    pub device: String,
    /// V4L2 sub-device requiring the HDMI bridge handshake, if any
    /// (e.g., /dev/v4l-subdev2 for an LT6911 HDMI-to-MIPI bridge)
    pub bridge_subdev: Option<String>,
    /// Preview (broker) branch bitrate in kbit/s
    pub preview_bitrate_kbps: u32,
    /// Recording branch bitrate in kbit/s
    pub recording_bitrate_kbps: u32,
    /// Default capture width when the probe reports none
    pub width: u32,
    /// Default capture height when the probe reports none
    pub height: u32,
    /// Default framerate when the probe reports none
    pub fps: u32,
    /// Whether this camera participates in ingest
    pub enabled: bool,
    /// Recording variant for this camera
    pub variant: RecordingVariant,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            bridge_subdev: None,
            preview_bitrate_kbps: 4000,
            recording_bitrate_kbps: 12000,
            width: 1920,
            height: 1080,
            fps: 30,
            enabled: true,
            variant: RecordingVariant::Subscriber,
        }
    }
}

/// Recording storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecordingConfig {
    /// Root directory for recording files and session sidecars
    pub recordings_dir: PathBuf,
    /// Minimum free space (GB) required to start a session
    pub min_start_gb: f64,
    /// Free space (GB) below which an active session is force-stopped
    pub hard_stop_gb: f64,
    /// Monitor poll interval in seconds (file growth + disk space)
    pub monitor_interval_secs: u64,
    /// Consecutive flat polls before a stall event is raised
    pub stall_threshold: u32,
    /// Fragment duration for the fragmented-MP4 muxer, in milliseconds
    pub fragment_duration_ms: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("/mnt/sdcard/recordings"),
            min_start_gb: 5.0,
            hard_stop_gb: 1.0,
            monitor_interval_secs: 5,
            stall_threshold: 3,
            fragment_duration_ms: 1000,
        }
    }
}

/// Media broker configuration
///
/// The broker republishes each camera's encoded output over low-latency
/// transports; the core publishes to it over RTSP and subscriber recorders
/// pull from it at the same path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host (usually loopback, broker runs on the same unit)
    pub host: String,
    /// Broker RTSP port
    pub rtsp_port: u16,
}

impl BrokerConfig {
    /// RTSP URL for a camera's stream; the publish path is the camera id.
    pub fn rtsp_url(&self, cam_id: &str) -> String {
        format!("rtsp://{}:{}/{}", self.host, self.rtsp_port, cam_id)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            rtsp_port: 8554,
        }
    }
}

/// Ingest supervisor tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Health loop interval in seconds
    pub health_interval_secs: u64,
    /// Maximum automatic restart attempts after a pipeline error
    pub max_retries: u32,
    /// Delay after bridge re-initialization before restarting capture, ms
    pub settle_delay_ms: u64,
    /// Delay between per-camera stops in stop_all, ms
    /// (staggers teardown so the encoder pool is not hit all at once)
    pub inter_stop_delay_ms: u64,
    /// Delay between per-camera starts in start_all, ms
    pub inter_start_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 5,
            max_retries: 3,
            settle_delay_ms: 300,
            inter_stop_delay_ms: 200,
            inter_start_delay_ms: 200,
        }
    }
}

/// Event bus tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventBusConfig {
    /// Number of recent events retained for subscriber catch-up
    pub replay_buffer_size: usize,
    /// Heartbeat interval while at least one subscriber is connected, secs
    pub heartbeat_interval_secs: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            replay_buffer_size: 100,
            heartbeat_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtsp_url() {
        let broker = BrokerConfig::default();
        assert_eq!(broker.rtsp_url("cam1"), "rtsp://127.0.0.1:8554/cam1");
    }

    #[test]
    fn test_variant_serde_names() {
        let json = serde_json::to_string(&RecordingVariant::Subscriber).unwrap();
        assert_eq!(json, "\"subscriber\"");
        let v: RecordingVariant = serde_json::from_str("\"valve\"").unwrap();
        assert_eq!(v, RecordingVariant::Valve);
    }

    #[test]
    fn test_defaults_match_thresholds() {
        let rec = RecordingConfig::default();
        assert_eq!(rec.min_start_gb, 5.0);
        assert_eq!(rec.hard_stop_gb, 1.0);
        assert_eq!(rec.stall_threshold, 3);
    }
}
