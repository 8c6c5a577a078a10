//! Core configuration
//!
//! Typed configuration for the capture/recording core: the camera table,
//! storage thresholds, broker address and supervisor tuning. Loaded from a
//! TOML file with a small search path; missing file or missing sections
//! fall back to built-in defaults so the daemon can come up on a freshly
//! flashed unit.

mod schema;

pub use schema::{
    AppConfig, BrokerConfig, CameraConfig, EventBusConfig, RecordingConfig, RecordingVariant,
    SupervisorConfig,
};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{AppError, Result};

/// Default locations probed for the configuration file, in order.
const CONFIG_PATHS: &[&str] = &[
    "/etc/camcore/config.toml",
    "/opt/camcore/config.toml",
    "config.toml",
];

/// Load configuration from an explicit path or the default search path.
///
/// An explicit path that cannot be read or parsed is an error; an absent
/// file on the default search path is not.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(AppError::Config(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            Some(p.to_path_buf())
        }
        None => CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists()),
    };

    let Some(path) = path else {
        warn!("No config file found, using built-in defaults");
        return Ok(AppConfig::default());
    };

    let raw = std::fs::read_to_string(&path)?;
    let config: AppConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
    validate(&config)?;

    info!(
        "Loaded configuration from {} ({} cameras, {} enabled)",
        path.display(),
        config.cameras.len(),
        enabled_cameras(&config).len()
    );

    Ok(config)
}

/// Reject configurations that can never work.
///
/// Each capture device has exactly one owner, so two enabled cameras on
/// the same node (or the same bridge sub-device) is a contradiction, not
/// a runtime condition to retry.
pub fn validate(config: &AppConfig) -> Result<()> {
    let mut devices = BTreeMap::new();
    let mut subdevs = BTreeMap::new();

    for (cam_id, cam) in config.cameras.iter().filter(|(_, c)| c.enabled) {
        if cam.device.is_empty() {
            return Err(AppError::Config(format!("camera {}: empty device path", cam_id)));
        }
        if cam.preview_bitrate_kbps == 0 || cam.recording_bitrate_kbps == 0 {
            return Err(AppError::Config(format!("camera {}: zero bitrate", cam_id)));
        }
        if cam.fps == 0 {
            return Err(AppError::Config(format!("camera {}: zero framerate", cam_id)));
        }

        if let Some(other) = devices.insert(cam.device.clone(), cam_id.clone()) {
            return Err(AppError::Config(format!(
                "cameras {} and {} share capture device {}",
                other, cam_id, cam.device
            )));
        }
        if let Some(subdev) = &cam.bridge_subdev {
            if let Some(other) = subdevs.insert(subdev.clone(), cam_id.clone()) {
                return Err(AppError::Config(format!(
                    "cameras {} and {} share bridge sub-device {}",
                    other, cam_id, subdev
                )));
            }
        }
    }

    if config.recording.hard_stop_gb >= config.recording.min_start_gb {
        return Err(AppError::Config(
            "recording.hard_stop_gb must be below recording.min_start_gb".to_string(),
        ));
    }
    if config.events.replay_buffer_size == 0 {
        return Err(AppError::Config(
            "events.replay_buffer_size must be at least 1".to_string(),
        ));
    }

    Ok(())
}

/// Filter the camera table down to enabled entries.
pub fn enabled_cameras(config: &AppConfig) -> BTreeMap<String, CameraConfig> {
    config
        .cameras
        .iter()
        .filter(|(_, cam)| cam.enabled)
        .map(|(id, cam)| (id.clone(), cam.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_has_cameras() {
        let config = AppConfig::default();
        assert!(!config.cameras.is_empty());
        assert!(config.cameras.contains_key("cam1"));
        assert_eq!(config.cameras["cam1"].device, "/dev/video60");
    }

    #[test]
    fn test_enabled_filter() {
        let mut config = AppConfig::default();
        config
            .cameras
            .get_mut("cam2")
            .expect("default config has cam2")
            .enabled = false;

        let enabled = enabled_cameras(&config);
        assert!(enabled.contains_key("cam1"));
        assert!(!enabled.contains_key("cam2"));
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
device_id = "unit-07"

[cameras.hdmi_a]
device = "/dev/video60"
bridge_subdev = "/dev/v4l-subdev2"
preview_bitrate_kbps = 2500
recording_bitrate_kbps = 8000

[recording]
recordings_dir = "/tmp/rec"
min_start_gb = 2.0
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.device_id, "unit-07");
        assert_eq!(config.cameras.len(), 1);
        let cam = &config.cameras["hdmi_a"];
        assert_eq!(cam.device, "/dev/video60");
        assert_eq!(cam.bridge_subdev.as_deref(), Some("/dev/v4l-subdev2"));
        assert_eq!(cam.recording_bitrate_kbps, 8000);
        // Unspecified fields take defaults
        assert!(cam.enabled);
        assert_eq!(cam.fps, 30);
        assert_eq!(config.recording.min_start_gb, 2.0);
        assert_eq!(config.recording.hard_stop_gb, 1.0);
    }

    #[test]
    fn test_validate_rejects_shared_device() {
        let mut config = AppConfig::default();
        config
            .cameras
            .get_mut("cam2")
            .expect("default config has cam2")
            .device = config.cameras["cam1"].device.clone();

        let err = validate(&config).unwrap_err();
        assert_eq!(err.kind(), "config-error");
        assert!(err.to_string().contains("share capture device"));
    }

    #[test]
    fn test_validate_allows_shared_device_when_disabled() {
        let mut config = AppConfig::default();
        let device = config.cameras["cam1"].device.clone();
        let cam2 = config.cameras.get_mut("cam2").unwrap();
        cam2.device = device;
        cam2.enabled = false;

        validate(&config).unwrap();
    }

    #[test]
    fn test_validate_rejects_inverted_storage_thresholds() {
        let mut config = AppConfig::default();
        config.recording.hard_stop_gb = 10.0;
        config.recording.min_start_gb = 5.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_bitrate() {
        let mut config = AppConfig::default();
        config.cameras.get_mut("cam1").unwrap().preview_bitrate_kbps = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        validate(&AppConfig::default()).unwrap();
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = load_config(Some(Path::new("/nonexistent/config.toml"))).unwrap_err();
        assert_eq!(err.kind(), "config-error");
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "cameras = 42").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert_eq!(err.kind(), "config-error");
    }
}
