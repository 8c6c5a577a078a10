//! Device capabilities manifest
//!
//! A static-plus-probed description of what this unit can do: configured
//! inputs, hardware codecs, preview transports and storage totals. Client
//! UIs adapt their features to this manifest instead of hard-coding per
//! model knowledge.

use serde::Serialize;

use crate::config::AppConfig;
use crate::recorder::storage;

/// Hardware input capability
#[derive(Debug, Clone, Serialize)]
pub struct InputCapability {
    pub id: String,
    /// "hdmi" for bridge inputs, "v4l2" otherwise
    pub kind: String,
    pub label: String,
    pub device_path: String,
    pub max_resolution: String,
}

/// Codec capability
#[derive(Debug, Clone, Serialize)]
pub struct CodecCapability {
    pub id: String,
    pub name: String,
    pub hardware_accelerated: bool,
    pub max_bitrate_kbps: u32,
}

/// Preview transport capability
#[derive(Debug, Clone, Serialize)]
pub struct PreviewMode {
    pub id: String,
    pub protocol: String,
    pub latency_ms: u32,
    pub url_template: String,
}

/// Complete capabilities manifest
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCapabilities {
    pub device_id: String,
    pub core_version: String,
    pub inputs: Vec<InputCapability>,
    pub codecs: Vec<CodecCapability>,
    pub preview_modes: Vec<PreviewMode>,
    pub max_simultaneous_recordings: usize,
    pub storage_total_gb: f64,
    pub storage_available_gb: f64,
}

/// Compose the manifest from configuration and the recordings filesystem.
pub fn device_capabilities(config: &AppConfig) -> DeviceCapabilities {
    let inputs = config
        .cameras
        .iter()
        .filter(|(_, cam)| cam.enabled)
        .enumerate()
        .map(|(idx, (id, cam))| InputCapability {
            id: id.clone(),
            kind: if cam.bridge_subdev.is_some() {
                "hdmi".to_string()
            } else {
                "v4l2".to_string()
            },
            label: format!("HDMI {}", idx + 1),
            device_path: cam.device.clone(),
            max_resolution: format!("{}x{}", cam.width, cam.height),
        })
        .collect::<Vec<_>>();

    let (storage_total_gb, storage_available_gb) =
        match storage::disk_space(&config.recording.recordings_dir) {
            Ok(space) => (
                round2(space.total_gb()),
                round2(space.available_gb()),
            ),
            Err(_) => (0.0, 0.0),
        };

    DeviceCapabilities {
        device_id: config.device_id.clone(),
        core_version: env!("CARGO_PKG_VERSION").to_string(),
        max_simultaneous_recordings: inputs.len(),
        inputs,
        codecs: vec![CodecCapability {
            id: "h264_hw".to_string(),
            name: "H.264 (Rockchip MPP)".to_string(),
            hardware_accelerated: true,
            max_bitrate_kbps: 20_000,
        }],
        preview_modes: vec![
            PreviewMode {
                id: "whep".to_string(),
                protocol: "whep".to_string(),
                latency_ms: 100,
                url_template: format!(
                    "http://{}:8889/{{input_id}}/whep",
                    config.broker.host
                ),
            },
            PreviewMode {
                id: "rtsp".to_string(),
                protocol: "rtsp".to_string(),
                latency_ms: 300,
                url_template: format!(
                    "rtsp://{}:{}/{{input_id}}",
                    config.broker.host, config.broker.rtsp_port
                ),
            },
        ],
        storage_total_gb,
        storage_available_gb,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_covers_enabled_inputs() {
        let mut config = AppConfig::default();
        config
            .cameras
            .get_mut("cam2")
            .expect("default config has cam2")
            .enabled = false;

        let manifest = device_capabilities(&config);
        assert_eq!(manifest.inputs.len(), 1);
        assert_eq!(manifest.inputs[0].id, "cam1");
        assert_eq!(manifest.inputs[0].kind, "hdmi");
        assert_eq!(manifest.max_simultaneous_recordings, 1);
    }

    #[test]
    fn test_manifest_preview_templates_use_broker() {
        let config = AppConfig::default();
        let manifest = device_capabilities(&config);
        let rtsp = manifest
            .preview_modes
            .iter()
            .find(|m| m.protocol == "rtsp")
            .unwrap();
        assert_eq!(rtsp.url_template, "rtsp://127.0.0.1:8554/{input_id}");
    }

    #[test]
    fn test_manifest_serializes() {
        let manifest = device_capabilities(&AppConfig::default());
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["codecs"][0]["hardware_accelerated"], true);
        assert!(json["storage_total_gb"].is_number());
    }
}
