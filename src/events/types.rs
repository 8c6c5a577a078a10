//! Event wire types
//!
//! Defines the versioned event envelope broadcast to clients and the typed
//! payloads the core attaches to it. The envelope shape is
//! `{v, type, seq, ts, device_id, payload}`; payloads are plain JSON objects
//! so clients never need to understand internal types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Event type enumeration (wire names)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // System
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "sync_response")]
    SyncResponse,

    // Mode
    #[serde(rename = "mode.changed")]
    ModeChanged,

    // Recorder
    #[serde(rename = "recorder.started")]
    RecorderStarted,
    #[serde(rename = "recorder.stopped")]
    RecorderStopped,
    #[serde(rename = "recorder.progress")]
    RecorderProgress,
    #[serde(rename = "recorder.stall")]
    RecorderStall,

    // Pipeline/Preview
    #[serde(rename = "preview.started")]
    PreviewStarted,
    #[serde(rename = "preview.stopped")]
    PreviewStopped,
    #[serde(rename = "pipeline.error")]
    PipelineError,

    // Inputs
    #[serde(rename = "input.signal_changed")]
    InputSignalChanged,

    // Storage
    #[serde(rename = "storage.warning")]
    StorageWarning,
    #[serde(rename = "storage.critical")]
    StorageCritical,
}

impl EventType {
    /// Wire name of the event type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
            Self::SyncResponse => "sync_response",
            Self::ModeChanged => "mode.changed",
            Self::RecorderStarted => "recorder.started",
            Self::RecorderStopped => "recorder.stopped",
            Self::RecorderProgress => "recorder.progress",
            Self::RecorderStall => "recorder.stall",
            Self::PreviewStarted => "preview.started",
            Self::PreviewStopped => "preview.stopped",
            Self::PipelineError => "pipeline.error",
            Self::InputSignalChanged => "input.signal_changed",
            Self::StorageWarning => "storage.warning",
            Self::StorageCritical => "storage.critical",
        }
    }

    /// Check the wire name against a topic pattern.
    ///
    /// `*` matches every event, `recorder.*` every recorder event, and a
    /// full name matches exactly. Lets the control surface offer filtered
    /// subscriptions without the bus knowing about filters.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }
        let name = self.as_str();
        match topic.strip_suffix(".*") {
            Some(prefix) => name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => name == topic,
        }
    }
}

/// Versioned event envelope
///
/// Immutable once a sequence number is assigned; the bus is the only
/// component that constructs these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Schema version
    pub v: u32,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Monotonic sequence number, unique within the process lifetime
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub device_id: String,
    pub payload: Option<Value>,
}

// ============================================================================
// Typed payloads
// ============================================================================

/// Input signal status change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSignalPayload {
    pub input_id: String,
    pub has_signal: bool,
    /// "WIDTHxHEIGHT" when signal is present
    pub resolution: Option<String>,
    pub framerate: Option<u32>,
}

/// Preview (broker publish) started
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewStartedPayload {
    pub input_id: String,
    pub rtsp_url: String,
}

/// Preview (broker publish) stopped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewStoppedPayload {
    pub input_id: String,
}

/// Pipeline error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineErrorPayload {
    pub pipeline_id: String,
    pub input_id: Option<String>,
    pub error: String,
}

/// Recording session started
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderStartedPayload {
    pub session_id: String,
    pub cameras: Vec<String>,
    /// Per-camera start outcome
    pub results: BTreeMap<String, bool>,
}

/// Recording session stopped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderStoppedPayload {
    pub session_id: String,
    pub duration_ms: u64,
    /// Per-camera output file paths
    pub files: BTreeMap<String, String>,
    /// Per-camera stop outcome
    pub results: BTreeMap<String, bool>,
}

/// Recording progress update (one per monitor tick while recording)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderProgressPayload {
    pub session_id: String,
    pub duration_ms: u64,
    pub bytes_written: BTreeMap<String, u64>,
}

/// Recording file stopped growing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderStallPayload {
    pub session_id: String,
    pub input_id: String,
}

/// Operating mode changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeChangedPayload {
    pub mode: String,
}

/// Storage threshold crossed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePayload {
    pub available_gb: f64,
    pub threshold_gb: f64,
}

// ============================================================================
// Snapshot / sync types
// ============================================================================

/// Preview entry in the cached state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewState {
    pub running: bool,
    pub rtsp_url: Option<String>,
}

/// Authoritative state snapshot
///
/// Ground truth composed on demand from the supervisor and recorder; the
/// replay buffer's events are deltas applied on top of this.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// "idle" or "recording"
    pub mode: String,
    /// Current session summary, None when idle
    pub recording: Option<Value>,
    /// Per-input state, keyed by input id
    pub inputs: BTreeMap<String, Value>,
    /// Per-input preview state, keyed by input id
    pub previews: BTreeMap<String, PreviewState>,
    /// Storage totals for the recordings filesystem
    pub storage: Option<Value>,
}

/// Sync response payload for a reconnecting client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPayload {
    /// The last sequence the client acknowledged
    pub last_seq: u64,
    /// The bus's current sequence
    pub current_seq: u64,
    /// False when the client is beyond the replay window and must adopt
    /// the snapshot wholesale
    pub can_replay: bool,
    pub missed_event_count: usize,
    /// Missed events in sequence order (empty when can_replay is false)
    pub events: Vec<Event>,
    pub state: StateSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(EventType::InputSignalChanged.as_str(), "input.signal_changed");
        assert_eq!(EventType::RecorderProgress.as_str(), "recorder.progress");
        assert_eq!(
            serde_json::to_string(&EventType::ModeChanged).unwrap(),
            "\"mode.changed\""
        );
    }

    #[test]
    fn test_topic_matching() {
        assert!(EventType::RecorderStarted.matches_topic("*"));
        assert!(EventType::RecorderStarted.matches_topic("recorder.*"));
        assert!(EventType::RecorderStarted.matches_topic("recorder.started"));
        assert!(!EventType::RecorderStarted.matches_topic("recorder.stopped"));
        assert!(!EventType::RecorderStarted.matches_topic("preview.*"));
        // A prefix must end at a segment boundary
        assert!(!EventType::Heartbeat.matches_topic("heart.*"));
    }

    #[test]
    fn test_envelope_round_trip() {
        let event = Event {
            v: SCHEMA_VERSION,
            event_type: EventType::InputSignalChanged,
            seq: 42,
            ts: Utc::now(),
            device_id: "camcore".to_string(),
            payload: Some(
                serde_json::to_value(InputSignalPayload {
                    input_id: "cam1".to_string(),
                    has_signal: true,
                    resolution: Some("1920x1080".to_string()),
                    framerate: Some(60),
                })
                .unwrap(),
            ),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"input.signal_changed\""));
        assert!(json.contains("\"seq\":42"));
        assert!(json.contains("\"v\":1"));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seq, 42);
        assert_eq!(back.event_type, EventType::InputSignalChanged);
        let payload: InputSignalPayload = serde_json::from_value(back.payload.unwrap()).unwrap();
        assert_eq!(payload.resolution.as_deref(), Some("1920x1080"));
    }
}
