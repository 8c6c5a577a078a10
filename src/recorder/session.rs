//! Recording session model
//!
//! A session is a bounded, named interval grouping one file per camera.
//! Recordings move `recording -> stopped` or `recording -> error` and never
//! leave a terminal state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// State of one per-camera recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Recording,
    Stopped,
    Error,
}

impl RecordingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

/// Aggregate state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Recording,
    Stopped,
    Error,
}

/// One file being written for one camera in one session
#[derive(Debug, Clone, Serialize)]
pub struct RecordingInfo {
    pub cam_id: String,
    pub output_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub state: RecordingState,
    pub bytes_written: u64,
    pub error: Option<String>,
}

impl RecordingInfo {
    pub fn new(cam_id: impl Into<String>, output_path: PathBuf) -> Self {
        Self {
            cam_id: cam_id.into(),
            output_path,
            started_at: Utc::now(),
            state: RecordingState::Recording,
            bytes_written: 0,
            error: None,
        }
    }

    pub fn failed(cam_id: impl Into<String>, output_path: PathBuf, error: String) -> Self {
        Self {
            cam_id: cam_id.into(),
            output_path,
            started_at: Utc::now(),
            state: RecordingState::Error,
            bytes_written: 0,
            error: Some(error),
        }
    }

    /// Transition to a new state. Terminal states are final: attempts to
    /// leave them are refused, not applied.
    pub fn transition(&mut self, next: RecordingState) {
        if self.state.is_terminal() && next != self.state {
            warn!(
                "Refusing recording transition {:?} -> {:?} for {}",
                self.state, next, self.cam_id
            );
            return;
        }
        self.state = next;
    }
}

/// A recording session grouping per-camera recordings
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub recordings: BTreeMap<String, RecordingInfo>,
    pub state: SessionState,
}

impl Session {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            started_at: Utc::now(),
            recordings: BTreeMap::new(),
            state: SessionState::Recording,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn active_recordings(&self) -> impl Iterator<Item = &RecordingInfo> {
        self.recordings
            .values()
            .filter(|r| r.state == RecordingState::Recording)
    }
}

/// Compose a session identifier: the caller-supplied idempotency key when
/// present, a timestamp-derived id otherwise.
pub fn generate_session_id(idempotency_key: Option<&str>) -> String {
    match idempotency_key {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => Utc::now().format("session_%Y%m%d_%H%M%S").to_string(),
    }
}

/// Output path for one camera's file:
/// `<root>/<session-id>_<cam>_<YYYYMMDD_HHMMSS>.mp4`
pub fn recording_path(root: &Path, session_id: &str, cam_id: &str, now: DateTime<Utc>) -> PathBuf {
    root.join(format!(
        "{}_{}_{}.mp4",
        session_id,
        cam_id,
        now.format("%Y%m%d_%H%M%S")
    ))
}

/// Parsed fields of a recording filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecording {
    pub session_id: String,
    pub camera_id: String,
    pub timestamp: NaiveDateTime,
}

/// Parse `{session}_{camera}_{YYYYMMDD}_{HHMMSS}.mp4`.
///
/// Session identifiers may themselves contain underscores (the default
/// timestamp-derived ids do), so the filename is consumed from the end:
/// the last two segments are the timestamp, the one before them is the
/// camera id, and everything remaining is the session id.
pub fn parse_recording_filename(filename: &str) -> Option<ParsedRecording> {
    let stem = filename.strip_suffix(".mp4")?;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 4 {
        return None;
    }

    let time = parts[parts.len() - 1];
    let date = parts[parts.len() - 2];
    let camera_id = parts[parts.len() - 3];
    if time.len() != 6 || date.len() != 8 || camera_id.is_empty() {
        return None;
    }

    let timestamp =
        NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), "%Y%m%d_%H%M%S").ok()?;
    let session_id = parts[..parts.len() - 3].join("_");
    if session_id.is_empty() {
        return None;
    }

    Some(ParsedRecording {
        session_id,
        camera_id: camera_id.to_string(),
        timestamp,
    })
}

/// Sidecar metadata stored next to a session's files as `<session-id>.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub name: Option<String>,
}

pub fn metadata_path(root: &Path, session_id: &str) -> PathBuf {
    root.join(format!("{}.json", session_id))
}

pub fn load_session_metadata(root: &Path, session_id: &str) -> SessionMetadata {
    let path = metadata_path(root, session_id);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn save_session_metadata(
    root: &Path,
    session_id: &str,
    metadata: &SessionMetadata,
) -> crate::error::Result<()> {
    let path = metadata_path(root, session_id);
    let raw = serde_json::to_string_pretty(metadata)?;
    std::fs::write(&path, raw)?;
    Ok(())
}
