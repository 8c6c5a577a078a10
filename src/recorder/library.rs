//! Session library
//!
//! Reconstructs the list of recorded sessions from the recordings
//! directory itself: filenames carry the session id, camera id and start
//! timestamp, and an optional sidecar `<session-id>.json` holds the
//! user-facing name. No database involved.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{info, warn};

use super::session::{
    load_session_metadata, metadata_path, parse_recording_filename, save_session_metadata,
    SessionMetadata,
};
use crate::error::{AppError, Result};

/// One file belonging to a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionFile {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub camera_id: String,
    pub recorded_at: NaiveDateTime,
}

/// One session as reconstructed from disk
#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub id: String,
    pub name: Option<String>,
    pub recorded_at: NaiveDateTime,
    pub file_count: usize,
    pub total_bytes: u64,
    pub files: Vec<SessionFile>,
}

impl SessionEntry {
    /// Human-readable total size for the session browser
    pub fn total_size_display(&self) -> String {
        format_size(self.total_bytes)
    }
}

/// Render a byte count for display.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} PB", value)
}

/// Render a duration in seconds as H:MM:SS.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{}:{:02}:{:02}", hours, minutes, secs)
}

/// List sessions found under the recordings root, newest first.
pub fn list_sessions(root: &Path) -> Result<Vec<SessionEntry>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut by_session: BTreeMap<String, Vec<SessionFile>> = BTreeMap::new();

    for entry in std::fs::read_dir(root)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(parsed) = parse_recording_filename(filename) else {
            continue;
        };
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);

        by_session.entry(parsed.session_id).or_default().push(SessionFile {
            filename: filename.to_string(),
            path,
            size_bytes,
            camera_id: parsed.camera_id,
            recorded_at: parsed.timestamp,
        });
    }

    let mut sessions: Vec<SessionEntry> = by_session
        .into_iter()
        .map(|(id, mut files)| {
            files.sort_by_key(|f| f.recorded_at);
            let metadata = load_session_metadata(root, &id);
            SessionEntry {
                name: metadata.name,
                recorded_at: files[0].recorded_at,
                file_count: files.len(),
                total_bytes: files.iter().map(|f| f.size_bytes).sum(),
                files,
                id,
            }
        })
        .collect();

    sessions.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
    Ok(sessions)
}

/// Set the user-facing name of a session.
pub fn rename_session(root: &Path, session_id: &str, name: &str) -> Result<()> {
    if session_files(root, session_id)?.is_empty() {
        return Err(AppError::InvalidArgument(format!(
            "unknown session: {}",
            session_id
        )));
    }

    let mut metadata = load_session_metadata(root, session_id);
    metadata.name = Some(name.to_string());
    save_session_metadata(root, session_id, &metadata)
}

/// Delete a session's files and sidecar. Returns (files deleted, bytes freed).
pub fn delete_session(root: &Path, session_id: &str) -> Result<(usize, u64)> {
    let files = session_files(root, session_id)?;
    if files.is_empty() {
        return Err(AppError::InvalidArgument(format!(
            "unknown session: {}",
            session_id
        )));
    }

    let mut deleted = 0usize;
    let mut freed = 0u64;
    for path in files {
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                deleted += 1;
                freed += size;
                info!("Deleted recording file {}", path.display());
            }
            Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
        }
    }

    let sidecar = metadata_path(root, session_id);
    if sidecar.exists() {
        let _ = std::fs::remove_file(sidecar);
    }

    Ok((deleted, freed))
}

fn session_files(root: &Path, session_id: &str) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(parsed) = parse_recording_filename(filename) {
            if parsed.session_id == session_id {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// Ensure a session has a sidecar when it was given a name at start.
pub fn write_session_name(root: &Path, session_id: &str, name: &str) -> Result<()> {
    save_session_metadata(
        root,
        session_id,
        &SessionMetadata {
            name: Some(name.to_string()),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, name: &str, bytes: usize) {
        std::fs::write(root.join(name), vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn test_list_groups_by_session() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "S1_cam1_20260105_120000.mp4", 100);
        touch(dir.path(), "S1_cam2_20260105_120000.mp4", 200);
        touch(dir.path(), "S2_cam1_20260106_090000.mp4", 50);
        touch(dir.path(), "unrelated.txt", 10);

        let sessions = list_sessions(dir.path()).unwrap();
        assert_eq!(sessions.len(), 2);
        // Newest first
        assert_eq!(sessions[0].id, "S2");
        assert_eq!(sessions[1].id, "S1");
        assert_eq!(sessions[1].file_count, 2);
        assert_eq!(sessions[1].total_bytes, 300);
    }

    #[test]
    fn test_list_reads_sidecar_names() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "S1_cam1_20260105_120000.mp4", 10);
        write_session_name(dir.path(), "S1", "Rehearsal").unwrap();

        let sessions = list_sessions(dir.path()).unwrap();
        assert_eq!(sessions[0].name.as_deref(), Some("Rehearsal"));
    }

    #[test]
    fn test_rename_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let err = rename_session(dir.path(), "ghost", "x").unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
    }

    #[test]
    fn test_delete_session_removes_files_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "S1_cam1_20260105_120000.mp4", 100);
        touch(dir.path(), "S1_cam2_20260105_120001.mp4", 100);
        write_session_name(dir.path(), "S1", "Service").unwrap();

        let (deleted, freed) = delete_session(dir.path(), "S1").unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(freed, 200);
        assert!(list_sessions(dir.path()).unwrap().is_empty());
        assert!(!metadata_path(dir.path(), "S1").exists());
    }

    #[test]
    fn test_missing_root_is_empty() {
        let sessions = list_sessions(Path::new("/no/such/dir")).unwrap();
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512.0 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0:00:00");
        assert_eq!(format_duration(61), "0:01:01");
        assert_eq!(format_duration(3_725), "1:02:05");
    }
}
