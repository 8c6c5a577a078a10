//! Session recording
//!
//! The recorder is the subscriber side of the pub/sub split: it never
//! touches a capture device. For subscriber-variant cameras it pulls the
//! already-encoded stream back out of the broker and remuxes it to disk;
//! for valve-variant cameras it asks the ingest supervisor to open the
//! in-pipeline valve. Either way, starting, stopping or crashing a
//! recording cannot disturb live preview.
//!
//! Sessions enforce the global recording invariants: disk preflight before
//! start, at most one session recording at a time, idempotent start/stop,
//! and terminal recording states that are never revived. A monitor loop
//! watches file growth (stall detection) and free space (hard-stop
//! supervisor) while a session is active.

pub mod library;
pub mod session;
pub mod storage;

pub use library::{
    delete_session, format_duration, format_size, list_sessions, rename_session, SessionEntry,
    SessionFile,
};
pub use session::{
    generate_session_id, parse_recording_filename, recording_path, ParsedRecording, RecordingInfo,
    RecordingState, Session, SessionState,
};
pub use storage::{disk_space, DiskSpace};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{enabled_cameras, AppConfig, RecordingVariant};
use crate::error::{AppError, Result};
use crate::events::{
    to_payload, EventBus, EventType, PipelineErrorPayload, RecorderProgressPayload,
    RecorderStallPayload, RecorderStartedPayload, RecorderStoppedPayload, StoragePayload,
};
use crate::ingest::IngestSupervisor;
use crate::pipeline::{subscriber_graph, GraphMessage, MediaGraph, START_TIMEOUT, STOP_EOS_TIMEOUT};

/// Graph name prefix for subscriber recording pipelines
const GRAPH_PREFIX: &str = "rec_";

/// Request to start a recording session
#[derive(Debug, Clone, Default)]
pub struct StartSessionRequest {
    /// Client-supplied idempotency key, doubling as the session id
    pub idempotency_key: Option<String>,
    /// User-facing session name, persisted to the sidecar
    pub name: Option<String>,
    /// Camera subset; all enabled cameras when None
    pub cameras: Option<Vec<String>>,
}

/// Descriptor returned by session start
#[derive(Debug, Clone, Serialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub inputs: Vec<String>,
    pub state: SessionState,
    /// Per-camera start outcome
    pub results: BTreeMap<String, bool>,
}

/// Summary returned by session stop
#[derive(Debug, Clone, Serialize)]
pub struct StopSummary {
    pub session_id: String,
    pub duration_ms: u64,
    /// Per-camera output files
    pub files: BTreeMap<String, String>,
    /// Per-camera stop outcome
    pub results: BTreeMap<String, bool>,
}

/// Recorder status for the authoritative snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    pub recording: bool,
    pub session: Option<SessionStatus>,
}

/// Current or last session, with per-recording detail
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
    pub duration_ms: u64,
    pub recordings: BTreeMap<String, RecordingInfo>,
}

/// File-growth watcher: `observe` returns true exactly when a recording
/// crosses the stall threshold, so one stall event is emitted per episode.
struct StallTracker {
    threshold: u32,
    last_sizes: BTreeMap<String, u64>,
    stall_counts: BTreeMap<String, u32>,
}

impl StallTracker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            last_sizes: BTreeMap::new(),
            stall_counts: BTreeMap::new(),
        }
    }

    fn observe(&mut self, cam_id: &str, size: u64) -> bool {
        let last = self.last_sizes.insert(cam_id.to_string(), size);
        if last == Some(size) && size > 0 {
            let count = self.stall_counts.entry(cam_id.to_string()).or_insert(0);
            *count += 1;
            *count == self.threshold
        } else {
            self.stall_counts.insert(cam_id.to_string(), 0);
            false
        }
    }
}

struct RecorderInner {
    session: Option<Session>,
    graphs: BTreeMap<String, MediaGraph>,
    monitor: Option<CancellationToken>,
}

/// Recorder set grouped into sessions
pub struct SessionRecorder {
    config: Arc<AppConfig>,
    events: Arc<EventBus>,
    supervisor: Arc<IngestSupervisor>,
    inner: Mutex<RecorderInner>,
    graph_tx: mpsc::UnboundedSender<(String, GraphMessage)>,
    graph_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, GraphMessage)>>>,
    background_tasks_started: AtomicBool,
}

impl SessionRecorder {
    pub fn new(
        config: Arc<AppConfig>,
        events: Arc<EventBus>,
        supervisor: Arc<IngestSupervisor>,
    ) -> Arc<Self> {
        let (graph_tx, graph_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            events,
            supervisor,
            inner: Mutex::new(RecorderInner {
                session: None,
                graphs: BTreeMap::new(),
                monitor: None,
            }),
            graph_tx,
            graph_rx: Mutex::new(Some(graph_rx)),
            background_tasks_started: AtomicBool::new(false),
        })
    }

    /// Start the bus-message pump. Idempotent; called once at startup.
    pub async fn spawn_background_tasks(self: &Arc<Self>) {
        if self.background_tasks_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut rx) = self.graph_rx.lock().await.take() {
            let recorder = Arc::clone(self);
            tokio::spawn(async move {
                while let Some((graph_name, message)) = rx.recv().await {
                    let Some(cam_id) = graph_name.strip_prefix(GRAPH_PREFIX) else {
                        continue;
                    };
                    recorder.handle_graph_message(cam_id.to_string(), message).await;
                }
            });
        }
    }

    // =========================================================================
    // Session control
    // =========================================================================

    /// Start a recording session.
    ///
    /// Preflight order: storage, then single-session invariant (with the
    /// idempotency-key escape), then camera selection. Each requested
    /// camera is started independently; per-camera failures are recorded
    /// in the outcome map rather than failing the session.
    pub async fn start_session(
        self: &Arc<Self>,
        request: StartSessionRequest,
    ) -> Result<SessionDescriptor> {
        let mut inner = self.inner.lock().await;

        let result = self.start_session_locked(&mut inner, request).await;
        if let Err(e) = &result {
            self.publish_error(e);
        }
        result
    }

    async fn start_session_locked(
        self: &Arc<Self>,
        inner: &mut RecorderInner,
        request: StartSessionRequest,
    ) -> Result<SessionDescriptor> {
        // 1. Storage preflight
        let space = storage::disk_space(&self.config.recording.recordings_dir)?;
        if space.available_gb() < self.config.recording.min_start_gb {
            return Err(AppError::StorageInsufficient {
                available_gb: space.available_gb(),
                required_gb: self.config.recording.min_start_gb,
            });
        }

        // 2. Single-session invariant, with idempotent replay
        if let Some(session) = &inner.session {
            if session.state == SessionState::Recording {
                if request.idempotency_key.as_deref() == Some(session.id.as_str()) {
                    info!("Idempotent start for active session {}", session.id);
                    return Ok(Self::descriptor_of(session));
                }
                return Err(AppError::SessionConflict(format!(
                    "already recording session: {}",
                    session.id
                )));
            }
        }

        // 3. Camera selection
        let known = enabled_cameras(&self.config);
        let cameras: Vec<String> = match &request.cameras {
            Some(requested) => {
                let (valid, unknown): (Vec<_>, Vec<_>) = requested
                    .iter()
                    .cloned()
                    .partition(|cam| known.contains_key(cam));
                if !unknown.is_empty() {
                    warn!("Ignoring unknown cameras in session request: {:?}", unknown);
                }
                valid
            }
            None => known.keys().cloned().collect(),
        };
        if cameras.is_empty() {
            return Err(AppError::InvalidArgument(
                "no cameras specified and no default inputs configured".to_string(),
            ));
        }

        // Subscriber recordings pull from the broker; verify it is up
        // before building one graph per camera against a dead endpoint.
        let needs_broker = cameras
            .iter()
            .any(|cam| known[cam].variant == RecordingVariant::Subscriber);
        if needs_broker {
            crate::pipeline::check_broker(&self.config.broker).await?;
        }

        // 4. Create the session
        let session_id = generate_session_id(request.idempotency_key.as_deref());
        let root = self.config.recording.recordings_dir.clone();
        std::fs::create_dir_all(&root)?;

        let mut session = Session::new(session_id.clone(), request.name.clone());
        if let Some(name) = &request.name {
            if let Err(e) = library::write_session_name(&root, &session_id, name) {
                warn!("Failed to write session sidecar: {}", e);
            }
        }

        // 5. Start one recording per camera
        let mut results = BTreeMap::new();
        for cam_id in &cameras {
            let camera = &known[cam_id];
            let outcome = match camera.variant {
                RecordingVariant::Valve => self
                    .supervisor
                    .start_valve_recording(cam_id)
                    .await
                    .map(|path| (path, None)),
                RecordingVariant::Subscriber => {
                    self.start_subscriber_recording(cam_id, &session_id).await
                }
            };

            match outcome {
                Ok((path, graph)) => {
                    session
                        .recordings
                        .insert(cam_id.clone(), RecordingInfo::new(cam_id.clone(), path));
                    if let Some(graph) = graph {
                        inner.graphs.insert(cam_id.clone(), graph);
                    }
                    results.insert(cam_id.clone(), true);
                }
                Err(e) => {
                    error!("Failed to start recording for {}: {}", cam_id, e);
                    let path = recording_path(&root, &session_id, cam_id, Utc::now());
                    session.recordings.insert(
                        cam_id.clone(),
                        RecordingInfo::failed(cam_id.clone(), path, e.to_string()),
                    );
                    results.insert(cam_id.clone(), false);
                }
            }
        }

        info!(
            "Recording session {} started ({} cameras, {} ok)",
            session_id,
            cameras.len(),
            results.values().filter(|ok| **ok).count()
        );

        self.events.publish(
            EventType::RecorderStarted,
            Some(to_payload(&RecorderStartedPayload {
                session_id: session_id.clone(),
                cameras: cameras.clone(),
                results: results.clone(),
            })),
        );

        let descriptor = SessionDescriptor {
            session_id,
            name: session.name.clone(),
            started_at: session.started_at,
            inputs: cameras,
            state: session.state,
            results,
        };

        inner.session = Some(session);
        self.start_monitor(inner);
        Ok(descriptor)
    }

    /// Stop the current session.
    ///
    /// Idempotent: stopping while not recording succeeds without effect.
    /// A session identifier that does not match the active session is a
    /// conflict.
    pub async fn stop_session(self: &Arc<Self>, session_id: Option<&str>) -> Result<StopSummary> {
        let mut inner = self.inner.lock().await;

        let active = inner
            .session
            .as_ref()
            .filter(|s| s.state == SessionState::Recording)
            .map(|s| s.id.clone());

        let Some(active_id) = active else {
            debug!("Stop requested while not recording (idempotent)");
            return Ok(StopSummary {
                session_id: session_id.unwrap_or_default().to_string(),
                duration_ms: 0,
                files: BTreeMap::new(),
                results: BTreeMap::new(),
            });
        };

        if let Some(requested) = session_id {
            if requested != active_id {
                let err = AppError::SessionConflict(format!(
                    "session mismatch: expected {}, current is {}",
                    requested, active_id
                ));
                self.publish_error(&err);
                return Err(err);
            }
        }

        if let Some(token) = inner.monitor.take() {
            token.cancel();
        }

        let cam_ids: Vec<String> = inner
            .session
            .as_ref()
            .map(|s| s.recordings.keys().cloned().collect())
            .unwrap_or_default();

        let mut results = BTreeMap::new();
        let mut files = BTreeMap::new();
        for cam_id in &cam_ids {
            let stopped = self.stop_one_recording(&mut inner, cam_id).await;
            results.insert(cam_id.clone(), stopped);
        }

        let session = inner.session.as_mut().ok_or_else(|| {
            AppError::Internal("session vanished during stop".to_string())
        })?;
        session.state = SessionState::Stopped;
        let duration_ms = session.duration_ms();

        for (cam_id, recording) in &session.recordings {
            files.insert(
                cam_id.clone(),
                recording.output_path.display().to_string(),
            );
        }

        info!(
            "Recording session {} stopped after {}ms",
            active_id, duration_ms
        );

        self.events.publish(
            EventType::RecorderStopped,
            Some(to_payload(&RecorderStoppedPayload {
                session_id: active_id.clone(),
                duration_ms,
                files: files.clone(),
                results: results.clone(),
            })),
        );

        Ok(StopSummary {
            session_id: active_id,
            duration_ms,
            files,
            results,
        })
    }

    /// Current recorder status for the snapshot
    pub async fn status(&self) -> RecorderStatus {
        let inner = self.inner.lock().await;
        let session = inner.session.as_ref().map(|s| SessionStatus {
            session_id: s.id.clone(),
            name: s.name.clone(),
            started_at: s.started_at,
            state: s.state,
            duration_ms: s.duration_ms(),
            recordings: s.recordings.clone(),
        });
        RecorderStatus {
            recording: inner
                .session
                .as_ref()
                .is_some_and(|s| s.state == SessionState::Recording),
            session,
        }
    }

    /// Best-effort stop at shutdown.
    pub async fn shutdown(self: &Arc<Self>) {
        if let Err(e) = self.stop_session(None).await {
            warn!("Failed to stop session during shutdown: {}", e);
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn descriptor_of(session: &Session) -> SessionDescriptor {
        SessionDescriptor {
            session_id: session.id.clone(),
            name: session.name.clone(),
            started_at: session.started_at,
            inputs: session.recordings.keys().cloned().collect(),
            state: session.state,
            results: session
                .recordings
                .iter()
                .map(|(cam, rec)| (cam.clone(), rec.state == RecordingState::Recording))
                .collect(),
        }
    }

    async fn start_subscriber_recording(
        &self,
        cam_id: &str,
        session_id: &str,
    ) -> Result<(PathBuf, Option<MediaGraph>)> {
        let root = &self.config.recording.recordings_dir;
        let path = recording_path(root, session_id, cam_id, Utc::now());
        let source_url = self.config.broker.rtsp_url(cam_id);
        let description = subscriber_graph(
            &source_url,
            &path,
            self.config.recording.fragment_duration_ms,
        );

        let graph_name = format!("{}{}", GRAPH_PREFIX, cam_id);
        let graph = MediaGraph::launch(&graph_name, &description, self.graph_tx.clone())?;
        let graph = tokio::task::spawn_blocking(move || graph.start(START_TIMEOUT).map(|_| graph))
            .await
            .map_err(|e| AppError::Internal(format!("start task: {}", e)))??;

        info!("Recording started for {}: {}", cam_id, path.display());
        Ok((path, Some(graph)))
    }

    /// Stop one recording: EOS-flush subscriber graphs, close valves.
    /// Returns whether the recording ended cleanly in `stopped`.
    async fn stop_one_recording(&self, inner: &mut RecorderInner, cam_id: &str) -> bool {
        let variant = self
            .config
            .cameras
            .get(cam_id)
            .map(|c| c.variant)
            .unwrap_or(RecordingVariant::Subscriber);

        let mut clean = true;
        match variant {
            RecordingVariant::Subscriber => {
                if let Some(mut graph) = inner.graphs.remove(cam_id) {
                    let result =
                        tokio::task::spawn_blocking(move || graph.stop(STOP_EOS_TIMEOUT)).await;
                    if let Err(e) = result {
                        warn!("Stop task failed for {}: {}", cam_id, e);
                        clean = false;
                    }
                }
            }
            RecordingVariant::Valve => {
                if let Err(e) = self.supervisor.stop_valve_recording(cam_id).await {
                    warn!("Failed to close valve for {}: {}", cam_id, e);
                    clean = false;
                }
            }
        }

        if let Some(session) = inner.session.as_mut() {
            if let Some(recording) = session.recordings.get_mut(cam_id) {
                if recording.state == RecordingState::Recording {
                    recording.bytes_written = std::fs::metadata(&recording.output_path)
                        .map(|m| m.len())
                        .unwrap_or(recording.bytes_written);
                    recording.transition(if clean {
                        RecordingState::Stopped
                    } else {
                        RecordingState::Error
                    });
                }
                return recording.state == RecordingState::Stopped;
            }
        }
        clean
    }

    /// React to bus traffic from a subscriber recording graph. Recorder
    /// failures are isolated: the recording goes terminal and an event is
    /// emitted, nothing else is touched.
    async fn handle_graph_message(self: &Arc<Self>, cam_id: String, message: GraphMessage) {
        match message {
            GraphMessage::Running => debug!("Recording graph running for {}", cam_id),
            GraphMessage::Warning { message } => {
                warn!("Recording warning for {}: {}", cam_id, message);
            }
            GraphMessage::Eos => {
                self.fail_recording(&cam_id, "unexpected end of stream".to_string())
                    .await;
            }
            GraphMessage::Error { source, message } => {
                error!("Recording error for {} from {}: {}", cam_id, source, message);
                self.fail_recording(&cam_id, message).await;
            }
        }
    }

    async fn fail_recording(self: &Arc<Self>, cam_id: &str, message: String) {
        let graph = {
            let mut inner = self.inner.lock().await;
            if let Some(session) = inner.session.as_mut() {
                if let Some(recording) = session.recordings.get_mut(cam_id) {
                    if recording.state == RecordingState::Recording {
                        recording.error = Some(message.clone());
                        recording.transition(RecordingState::Error);
                    }
                }
            }
            inner.graphs.remove(cam_id)
        };

        if let Some(mut graph) = graph {
            let _ = tokio::task::spawn_blocking(move || graph.stop(Duration::from_secs(1))).await;
        }

        self.events.publish(
            EventType::PipelineError,
            Some(to_payload(&PipelineErrorPayload {
                pipeline_id: format!("{}{}", GRAPH_PREFIX, cam_id),
                input_id: Some(cam_id.to_string()),
                error: message,
            })),
        );
    }

    fn publish_error(&self, err: &AppError) {
        self.events.publish(
            EventType::Error,
            Some(to_payload(&err.descriptor())),
        );
    }

    // =========================================================================
    // Monitor loop
    // =========================================================================

    fn start_monitor(self: &Arc<Self>, inner: &mut RecorderInner) {
        if inner.monitor.is_some() {
            return;
        }
        let token = CancellationToken::new();
        inner.monitor = Some(token.clone());

        let recorder = Arc::clone(self);
        let interval = Duration::from_secs(self.config.recording.monitor_interval_secs.max(1));
        tokio::spawn(async move {
            debug!("Recording monitor running ({}s interval)", interval.as_secs());
            let mut tracker = StallTracker::new(recorder.config.recording.stall_threshold);
            let mut storage_warned = false;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if !recorder.monitor_tick(&mut tracker, &mut storage_warned).await {
                            break;
                        }
                    }
                }
            }
            debug!("Recording monitor exited");
        });
    }

    /// One monitor pass. Returns false when the loop should end.
    async fn monitor_tick(
        self: &Arc<Self>,
        tracker: &mut StallTracker,
        storage_warned: &mut bool,
    ) -> bool {
        // Disk supervision
        match storage::disk_space(&self.config.recording.recordings_dir) {
            Ok(space) => {
                let available = space.available_gb();
                if available < self.config.recording.hard_stop_gb {
                    error!(
                        "Critical storage level ({:.1}GB free), stopping session",
                        available
                    );
                    self.events.publish(
                        EventType::StorageCritical,
                        Some(to_payload(&StoragePayload {
                            available_gb: available,
                            threshold_gb: self.config.recording.hard_stop_gb,
                        })),
                    );
                    if let Err(e) = self.stop_session(None).await {
                        warn!("Best-effort stop after storage-critical failed: {}", e);
                    }
                    return false;
                }

                if available < self.config.recording.min_start_gb {
                    if !*storage_warned {
                        *storage_warned = true;
                        self.events.publish(
                            EventType::StorageWarning,
                            Some(to_payload(&StoragePayload {
                                available_gb: available,
                                threshold_gb: self.config.recording.min_start_gb,
                            })),
                        );
                    }
                } else {
                    *storage_warned = false;
                }
            }
            Err(e) => warn!("Disk space check failed: {}", e),
        }

        // File growth
        let (session_id, duration_ms, observations) = {
            let mut inner = self.inner.lock().await;
            let Some(session) = inner
                .session
                .as_mut()
                .filter(|s| s.state == SessionState::Recording)
            else {
                return false;
            };

            let mut observations = BTreeMap::new();
            for recording in session.recordings.values_mut() {
                if recording.state != RecordingState::Recording {
                    continue;
                }
                // File may not exist yet while the source connects
                if let Ok(metadata) = std::fs::metadata(&recording.output_path) {
                    recording.bytes_written = metadata.len();
                }
                observations.insert(recording.cam_id.clone(), recording.bytes_written);
            }
            (session.id.clone(), session.duration_ms(), observations)
        };

        for (cam_id, size) in &observations {
            if tracker.observe(cam_id, *size) {
                warn!("Recording stalled for {} (no file growth)", cam_id);
                self.events.publish(
                    EventType::RecorderStall,
                    Some(to_payload(&RecorderStallPayload {
                        session_id: session_id.clone(),
                        input_id: cam_id.clone(),
                    })),
                );
            }
        }

        self.events.publish(
            EventType::RecorderProgress,
            Some(to_payload(&RecorderProgressPayload {
                session_id,
                duration_ms,
                bytes_written: observations,
            })),
        );

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, EventBusConfig};

    fn valve_config(recordings_dir: PathBuf) -> Arc<AppConfig> {
        let mut config = AppConfig::default();
        config.cameras.clear();
        config.cameras.insert(
            "cam1".to_string(),
            CameraConfig {
                device: "/dev/video-test-missing".to_string(),
                variant: RecordingVariant::Valve,
                ..CameraConfig::default()
            },
        );
        config.recording.recordings_dir = recordings_dir;
        Arc::new(config)
    }

    fn test_recorder(config: Arc<AppConfig>) -> (Arc<SessionRecorder>, Arc<EventBus>) {
        let events = EventBus::new("test-unit", &EventBusConfig::default());
        let supervisor = IngestSupervisor::new(Arc::clone(&config), Arc::clone(&events));
        (
            SessionRecorder::new(config, Arc::clone(&events), supervisor),
            events,
        )
    }

    #[test]
    fn test_stall_tracker_fires_once_per_episode() {
        let mut tracker = StallTracker::new(3);
        assert!(!tracker.observe("cam1", 100)); // first observation
        assert!(!tracker.observe("cam1", 100)); // flat 1
        assert!(!tracker.observe("cam1", 100)); // flat 2
        assert!(tracker.observe("cam1", 100)); // flat 3 -> stall
        assert!(!tracker.observe("cam1", 100)); // still flat, already reported
        assert!(!tracker.observe("cam1", 200)); // growth resumes
        assert!(!tracker.observe("cam1", 200));
        assert!(!tracker.observe("cam1", 200));
        assert!(tracker.observe("cam1", 200)); // new episode
    }

    #[test]
    fn test_stall_tracker_ignores_empty_files() {
        let mut tracker = StallTracker::new(3);
        for _ in 0..10 {
            assert!(!tracker.observe("cam1", 0));
        }
    }

    #[tokio::test]
    async fn test_start_session_with_no_cameras_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.cameras.clear();
        config.recording.recordings_dir = dir.path().to_path_buf();
        let (recorder, _events) = test_recorder(Arc::new(config));

        let err = recorder
            .start_session(StartSessionRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
    }

    #[tokio::test]
    async fn test_start_session_insufficient_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.recording.recordings_dir = dir.path().to_path_buf();
        // No filesystem is this large
        config.recording.min_start_gb = 1e12;
        let (recorder, events) = test_recorder(Arc::new(config));
        let mut sub = events.subscribe();
        sub.rx.recv().await.unwrap();

        let err = recorder
            .start_session(StartSessionRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "storage-insufficient");

        // Exactly one error event, nothing else
        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Error);
        assert_eq!(event.payload.unwrap()["kind"], "storage-insufficient");
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_idempotency_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let config = valve_config(dir.path().to_path_buf());
        let (recorder, _events) = test_recorder(config);

        // Valve camera that is not streaming: the per-camera start fails,
        // but the session itself is created and recording.
        let first = recorder
            .start_session(StartSessionRequest {
                idempotency_key: Some("S1".to_string()),
                ..StartSessionRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(first.session_id, "S1");
        assert_eq!(first.results["cam1"], false);

        // Same key: idempotent replay of the active session
        let replay = recorder
            .start_session(StartSessionRequest {
                idempotency_key: Some("S1".to_string()),
                ..StartSessionRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(replay.session_id, "S1");

        // Different key while S1 is recording: conflict
        let err = recorder
            .start_session(StartSessionRequest {
                idempotency_key: Some("S2".to_string()),
                ..StartSessionRequest::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session-conflict");

        let status = recorder.status().await;
        assert!(status.recording);
        assert_eq!(status.session.unwrap().session_id, "S1");
    }

    #[tokio::test]
    async fn test_stop_session_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let config = valve_config(dir.path().to_path_buf());
        let (recorder, _events) = test_recorder(config);

        // Stop while idle: idempotent success
        let summary = recorder.stop_session(None).await.unwrap();
        assert!(summary.results.is_empty());

        recorder
            .start_session(StartSessionRequest {
                idempotency_key: Some("S1".to_string()),
                ..StartSessionRequest::default()
            })
            .await
            .unwrap();

        // Wrong session id: conflict
        let err = recorder.stop_session(Some("S9")).await.unwrap_err();
        assert_eq!(err.kind(), "session-conflict");

        // Matching id stops the session
        let summary = recorder.stop_session(Some("S1")).await.unwrap();
        assert_eq!(summary.session_id, "S1");

        // Stop after stop: idempotent success
        let summary = recorder.stop_session(None).await.unwrap();
        assert!(summary.results.is_empty());

        let status = recorder.status().await;
        assert!(!status.recording);
        assert_eq!(status.session.unwrap().state, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_session_sidecar_written_for_named_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = valve_config(dir.path().to_path_buf());
        let (recorder, _events) = test_recorder(config);

        recorder
            .start_session(StartSessionRequest {
                idempotency_key: Some("S1".to_string()),
                name: Some("Morning show".to_string()),
                ..StartSessionRequest::default()
            })
            .await
            .unwrap();

        let metadata = session::load_session_metadata(dir.path(), "S1");
        assert_eq!(metadata.name.as_deref(), Some("Morning show"));
    }

    #[tokio::test]
    async fn test_recorder_started_event_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let config = valve_config(dir.path().to_path_buf());
        let (recorder, events) = test_recorder(config);
        let mut sub = events.subscribe();
        sub.rx.recv().await.unwrap();

        recorder
            .start_session(StartSessionRequest {
                idempotency_key: Some("S1".to_string()),
                ..StartSessionRequest::default()
            })
            .await
            .unwrap();

        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::RecorderStarted);
        let payload = event.payload.unwrap();
        assert_eq!(payload["session_id"], "S1");

        recorder.stop_session(None).await.unwrap();
        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::RecorderStopped);
    }
}
