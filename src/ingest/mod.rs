//! Ingest supervision
//!
//! The supervisor owns every capture device and the encoding pipeline on
//! top of it. Each enabled camera has exactly one entry in the pipeline
//! map; the map lock serializes all state transitions, and is never held
//! across media-framework calls — those are executed on blocking threads
//! and observed through bus messages.
//!
//! Ingest is always-on: once started, a camera's pipeline survives
//! recording start/stop and recorder crashes. The health loop reconciles
//! observed reality against the desired state, handling signal loss,
//! signal recovery (with the bridge handshake re-run) and resolution
//! changes, which force a rebuild because the hardware encoder cannot
//! renegotiate caps live.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{self, CaptureCapabilities};
use crate::config::{enabled_cameras, AppConfig, CameraConfig, RecordingVariant};
use crate::error::{AppError, Result};
use crate::events::{
    to_payload, EventBus, EventType, InputSignalPayload, PipelineErrorPayload,
    PreviewStartedPayload, PreviewStoppedPayload,
};
use crate::pipeline::{
    ingest_graph, runner::is_transient_error, tee_recording_graph, GraphMessage,
    IngestGraphParams, MediaGraph, START_TIMEOUT, STOP_EOS_TIMEOUT,
};
use crate::utils::LogThrottler;

/// Graph name prefix for ingest pipelines
const GRAPH_PREFIX: &str = "ingest_";

/// Observable state of one camera's ingest pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    /// Not started, or explicitly stopped by the operator
    Idle,
    Starting,
    Streaming,
    /// No signal on the input; the health loop retries on recovery
    NoSignal,
    /// Fatal failure awaiting retry or operator intervention
    Error,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::NoSignal => "no_signal",
            Self::Error => "error",
        }
    }
}

/// Valve-variant recording sub-state
#[derive(Debug, Clone, Serialize)]
pub struct ValveRecordingStatus {
    pub active: bool,
    pub path: PathBuf,
    pub duration_seconds: u64,
}

/// Status information for one ingest pipeline
#[derive(Debug, Clone, Serialize)]
pub struct IngestStatus {
    pub state: IngestState,
    pub has_signal: bool,
    pub resolution: Option<String>,
    pub framerate: Option<u32>,
    pub stream_url: Option<String>,
    pub error: Option<String>,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<ValveRecordingStatus>,
}

struct ValveRecording {
    path: PathBuf,
    active: bool,
    started_at: Option<Instant>,
}

struct CameraEntry {
    camera: CameraConfig,
    state: IngestState,
    graph: Option<MediaGraph>,
    resolution: Option<(u32, u32)>,
    framerate: Option<u32>,
    started_at: Option<Instant>,
    error_message: Option<String>,
    retry_count: u32,
    retry_token: Option<CancellationToken>,
    /// Last signal observation that was announced on the bus, used to
    /// emit input.signal_changed only on actual edges.
    announced_signal: Option<(bool, Option<(u32, u32)>)>,
    recording: Option<ValveRecording>,
}

impl CameraEntry {
    fn new(camera: CameraConfig) -> Self {
        Self {
            camera,
            state: IngestState::Idle,
            graph: None,
            resolution: None,
            framerate: None,
            started_at: None,
            error_message: None,
            retry_count: 0,
            retry_token: None,
            announced_signal: None,
            recording: None,
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(token) = self.retry_token.take() {
            token.cancel();
        }
    }
}

/// Exponential-backoff delay for restart attempt `attempt` (0-based).
fn retry_delay(attempt: u32) -> Duration {
    let secs = (2u64 << attempt.min(16)).min(10);
    Duration::from_secs(secs)
}

/// Whether a start/runtime failure is worth an automatic retry.
fn should_retry(err: &AppError) -> bool {
    match err {
        AppError::DeviceBusy(_) => true,
        AppError::PipelineRuntime { reason, .. } => is_transient_error(reason),
        AppError::PipelineStartFailed { reason, .. } => is_transient_error(reason),
        // Bridge handshake hiccups recover; an absent device node does not.
        AppError::CapabilitiesUnavailable { reason, .. } => {
            !reason.to_ascii_lowercase().contains("no such file")
        }
        _ => false,
    }
}

/// Supervisor for the set of ingest pipelines
pub struct IngestSupervisor {
    config: Arc<AppConfig>,
    events: Arc<EventBus>,
    pipelines: Mutex<BTreeMap<String, CameraEntry>>,
    graph_tx: mpsc::UnboundedSender<(String, GraphMessage)>,
    graph_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, GraphMessage)>>>,
    background_tasks_started: AtomicBool,
    probe_log_throttle: LogThrottler,
    shutdown: CancellationToken,
}

impl IngestSupervisor {
    pub fn new(config: Arc<AppConfig>, events: Arc<EventBus>) -> Arc<Self> {
        let (graph_tx, graph_rx) = mpsc::unbounded_channel();

        let mut pipelines = BTreeMap::new();
        for (cam_id, camera) in enabled_cameras(&config) {
            pipelines.insert(cam_id, CameraEntry::new(camera));
        }

        Arc::new(Self {
            config,
            events,
            pipelines: Mutex::new(pipelines),
            graph_tx,
            graph_rx: Mutex::new(Some(graph_rx)),
            background_tasks_started: AtomicBool::new(false),
            probe_log_throttle: LogThrottler::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the bus-message pump and the health loop. Idempotent; called
    /// once at startup.
    pub async fn spawn_background_tasks(self: &Arc<Self>) {
        if self.background_tasks_started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut rx) = self.graph_rx.lock().await.take() {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                while let Some((graph_name, message)) = rx.recv().await {
                    let Some(cam_id) = graph_name.strip_prefix(GRAPH_PREFIX) else {
                        continue;
                    };
                    supervisor.handle_graph_message(cam_id.to_string(), message).await;
                }
            });
        }

        let supervisor = Arc::clone(self);
        let interval = Duration::from_secs(self.config.supervisor.health_interval_secs.max(1));
        tokio::spawn(async move {
            info!("Ingest health loop running ({}s interval)", interval.as_secs());
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        supervisor.health_check().await;
                    }
                }
            }
            debug!("Ingest health loop exited");
        });
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Start ingest for one camera.
    ///
    /// Success means the pipeline is streaming to the broker. A missing
    /// input signal is an operational outcome, not an error: the returned
    /// status carries `no_signal` and the health loop takes over.
    pub async fn start(self: &Arc<Self>, cam_id: &str) -> Result<IngestStatus> {
        // Phase 1: claim the entry under the lock.
        let (camera, old_graph) = {
            let mut pipelines = self.pipelines.lock().await;
            let entry = pipelines
                .get_mut(cam_id)
                .ok_or_else(|| AppError::InvalidArgument(format!("unknown camera: {}", cam_id)))?;

            if entry.state == IngestState::Streaming {
                debug!("Camera {} is already streaming", cam_id);
                return Ok(Self::status_of(&self.config, cam_id, entry));
            }

            entry.cancel_retry();
            let old_graph = entry.graph.take();
            entry.state = IngestState::Starting;
            entry.error_message = None;
            (entry.camera.clone(), old_graph)
        };

        if let Some(graph) = old_graph {
            self.teardown_graph(graph, &camera).await;
        }

        // Phase 2: probe outside the lock. Bridge devices get the full
        // handshake, which also configures the capture node.
        let caps = self.probe_for_start(&camera).await;
        let caps = match caps {
            Ok(caps) => caps,
            Err(e) => {
                self.fail_start(cam_id, &e).await;
                return Err(e);
            }
        };

        if !caps.has_signal {
            info!("No signal on {} ({})", cam_id, camera.device);
            let mut pipelines = self.pipelines.lock().await;
            if let Some(entry) = pipelines.get_mut(cam_id) {
                entry.state = IngestState::NoSignal;
                entry.resolution = None;
                entry.framerate = None;
                self.announce_signal(cam_id, entry, &caps);
                return Ok(Self::status_of(&self.config, cam_id, entry));
            }
            return Err(AppError::InvalidArgument(format!("unknown camera: {}", cam_id)));
        }

        // Phase 3: build and start the graph, still outside the lock.
        let started = self.build_and_start(cam_id, &camera, &caps).await;
        match started {
            Ok((graph, recording)) => {
                let rtsp_url = self.config.broker.rtsp_url(cam_id);
                let mut pipelines = self.pipelines.lock().await;
                let entry = pipelines.get_mut(cam_id).ok_or_else(|| {
                    AppError::Internal(format!("camera entry vanished: {}", cam_id))
                })?;
                entry.graph = Some(graph);
                entry.state = IngestState::Streaming;
                entry.started_at = Some(Instant::now());
                entry.resolution = Some((caps.width, caps.height));
                entry.framerate = Some(caps.framerate);
                entry.retry_count = 0;
                entry.error_message = None;
                entry.recording = recording;

                info!(
                    "Ingest streaming for {}: {}x{}@{} -> {}",
                    cam_id, caps.width, caps.height, caps.framerate, rtsp_url
                );

                self.announce_signal(cam_id, entry, &caps);
                self.events.publish(
                    EventType::PreviewStarted,
                    Some(to_payload(&PreviewStartedPayload {
                        input_id: cam_id.to_string(),
                        rtsp_url,
                    })),
                );

                Ok(Self::status_of(&self.config, cam_id, entry))
            }
            Err(e) => {
                self.fail_start(cam_id, &e).await;
                Err(e)
            }
        }
    }

    /// Stop ingest for one camera (operator intent: stays down until the
    /// next explicit start). Cancels any scheduled retry.
    pub async fn stop(&self, cam_id: &str) -> Result<()> {
        let (graph, camera, was_streaming) = {
            let mut pipelines = self.pipelines.lock().await;
            let entry = pipelines
                .get_mut(cam_id)
                .ok_or_else(|| AppError::InvalidArgument(format!("unknown camera: {}", cam_id)))?;

            entry.cancel_retry();
            let was_streaming = entry.state == IngestState::Streaming;
            let graph = entry.graph.take();
            entry.state = IngestState::Idle;
            entry.started_at = None;
            entry.resolution = None;
            entry.framerate = None;
            if let Some(rec) = entry.recording.as_mut() {
                rec.active = false;
            }
            (graph, entry.camera.clone(), was_streaming)
        };

        if let Some(graph) = graph {
            self.teardown_graph(graph, &camera).await;
        }

        if was_streaming {
            self.events.publish(
                EventType::PreviewStopped,
                Some(to_payload(&PreviewStoppedPayload {
                    input_id: cam_id.to_string(),
                })),
            );
        }

        info!("Stopped ingest for {}", cam_id);
        Ok(())
    }

    /// Start ingest for every enabled camera, with a short delay between
    /// starts so the encoder pool is not slammed all at once.
    pub async fn start_all(self: &Arc<Self>) -> BTreeMap<String, bool> {
        let cam_ids: Vec<String> = self.pipelines.lock().await.keys().cloned().collect();
        let delay = Duration::from_millis(self.config.supervisor.inter_start_delay_ms);

        let mut results = BTreeMap::new();
        for cam_id in cam_ids {
            let ok = match self.start(&cam_id).await {
                Ok(status) => status.state == IngestState::Streaming,
                Err(e) => {
                    warn!("start_all: {} failed: {}", cam_id, e);
                    false
                }
            };
            results.insert(cam_id, ok);
            tokio::time::sleep(delay).await;
        }
        results
    }

    /// Stop ingest for every camera, staggered like start_all.
    pub async fn stop_all(&self) -> BTreeMap<String, bool> {
        let cam_ids: Vec<String> = self.pipelines.lock().await.keys().cloned().collect();
        let delay = Duration::from_millis(self.config.supervisor.inter_stop_delay_ms);

        let mut results = BTreeMap::new();
        for cam_id in cam_ids {
            let ok = self.stop(&cam_id).await.is_ok();
            results.insert(cam_id, ok);
            tokio::time::sleep(delay).await;
        }
        results
    }

    /// Status for one camera
    pub async fn status(&self, cam_id: &str) -> Option<IngestStatus> {
        let pipelines = self.pipelines.lock().await;
        pipelines
            .get(cam_id)
            .map(|entry| Self::status_of(&self.config, cam_id, entry))
    }

    /// Status for every camera
    pub async fn status_all(&self) -> BTreeMap<String, IngestStatus> {
        let pipelines = self.pipelines.lock().await;
        pipelines
            .iter()
            .map(|(cam_id, entry)| (cam_id.clone(), Self::status_of(&self.config, cam_id, entry)))
            .collect()
    }

    /// Cancel background loops and tear down every pipeline.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = self.stop_all().await;
    }

    // =========================================================================
    // Valve recording control (tee-variant cameras)
    // =========================================================================

    /// Begin recording on a valve-variant camera by opening its valve.
    /// Returns the path of the file now growing.
    pub async fn start_valve_recording(&self, cam_id: &str) -> Result<PathBuf> {
        let mut pipelines = self.pipelines.lock().await;
        let entry = pipelines
            .get_mut(cam_id)
            .ok_or_else(|| AppError::InvalidArgument(format!("unknown camera: {}", cam_id)))?;

        if entry.camera.variant != RecordingVariant::Valve {
            return Err(AppError::InvalidArgument(format!(
                "camera {} does not use valve recording",
                cam_id
            )));
        }
        if entry.state != IngestState::Streaming {
            return Err(AppError::PipelineRuntime {
                pipeline: format!("{}{}", GRAPH_PREFIX, cam_id),
                reason: format!("not streaming (state={})", entry.state.as_str()),
            });
        }

        let recording = entry.recording.as_mut().ok_or_else(|| {
            AppError::Internal(format!("valve pipeline without recording state: {}", cam_id))
        })?;
        if recording.active {
            debug!("Valve recording already active for {}", cam_id);
            return Ok(recording.path.clone());
        }

        let graph = entry.graph.as_ref().ok_or_else(|| {
            AppError::Internal(format!("streaming entry without graph: {}", cam_id))
        })?;
        graph.set_valve(true)?;

        recording.active = true;
        recording.started_at = Some(Instant::now());
        let path = recording.path.clone();

        info!("Valve recording started for {}: {}", cam_id, path.display());
        Ok(path)
    }

    /// End recording on a valve-variant camera by closing its valve.
    pub async fn stop_valve_recording(&self, cam_id: &str) -> Result<()> {
        let mut pipelines = self.pipelines.lock().await;
        let entry = pipelines
            .get_mut(cam_id)
            .ok_or_else(|| AppError::InvalidArgument(format!("unknown camera: {}", cam_id)))?;

        let Some(recording) = entry.recording.as_mut() else {
            return Ok(());
        };
        if !recording.active {
            return Ok(());
        }

        if let Some(graph) = entry.graph.as_ref() {
            graph.set_valve(false)?;
        }
        recording.active = false;
        let duration = recording
            .started_at
            .take()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);

        info!(
            "Valve recording stopped for {} after {}s: {}",
            cam_id,
            duration,
            recording.path.display()
        );
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn status_of(config: &AppConfig, cam_id: &str, entry: &CameraEntry) -> IngestStatus {
        let streaming = entry.state == IngestState::Streaming;
        IngestStatus {
            state: entry.state,
            has_signal: !matches!(entry.state, IngestState::NoSignal | IngestState::Idle),
            resolution: entry.resolution.map(|(w, h)| format!("{}x{}", w, h)),
            framerate: entry.framerate,
            stream_url: streaming.then(|| config.broker.rtsp_url(cam_id)),
            error: entry.error_message.clone(),
            uptime_seconds: entry
                .started_at
                .filter(|_| streaming)
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            recording: entry.recording.as_ref().map(|rec| ValveRecordingStatus {
                active: rec.active,
                path: rec.path.clone(),
                duration_seconds: rec
                    .started_at
                    .filter(|_| rec.active)
                    .map(|t| t.elapsed().as_secs())
                    .unwrap_or(0),
            }),
        }
    }

    async fn probe_for_start(&self, camera: &CameraConfig) -> Result<CaptureCapabilities> {
        let camera = camera.clone();
        tokio::task::spawn_blocking(move || match &camera.bridge_subdev {
            Some(subdev) => capture::initialize_bridge(&camera.device, subdev, camera.fps),
            None => Ok(capture::probe(&camera.device)),
        })
        .await
        .map_err(|e| AppError::Internal(format!("probe task: {}", e)))?
    }

    async fn build_and_start(
        &self,
        cam_id: &str,
        camera: &CameraConfig,
        caps: &CaptureCapabilities,
    ) -> Result<(MediaGraph, Option<ValveRecording>)> {
        let rtsp_url = self.config.broker.rtsp_url(cam_id);
        let graph_name = format!("{}{}", GRAPH_PREFIX, cam_id);

        let (description, recording) = match camera.variant {
            RecordingVariant::Subscriber => {
                let params = IngestGraphParams {
                    device: &camera.device,
                    width: caps.width,
                    height: caps.height,
                    framerate: caps.framerate.max(1),
                    bitrate_kbps: camera.preview_bitrate_kbps,
                    rtsp_url: &rtsp_url,
                };
                (ingest_graph(&params), None)
            }
            RecordingVariant::Valve => {
                let path = self.valve_recording_path(cam_id);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let params = IngestGraphParams {
                    device: &camera.device,
                    width: caps.width,
                    height: caps.height,
                    framerate: caps.framerate.max(1),
                    bitrate_kbps: camera.recording_bitrate_kbps,
                    rtsp_url: &rtsp_url,
                };
                let description = tee_recording_graph(
                    &params,
                    &path,
                    self.config.recording.fragment_duration_ms,
                );
                (
                    description,
                    Some(ValveRecording {
                        path,
                        active: false,
                        started_at: None,
                    }),
                )
            }
        };

        let graph = MediaGraph::launch(&graph_name, &description, self.graph_tx.clone())?;
        let graph = tokio::task::spawn_blocking(move || {
            graph.start(START_TIMEOUT).map(|_| graph)
        })
        .await
        .map_err(|e| AppError::Internal(format!("start task: {}", e)))??;

        Ok((graph, recording))
    }

    fn valve_recording_path(&self, cam_id: &str) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        self.config
            .recording
            .recordings_dir
            .join(format!("{}_{}.mp4", cam_id, timestamp))
    }

    async fn teardown_graph(&self, mut graph: MediaGraph, camera: &CameraConfig) {
        // Only tee graphs hold an open file worth flushing; plain ingest
        // graphs drop straight to NULL.
        let eos_timeout = match camera.variant {
            RecordingVariant::Valve => STOP_EOS_TIMEOUT,
            RecordingVariant::Subscriber => Duration::from_secs(1),
        };
        let result = tokio::task::spawn_blocking(move || graph.stop(eos_timeout)).await;
        if let Err(e) = result {
            warn!("Teardown task failed: {}", e);
        }
    }

    async fn fail_start(self: &Arc<Self>, cam_id: &str, err: &AppError) {
        error!("Failed to start ingest for {}: {}", cam_id, err);

        let retry = {
            let mut pipelines = self.pipelines.lock().await;
            let Some(entry) = pipelines.get_mut(cam_id) else {
                return;
            };
            entry.state = IngestState::Error;
            entry.error_message = Some(err.to_string());
            entry.graph = None;

            (should_retry(err) && entry.retry_count < self.config.supervisor.max_retries)
                .then(|| {
                    let attempt = entry.retry_count;
                    entry.retry_count += 1;
                    let token = CancellationToken::new();
                    entry.retry_token = Some(token.clone());
                    (attempt, token)
                })
        };

        self.events.publish(
            EventType::PipelineError,
            Some(to_payload(&PipelineErrorPayload {
                pipeline_id: format!("{}{}", GRAPH_PREFIX, cam_id),
                input_id: Some(cam_id.to_string()),
                error: err.to_string(),
            })),
        );

        if let Some((attempt, token)) = retry {
            self.schedule_retry(cam_id, attempt, token);
        }
    }

    fn schedule_retry(self: &Arc<Self>, cam_id: &str, attempt: u32, token: CancellationToken) {
        let delay = retry_delay(attempt);
        let max = self.config.supervisor.max_retries;
        info!(
            "Scheduling restart for {} in {:?} (attempt {}/{})",
            cam_id,
            delay,
            attempt + 1,
            max
        );

        let supervisor = Arc::clone(self);
        let cam_id = cam_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // Only retry out of the error state; an operator stop or a
            // successful health-loop restart wins.
            let still_errored = supervisor
                .status(&cam_id)
                .await
                .map(|s| s.state == IngestState::Error)
                .unwrap_or(false);
            if still_errored {
                let _ = supervisor.start(&cam_id).await;
            }
        });
    }

    /// React to bus traffic from a camera's graph.
    async fn handle_graph_message(self: &Arc<Self>, cam_id: String, message: GraphMessage) {
        match message {
            GraphMessage::Running => {
                debug!("Graph running for {}", cam_id);
            }
            GraphMessage::Warning { message } => {
                warn!("Ingest warning for {}: {}", cam_id, message);
            }
            GraphMessage::Eos => {
                self.handle_graph_failure(&cam_id, "unexpected end of stream".to_string())
                    .await;
            }
            GraphMessage::Error { source, message } => {
                error!("Ingest error for {} from {}: {}", cam_id, source, message);
                self.handle_graph_failure(&cam_id, message).await;
            }
        }
    }

    async fn handle_graph_failure(self: &Arc<Self>, cam_id: &str, message: String) {
        let (graph, camera, was_streaming) = {
            let mut pipelines = self.pipelines.lock().await;
            let Some(entry) = pipelines.get_mut(cam_id) else {
                return;
            };
            // Stale message from a graph already torn down
            if !matches!(entry.state, IngestState::Streaming | IngestState::Starting) {
                return;
            }
            let was_streaming = entry.state == IngestState::Streaming;
            entry.state = IngestState::Error;
            entry.error_message = Some(message.clone());
            if let Some(rec) = entry.recording.as_mut() {
                rec.active = false;
            }
            (entry.graph.take(), entry.camera.clone(), was_streaming)
        };

        if let Some(graph) = graph {
            self.teardown_graph(graph, &camera).await;
        }
        if was_streaming {
            self.events.publish(
                EventType::PreviewStopped,
                Some(to_payload(&PreviewStoppedPayload {
                    input_id: cam_id.to_string(),
                })),
            );
        }

        let err = AppError::PipelineRuntime {
            pipeline: format!("{}{}", GRAPH_PREFIX, cam_id),
            reason: message,
        };
        self.fail_start(cam_id, &err).await;
    }

    /// Emit input.signal_changed when the observation differs from what was
    /// last announced.
    fn announce_signal(&self, cam_id: &str, entry: &mut CameraEntry, caps: &CaptureCapabilities) {
        let observation = (caps.has_signal, caps.resolution());
        if entry.announced_signal == Some(observation) {
            return;
        }
        entry.announced_signal = Some(observation);

        self.events.publish(
            EventType::InputSignalChanged,
            Some(to_payload(&InputSignalPayload {
                input_id: cam_id.to_string(),
                has_signal: caps.has_signal,
                resolution: caps.resolution_label(),
                framerate: caps.has_signal.then_some(caps.framerate),
            })),
        );
    }

    // =========================================================================
    // Health loop
    // =========================================================================

    async fn health_check(self: &Arc<Self>) {
        // Snapshot states without holding the lock across probes.
        let observed: Vec<(String, CameraConfig, IngestState, Option<(u32, u32)>)> = {
            let pipelines = self.pipelines.lock().await;
            pipelines
                .iter()
                .map(|(id, e)| (id.clone(), e.camera.clone(), e.state, e.resolution))
                .collect()
        };

        for (cam_id, camera, state, recorded_resolution) in observed {
            let caps = {
                let camera = camera.clone();
                match tokio::task::spawn_blocking(move || capture::probe_camera(&camera)).await {
                    Ok(caps) => {
                        self.probe_log_throttle.clear(&cam_id);
                        caps
                    }
                    Err(e) => {
                        if self.probe_log_throttle.should_log(&cam_id) {
                            warn!("Health probe task failed for {}: {}", cam_id, e);
                        }
                        continue;
                    }
                }
            };

            match (state, caps.has_signal) {
                // Signal lost while streaming: down to no_signal, announce.
                (IngestState::Streaming, false) => {
                    warn!("{}: signal lost, stopping ingest", cam_id);
                    let (graph, was_streaming) = {
                        let mut pipelines = self.pipelines.lock().await;
                        let Some(entry) = pipelines.get_mut(cam_id.as_str()) else {
                            continue;
                        };
                        if entry.state != IngestState::Streaming {
                            continue;
                        }
                        entry.state = IngestState::NoSignal;
                        entry.resolution = None;
                        entry.framerate = None;
                        entry.started_at = None;
                        if let Some(rec) = entry.recording.as_mut() {
                            rec.active = false;
                        }
                        self.announce_signal(&cam_id, entry, &caps);
                        (entry.graph.take(), true)
                    };
                    if let Some(graph) = graph {
                        self.teardown_graph(graph, &camera).await;
                    }
                    if was_streaming {
                        self.events.publish(
                            EventType::PreviewStopped,
                            Some(to_payload(&PreviewStoppedPayload {
                                input_id: cam_id.clone(),
                            })),
                        );
                    }
                }

                // Signal recovered: settle briefly, then start (the start
                // path re-runs the bridge handshake).
                (IngestState::NoSignal, true) => {
                    info!(
                        "{}: signal recovered ({}x{}), starting ingest",
                        cam_id, caps.width, caps.height
                    );
                    tokio::time::sleep(Duration::from_millis(
                        self.config.supervisor.settle_delay_ms,
                    ))
                    .await;
                    let _ = self.start(&cam_id).await;
                }

                // Resolution changed under a live encoder: rebuild.
                (IngestState::Streaming, true) => {
                    let observed_resolution = caps.resolution();
                    if let (Some(old), Some(new)) = (recorded_resolution, observed_resolution) {
                        if old != new {
                            info!(
                                "{}: resolution changed {}x{} -> {}x{}, rebuilding",
                                cam_id, old.0, old.1, new.0, new.1
                            );
                            let graph = {
                                let mut pipelines = self.pipelines.lock().await;
                                let Some(entry) = pipelines.get_mut(cam_id.as_str()) else {
                                    continue;
                                };
                                if entry.state != IngestState::Streaming {
                                    continue;
                                }
                                entry.state = IngestState::Starting;
                                entry.graph.take()
                            };
                            if let Some(graph) = graph {
                                self.teardown_graph(graph, &camera).await;
                            }
                            tokio::time::sleep(Duration::from_millis(
                                self.config.supervisor.settle_delay_ms,
                            ))
                            .await;
                            let _ = self.start(&cam_id).await;
                        }
                    }
                }

                // Error entries are owned by the retry timers; idle entries
                // were stopped by the operator and stay down.
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventBusConfig;

    fn test_config() -> Arc<AppConfig> {
        let mut config = AppConfig::default();
        config.cameras.clear();
        config.cameras.insert(
            "cam1".to_string(),
            CameraConfig {
                device: "/dev/video-test-missing".to_string(),
                bridge_subdev: None,
                ..CameraConfig::default()
            },
        );
        Arc::new(config)
    }

    fn test_supervisor() -> (Arc<IngestSupervisor>, Arc<EventBus>) {
        let config = test_config();
        let events = EventBus::new("test-unit", &EventBusConfig::default());
        (IngestSupervisor::new(config, Arc::clone(&events)), events)
    }

    #[test]
    fn test_retry_delay_law() {
        assert_eq!(retry_delay(0), Duration::from_secs(2));
        assert_eq!(retry_delay(1), Duration::from_secs(4));
        assert_eq!(retry_delay(2), Duration::from_secs(8));
        assert_eq!(retry_delay(3), Duration::from_secs(10));
        assert_eq!(retry_delay(30), Duration::from_secs(10));
    }

    #[test]
    fn test_should_retry_classification() {
        assert!(should_retry(&AppError::DeviceBusy("/dev/video60".into())));
        assert!(should_retry(&AppError::PipelineRuntime {
            pipeline: "ingest_cam1".into(),
            reason: "Internal data stream error".into()
        }));
        assert!(!should_retry(&AppError::PipelineRuntime {
            pipeline: "ingest_cam1".into(),
            reason: "negotiation failed".into()
        }));
        assert!(should_retry(&AppError::CapabilitiesUnavailable {
            device: "/dev/v4l-subdev2".into(),
            reason: "VIDIOC_SUBDEV_G_FMT: EBUSY".into()
        }));
        assert!(!should_retry(&AppError::CapabilitiesUnavailable {
            device: "/dev/v4l-subdev2".into(),
            reason: "open: No such file or directory".into()
        }));
        assert!(!should_retry(&AppError::InvalidArgument("nope".into())));
    }

    #[tokio::test]
    async fn test_start_unknown_camera_is_invalid() {
        let (supervisor, _events) = test_supervisor();
        let err = supervisor.start("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
    }

    #[tokio::test]
    async fn test_start_without_signal_is_operational() {
        let (supervisor, events) = test_supervisor();
        let mut sub = events.subscribe();
        sub.rx.recv().await.unwrap(); // connected

        let status = supervisor.start("cam1").await.unwrap();
        assert_eq!(status.state, IngestState::NoSignal);
        assert!(!status.has_signal);
        assert!(status.stream_url.is_none());

        // The missing signal is announced exactly once
        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::InputSignalChanged);
        let payload = event.payload.unwrap();
        assert_eq!(payload["input_id"], "cam1");
        assert_eq!(payload["has_signal"], false);

        // A second start against the same dead input does not re-announce
        let status = supervisor.start("cam1").await.unwrap();
        assert_eq!(status.state, IngestState::NoSignal);
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (supervisor, _events) = test_supervisor();
        supervisor.stop("cam1").await.unwrap();
        supervisor.stop("cam1").await.unwrap();
        let status = supervisor.status("cam1").await.unwrap();
        assert_eq!(status.state, IngestState::Idle);
    }

    #[tokio::test]
    async fn test_start_all_reports_per_camera_outcome() {
        let (supervisor, _events) = test_supervisor();
        let results = supervisor.start_all().await;
        assert_eq!(results.len(), 1);
        // No signal is an unsuccessful (but non-error) start
        assert_eq!(results["cam1"], false);
    }

    #[tokio::test]
    async fn test_valve_recording_requires_valve_variant() {
        let (supervisor, _events) = test_supervisor();
        let err = supervisor.start_valve_recording("cam1").await.unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
    }

    #[tokio::test]
    async fn test_valve_recording_requires_streaming() {
        let config = {
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
            Arc::new(config)
        };
        let events = EventBus::new("test-unit", &EventBusConfig::default());
        let supervisor = IngestSupervisor::new(config, events);

        let err = supervisor.start_valve_recording("cam1").await.unwrap_err();
        assert_eq!(err.kind(), "pipeline-runtime-error");
    }

    #[tokio::test]
    async fn test_status_all_covers_enabled_cameras() {
        let (supervisor, _events) = test_supervisor();
        let statuses = supervisor.status_all().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses["cam1"].state, IngestState::Idle);
        assert!(!statuses["cam1"].has_signal);
    }
}
