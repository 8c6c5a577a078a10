use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::error::Result;
use crate::events::{Event, EventBus, StateSnapshot, Subscription};
use crate::ingest::IngestSupervisor;
use crate::recorder::{storage, SessionRecorder};

/// Core context shared across the control surface
///
/// There is no hidden global state: the supervisor, recorder and event bus
/// are constructed once at startup and reach every entry point through
/// this object.
pub struct CoreContext {
    /// Loaded configuration (immutable after startup)
    pub config: Arc<AppConfig>,
    /// Event bus for real-time notifications
    pub events: Arc<EventBus>,
    /// Ingest supervisor (owns capture devices and encoding pipelines)
    pub supervisor: Arc<IngestSupervisor>,
    /// Session recorder (broker subscribers and valve control)
    pub recorder: Arc<SessionRecorder>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl CoreContext {
    pub fn new(
        config: Arc<AppConfig>,
        events: Arc<EventBus>,
        supervisor: Arc<IngestSupervisor>,
        recorder: Arc<SessionRecorder>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            supervisor,
            recorder,
            shutdown_tx,
        })
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Compose the authoritative state snapshot.
    ///
    /// Mode and session summary come from the recorder, per-input state
    /// from the supervisor, preview availability from the bus cache, and
    /// storage totals from the recordings filesystem. Buffered events are
    /// deltas on top of this ground truth.
    pub async fn snapshot(&self) -> StateSnapshot {
        let mut snapshot = self.events.cached_state();

        let recorder_status = self.recorder.status().await;
        snapshot.mode = if recorder_status.recording {
            "recording".to_string()
        } else {
            "idle".to_string()
        };
        snapshot.recording = if recorder_status.recording {
            recorder_status
                .session
                .and_then(|s| serde_json::to_value(s).ok())
        } else {
            None
        };

        for (input_id, status) in self.supervisor.status_all().await {
            if let Ok(value) = serde_json::to_value(&status) {
                snapshot.inputs.insert(input_id, value);
            }
        }

        if let Ok(space) = storage::disk_space(&self.config.recording.recordings_dir) {
            snapshot.storage = Some(json!({
                "total_gb": (space.total_gb() * 100.0).round() / 100.0,
                "available_gb": (space.available_gb() * 100.0).round() / 100.0,
            }));
        }

        snapshot
    }

    /// Connect a new event subscriber.
    pub fn subscribe_events(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Capabilities manifest for adaptive client UIs.
    pub fn capabilities(&self) -> crate::capabilities::DeviceCapabilities {
        crate::capabilities::device_capabilities(&self.config)
    }

    /// Build the catch-up response for a client reporting `last_seq`.
    pub async fn sync_response(&self, last_seq: u64) -> Event {
        let snapshot = self.snapshot().await;
        self.events.sync_response(last_seq, snapshot)
    }

    /// Graceful shutdown: stop any active session, stop every ingest
    /// pipeline, then signal the rest of the process.
    pub async fn shutdown(&self) -> Result<()> {
        self.recorder.shutdown().await;
        self.supervisor.shutdown().await;
        let _ = self.shutdown_tx.send(());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, EventBusConfig};
    use crate::events::EventType;
    use crate::recorder::StartSessionRequest;

    fn test_context() -> Arc<CoreContext> {
        let dir = std::env::temp_dir().join(format!("camcore-test-{}", uuid::Uuid::new_v4()));
        let mut config = AppConfig::default();
        config.cameras.clear();
        config.cameras.insert(
            "cam1".to_string(),
            CameraConfig {
                device: "/dev/video-test-missing".to_string(),
                variant: crate::config::RecordingVariant::Valve,
                ..CameraConfig::default()
            },
        );
        config.recording.recordings_dir = dir;
        let config = Arc::new(config);

        let events = EventBus::new(config.device_id.clone(), &EventBusConfig::default());
        let supervisor = IngestSupervisor::new(Arc::clone(&config), Arc::clone(&events));
        let recorder = SessionRecorder::new(
            Arc::clone(&config),
            Arc::clone(&events),
            Arc::clone(&supervisor),
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        CoreContext::new(config, events, supervisor, recorder, shutdown_tx)
    }

    #[tokio::test]
    async fn test_snapshot_reports_idle_inputs() {
        let ctx = test_context();
        let snapshot = ctx.snapshot().await;
        assert_eq!(snapshot.mode, "idle");
        assert!(snapshot.recording.is_none());
        assert_eq!(snapshot.inputs["cam1"]["state"], "idle");
        assert!(snapshot.storage.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_reflects_active_session() {
        let ctx = test_context();
        ctx.recorder
            .start_session(StartSessionRequest {
                idempotency_key: Some("S1".to_string()),
                ..StartSessionRequest::default()
            })
            .await
            .unwrap();

        let snapshot = ctx.snapshot().await;
        assert_eq!(snapshot.mode, "recording");
        assert_eq!(snapshot.recording.as_ref().unwrap()["session_id"], "S1");

        ctx.recorder.stop_session(None).await.unwrap();
        let snapshot = ctx.snapshot().await;
        assert_eq!(snapshot.mode, "idle");
        assert!(snapshot.recording.is_none());
    }

    #[tokio::test]
    async fn test_sync_response_carries_snapshot() {
        let ctx = test_context();
        ctx.events.publish(EventType::Heartbeat, None);

        let response = ctx.sync_response(0).await;
        assert_eq!(response.event_type, EventType::SyncResponse);
        let payload = response.payload.unwrap();
        assert_eq!(payload["can_replay"], true);
        assert_eq!(payload["state"]["mode"], "idle");
    }

    #[tokio::test]
    async fn test_reconnect_replays_missed_session_events() {
        let ctx = test_context();

        // A client connects, sees nothing, and drops
        let sub = ctx.subscribe_events();
        let last_seen = {
            let mut sub = sub;
            sub.rx.recv().await.unwrap().seq
        };

        // Session activity happens while the client is away
        ctx.recorder
            .start_session(StartSessionRequest {
                idempotency_key: Some("S1".to_string()),
                ..StartSessionRequest::default()
            })
            .await
            .unwrap();
        ctx.recorder.stop_session(None).await.unwrap();

        // On reconnect the missed deltas arrive in order, on top of a
        // snapshot that already reflects the stopped session
        let response = ctx.sync_response(last_seen).await;
        let payload = response.payload.unwrap();
        assert_eq!(payload["can_replay"], true);

        let events = payload["events"].as_array().unwrap();
        let types: Vec<&str> = events
            .iter()
            .map(|e| e["type"].as_str().unwrap())
            .collect();
        assert!(types.contains(&"recorder.started"));
        assert!(types.contains(&"recorder.stopped"));

        let seqs: Vec<u64> = events.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
        assert!(seqs.windows(2).all(|w| w[1] > w[0]));
        assert!(seqs.iter().all(|s| *s > last_seen));

        assert_eq!(payload["state"]["mode"], "idle");
    }

    #[tokio::test]
    async fn test_capabilities_manifest() {
        let ctx = test_context();
        let manifest = ctx.capabilities();
        assert_eq!(manifest.inputs.len(), 1);
        assert_eq!(manifest.inputs[0].id, "cam1");
        assert!(manifest.codecs.iter().any(|c| c.id == "h264_hw"));
    }
}
