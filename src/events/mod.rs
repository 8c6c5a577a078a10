//! Event system for real-time state notifications
//!
//! This module provides the event bus that fans state changes out to
//! connected clients with ordering, replay and catch-up guarantees:
//!
//! - A single monotonic sequence counter; incrementing it is the only way
//!   an event obtains a sequence number, and assignment happens at enqueue
//!   time under the bus lock.
//! - A bounded FIFO of recent events for subscriber catch-up. On overflow
//!   the oldest event is discarded and the replay floor rises.
//! - Per-subscriber ordered delivery over unbounded channels; a subscriber
//!   whose channel is gone is disconnected on the next publish.
//! - A heartbeat broadcast while at least one subscriber is connected.
//! - A cached client-visible state, updated atomically with sequence
//!   assignment so a snapshot never reflects half of an in-flight event.

pub mod types;

pub use types::{
    Event, EventType, InputSignalPayload, ModeChangedPayload, PipelineErrorPayload, PreviewState,
    PreviewStartedPayload, PreviewStoppedPayload, RecorderProgressPayload, RecorderStallPayload,
    RecorderStartedPayload, RecorderStoppedPayload, StateSnapshot, StoragePayload, SyncPayload,
    SCHEMA_VERSION,
};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EventBusConfig;

/// Serialize a typed payload, falling back to null rather than dropping
/// the event. Payload structs contain only string keys, so failure here
/// indicates a programming error worth a log line, not a panic.
pub fn to_payload<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!("Failed to serialize event payload: {}", e);
        Value::Null
    })
}

/// A live subscription to the event bus
///
/// Events arrive on `rx` in strict sequence order, starting with the
/// `connected` greeting. Dropping the receiver disconnects the subscriber
/// on the next publish.
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::UnboundedReceiver<Event>,
}

/// Client-visible state maintained from the event stream
#[derive(Debug, Clone, Default)]
struct CachedState {
    mode: String,
    recording: Option<Value>,
    inputs: BTreeMap<String, Value>,
    previews: BTreeMap<String, PreviewState>,
}

struct SubscriberEntry {
    tx: mpsc::UnboundedSender<Event>,
    /// Topic patterns this subscriber asked for; None means everything
    topics: Option<Vec<String>>,
}

impl SubscriberEntry {
    /// Heartbeats and failure notices always go through; everything else
    /// is subject to the subscriber's topic filter.
    fn wants(&self, event_type: EventType) -> bool {
        if matches!(event_type, EventType::Heartbeat | EventType::Error) {
            return true;
        }
        match &self.topics {
            None => true,
            Some(topics) => topics.iter().any(|t| event_type.matches_topic(t)),
        }
    }
}

struct BusInner {
    seq: u64,
    buffer: VecDeque<Event>,
    subscribers: HashMap<Uuid, SubscriberEntry>,
    state: CachedState,
    heartbeat: Option<CancellationToken>,
}

/// Event bus with replay and catch-up support
pub struct EventBus {
    device_id: String,
    capacity: usize,
    heartbeat_interval: Duration,
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new(device_id: impl Into<String>, config: &EventBusConfig) -> Arc<Self> {
        Arc::new(Self {
            device_id: device_id.into(),
            capacity: config.replay_buffer_size.max(1),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            inner: Mutex::new(BusInner {
                seq: 0,
                buffer: VecDeque::new(),
                subscribers: HashMap::new(),
                state: CachedState {
                    mode: "idle".to_string(),
                    ..CachedState::default()
                },
                heartbeat: None,
            }),
        })
    }

    /// Publish an event to all subscribers.
    ///
    /// Assigns the sequence number, updates the cached state, appends to the
    /// replay buffer and delivers to every connected subscriber, all under
    /// the bus lock so each subscriber observes the same total order.
    /// Returns the assigned sequence number.
    pub fn publish(&self, event_type: EventType, payload: Option<Value>) -> u64 {
        let mut inner = self.inner.lock();
        inner.seq += 1;

        let event = Event {
            v: SCHEMA_VERSION,
            event_type,
            seq: inner.seq,
            ts: Utc::now(),
            device_id: self.device_id.clone(),
            payload,
        };

        inner.apply_state_update(&event);

        if inner.buffer.len() == self.capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(event.clone());

        let mut disconnected = Vec::new();
        for (id, subscriber) in &inner.subscribers {
            if !subscriber.wants(event.event_type) {
                continue;
            }
            if subscriber.tx.send(event.clone()).is_err() {
                disconnected.push(*id);
            }
        }
        for id in disconnected {
            debug!("Subscriber {} gone, removing", id);
            inner.subscribers.remove(&id);
        }
        if inner.subscribers.is_empty() {
            Self::stop_heartbeat(&mut inner);
        }

        event.seq
    }

    /// Subscribe to events.
    ///
    /// The new subscriber immediately receives a `connected` event with a
    /// freshly assigned sequence number and is expected to receive every
    /// subsequent event. The first subscriber starts the heartbeat.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        self.subscribe_inner(None)
    }

    /// Subscribe with a topic filter, e.g. `["recorder.*", "error"]`.
    ///
    /// Heartbeats and error notices are always delivered so liveness and
    /// failures stay visible. Note that a filtered subscriber observes a
    /// gapped sequence and should resync via the catch-up protocol rather
    /// than treating gaps as loss.
    pub fn subscribe_filtered(self: &Arc<Self>, topics: Vec<String>) -> Subscription {
        self.subscribe_inner(Some(topics))
    }

    fn subscribe_inner(self: &Arc<Self>, topics: Option<Vec<String>>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let mut inner = self.inner.lock();
        inner.seq += 1;
        let connected = Event {
            v: SCHEMA_VERSION,
            event_type: EventType::Connected,
            seq: inner.seq,
            ts: Utc::now(),
            device_id: self.device_id.clone(),
            payload: Some(json!({
                "client_id": id,
                "core_version": env!("CARGO_PKG_VERSION"),
            })),
        };
        // Addressed to this subscriber only, so it is not buffered for replay.
        let _ = tx.send(connected);

        inner.subscribers.insert(id, SubscriberEntry { tx, topics });
        if inner.subscribers.len() == 1 {
            self.start_heartbeat(&mut inner);
        }

        Subscription { id, rx }
    }

    /// Remove a subscriber. The last disconnect stops the heartbeat.
    pub fn unsubscribe(&self, id: Uuid) {
        let mut inner = self.inner.lock();
        inner.subscribers.remove(&id);
        if inner.subscribers.is_empty() {
            Self::stop_heartbeat(&mut inner);
        }
    }

    /// Number of connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Latest assigned sequence number
    pub fn latest_seq(&self) -> u64 {
        self.inner.lock().seq
    }

    /// Lowest sequence currently retained for replay, if any
    pub fn min_buffered_seq(&self) -> Option<u64> {
        self.inner.lock().buffer.front().map(|e| e.seq)
    }

    /// Build a sync response for a client reporting `last_seq`.
    ///
    /// When the client's acknowledged sequence is still inside the replay
    /// window, the response carries every buffered event past it, in order,
    /// plus the snapshot. Otherwise `can_replay` is false and the client
    /// must discard local state and adopt the snapshot.
    ///
    /// The response is addressed, not broadcast: it gets its own sequence
    /// number but does not enter the replay buffer.
    pub fn sync_response(&self, last_seq: u64, state: StateSnapshot) -> Event {
        let mut inner = self.inner.lock();

        let can_replay = match inner.buffer.front() {
            // Nothing broadcast yet: only a brand-new client can be current.
            None => last_seq == 0,
            Some(front) => last_seq + 1 >= front.seq,
        };

        let events: Vec<Event> = if can_replay {
            inner
                .buffer
                .iter()
                .filter(|e| e.seq > last_seq)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let payload = SyncPayload {
            last_seq,
            current_seq: inner.seq,
            can_replay,
            missed_event_count: events.len(),
            events,
            state,
        };

        inner.seq += 1;
        Event {
            v: SCHEMA_VERSION,
            event_type: EventType::SyncResponse,
            seq: inner.seq,
            ts: Utc::now(),
            device_id: self.device_id.clone(),
            payload: Some(to_payload(&payload)),
        }
    }

    /// Cached client-visible state, as accumulated from published events.
    ///
    /// The authoritative snapshot is composed by the core context from the
    /// supervisor and recorder; this cache supplies the per-input and
    /// preview entries and serves as the fallback when those components are
    /// unavailable.
    pub fn cached_state(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            mode: inner.state.mode.clone(),
            recording: inner.state.recording.clone(),
            inputs: inner.state.inputs.clone(),
            previews: inner.state.previews.clone(),
            storage: None,
        }
    }

    fn start_heartbeat(self: &Arc<Self>, inner: &mut BusInner) {
        let token = CancellationToken::new();
        inner.heartbeat = Some(token.clone());

        let bus = Arc::clone(self);
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        bus.publish(EventType::Heartbeat, None);
                    }
                }
            }
        });
    }

    fn stop_heartbeat(inner: &mut BusInner) {
        if let Some(token) = inner.heartbeat.take() {
            token.cancel();
        }
    }
}

impl BusInner {
    /// State-cache update rule.
    ///
    /// Runs under the bus lock in the same critical section that assigns
    /// the sequence number, so a snapshot taken between two publishes never
    /// includes a partial view of either.
    fn apply_state_update(&mut self, event: &Event) {
        match event.event_type {
            EventType::RecorderStarted => {
                self.state.mode = "recording".to_string();
                self.state.recording = event.payload.clone();
            }
            EventType::RecorderStopped => {
                self.state.mode = "idle".to_string();
                self.state.recording = None;
            }
            EventType::RecorderProgress => {
                if let Some(Value::Object(update)) = &event.payload {
                    let merged = match self.state.recording.take() {
                        Some(Value::Object(mut existing)) => {
                            existing.extend(update.clone());
                            Value::Object(existing)
                        }
                        _ => Value::Object(update.clone()),
                    };
                    self.state.recording = Some(merged);
                }
            }
            EventType::ModeChanged => {
                if let Some(mode) = event
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("mode"))
                    .and_then(|m| m.as_str())
                {
                    self.state.mode = mode.to_string();
                }
            }
            EventType::InputSignalChanged => {
                if let Some(input_id) = event
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("input_id"))
                    .and_then(|i| i.as_str())
                {
                    self.state
                        .inputs
                        .insert(input_id.to_string(), event.payload.clone().unwrap_or(Value::Null));
                }
            }
            EventType::PreviewStarted => {
                if let Some(payload) = &event.payload {
                    if let Some(input_id) = payload.get("input_id").and_then(|i| i.as_str()) {
                        let rtsp_url = payload
                            .get("rtsp_url")
                            .and_then(|u| u.as_str())
                            .map(str::to_string);
                        self.state.previews.insert(
                            input_id.to_string(),
                            PreviewState {
                                running: true,
                                rtsp_url,
                            },
                        );
                    }
                }
            }
            EventType::PreviewStopped => {
                if let Some(input_id) = event
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("input_id"))
                    .and_then(|i| i.as_str())
                {
                    self.state.previews.insert(
                        input_id.to_string(),
                        PreviewState {
                            running: false,
                            rtsp_url: None,
                        },
                    );
                }
            }
            _ => {}
        }
    }
}
