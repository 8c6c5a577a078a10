//! Graph lifecycle management
//!
//! Wraps one realized media graph: bounded start, EOS-driven stop with a
//! forced NULL fallback, valve control, and forwarding of bus traffic into
//! the async runtime over a channel. Bus handlers run on the dispatch
//! thread and must never block; they only translate and send.

use std::time::Duration;

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer::MessageView;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::graph::REC_VALVE;
use crate::error::{AppError, Result};

/// Bound on waiting for the running confirmation after a start request
pub const START_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound on waiting for EOS to flush through a graph during stop
pub const STOP_EOS_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on the final settle into NULL after a stop
const NULL_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bus traffic forwarded to the owning component
#[derive(Debug, Clone)]
pub enum GraphMessage {
    /// The graph reached the running state
    Running,
    /// Fatal bus error; the graph is no longer usable
    Error { source: String, message: String },
    Warning { message: String },
    /// End of stream arrived outside of a stop request
    Eos,
}

/// Recoverable bus-error categories.
///
/// Transient stream hiccups and device contention are retried by the
/// supervisor; everything else is surfaced as fatal.
pub fn is_transient_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("internal data stream error")
        || lower.contains("busy")
        || lower.contains("could not read from resource")
}

/// One realized media graph
pub struct MediaGraph {
    name: String,
    pipeline: gst::Pipeline,
    watch: Option<gst::bus::BusWatchGuard>,
}

impl MediaGraph {
    /// Parse and realize a graph from its launch description, attaching a
    /// bus watch that forwards messages to `events_tx` tagged with `name`.
    pub fn launch(
        name: &str,
        description: &str,
        events_tx: mpsc::UnboundedSender<(String, GraphMessage)>,
    ) -> Result<Self> {
        debug!("Launching graph {}: {}", name, description);

        let pipeline = gst::parse::launch(description)
            .map_err(|e| AppError::PipelineStartFailed {
                pipeline: name.to_string(),
                reason: format!("parse: {}", e),
            })?
            .downcast::<gst::Pipeline>()
            .map_err(|_| AppError::PipelineStartFailed {
                pipeline: name.to_string(),
                reason: "description is not a pipeline".to_string(),
            })?;

        let bus = pipeline.bus().ok_or_else(|| AppError::Media("pipeline has no bus".into()))?;

        let graph_name = name.to_string();
        let watch = bus
            .add_watch(move |_bus, msg| {
                let forwarded = match msg.view() {
                    MessageView::Error(err) => {
                        let source = err.src().map(|s| s.path_string().to_string()).unwrap_or_default();
                        Some(GraphMessage::Error {
                            source,
                            message: err.error().to_string(),
                        })
                    }
                    MessageView::Warning(w) => Some(GraphMessage::Warning {
                        message: w.error().to_string(),
                    }),
                    MessageView::Eos(_) => Some(GraphMessage::Eos),
                    MessageView::StateChanged(sc)
                        if sc.src().and_then(|s| s.downcast_ref::<gst::Pipeline>()).is_some()
                            && sc.current() == gst::State::Playing =>
                    {
                        Some(GraphMessage::Running)
                    }
                    _ => None,
                };

                if let Some(message) = forwarded {
                    let _ = events_tx.send((graph_name.clone(), message));
                }
                glib::ControlFlow::Continue
            })
            .map_err(|e| AppError::Media(format!("bus watch: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            pipeline,
            watch: Some(watch),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request the running state and block until it is confirmed, a fatal
    /// error arrives, or the timeout elapses. On failure the graph is
    /// forced to NULL before returning.
    pub fn start(&self, timeout: Duration) -> Result<()> {
        if let Err(e) = self.pipeline.set_state(gst::State::Playing) {
            self.force_null();
            return Err(AppError::PipelineStartFailed {
                pipeline: self.name.clone(),
                reason: format!("state change refused: {}", e),
            });
        }

        let wait = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let (result, current, _pending) = self.pipeline.state(Some(wait));

        match result {
            Ok(_) if current == gst::State::Playing => Ok(()),
            Ok(_) => {
                self.force_null();
                Err(AppError::PipelineStartFailed {
                    pipeline: self.name.clone(),
                    reason: format!("did not reach running state (stuck in {:?})", current),
                })
            }
            Err(_) => {
                let reason = self
                    .pop_error_message()
                    .unwrap_or_else(|| "state change failed".to_string());
                self.force_null();
                Err(AppError::PipelineStartFailed {
                    pipeline: self.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Stop the graph: send end-of-stream, wait bounded for it to flush
    /// (finalizing any open file), then drop to NULL. A graph that never
    /// delivers EOS is forced down after the timeout.
    pub fn stop(&mut self, eos_timeout: Duration) {
        // Remove the watch first so the flush EOS is consumed here instead
        // of being reported upstream as an unexpected end-of-stream.
        self.watch.take();

        self.pipeline.send_event(gst::event::Eos::new());

        if let Some(bus) = self.pipeline.bus() {
            let wait = gst::ClockTime::from_mseconds(eos_timeout.as_millis() as u64);
            match bus.timed_pop_filtered(Some(wait), &[gst::MessageType::Eos, gst::MessageType::Error])
            {
                Some(msg) if msg.type_() == gst::MessageType::Error => {
                    if let MessageView::Error(err) = msg.view() {
                        warn!("Error while stopping {}: {}", self.name, err.error());
                    }
                }
                Some(_) => debug!("Graph {} flushed cleanly", self.name),
                None => warn!("Graph {} did not flush within {:?}, forcing down", self.name, eos_timeout),
            }
        }

        self.force_null();
    }

    /// Open or close the recording valve (tee graphs only).
    pub fn set_valve(&self, open: bool) -> Result<()> {
        let valve = self
            .pipeline
            .by_name(REC_VALVE)
            .ok_or_else(|| AppError::Media(format!("{}: no {} element", self.name, REC_VALVE)))?;
        // The valve drops frames while `drop` is true; opening the valve
        // means clearing it.
        valve.set_property("drop", !open);
        debug!("Graph {} valve {}", self.name, if open { "opened" } else { "closed" });
        Ok(())
    }

    fn pop_error_message(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            MessageView::Error(err) => Some(err.error().to_string()),
            _ => None,
        }
    }

    fn force_null(&self) {
        let _ = self.pipeline.set_state(gst::State::Null);
        let settle = gst::ClockTime::from_mseconds(NULL_SETTLE_TIMEOUT.as_millis() as u64);
        let _ = self.pipeline.state(Some(settle));
    }
}

impl Drop for MediaGraph {
    fn drop(&mut self) {
        self.watch.take();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_error_classification() {
        assert!(is_transient_error("Internal data stream error."));
        assert!(is_transient_error("Device '/dev/video60' is busy"));
        assert!(is_transient_error("Could not read from resource."));
        assert!(!is_transient_error("No such file or directory"));
        assert!(!is_transient_error("Could not open device for reading"));
    }
}
