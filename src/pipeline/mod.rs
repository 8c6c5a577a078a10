//! Media pipeline construction and lifecycle
//!
//! One media-framework graph per camera (ingest) or per recording
//! (subscriber). Graphs are described in the framework's launch language —
//! built by string templating in [`graph`] — realized and supervised by
//! [`runner`], with all bus traffic delivered on the process-wide dispatch
//! loop owned by [`dispatch`] and forwarded into the async runtime over
//! plain channels.

pub mod broker;
pub mod dispatch;
pub mod graph;
pub mod runner;

pub use broker::check_broker;
pub use dispatch::DispatchLoop;
pub use graph::{ingest_graph, subscriber_graph, tee_recording_graph, IngestGraphParams, REC_VALVE};
pub use runner::{GraphMessage, MediaGraph, START_TIMEOUT, STOP_EOS_TIMEOUT};
