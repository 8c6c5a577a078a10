//! Media framework initialization and dispatch loop
//!
//! The framework requires one long-running dispatch loop for bus watches
//! and element bookkeeping. It runs on a dedicated OS thread owned here;
//! nothing else in the process blocks on it. Bus handlers must stay cheap —
//! they only forward messages into channels.

use gstreamer as gst;
use gstreamer::glib;
use tracing::{debug, info};

use crate::error::{AppError, Result};

/// Process-wide dispatch loop for the media framework.
///
/// Construct exactly one at startup, before any graph is realized; shut it
/// down after every graph has been torn down.
pub struct DispatchLoop {
    main_loop: glib::MainLoop,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DispatchLoop {
    /// Initialize the media framework and start the dispatch thread.
    pub fn start() -> Result<Self> {
        gst::init().map_err(|e| AppError::Media(format!("framework init: {}", e)))?;

        let main_loop = glib::MainLoop::new(None, false);
        let run_loop = main_loop.clone();
        let thread = std::thread::Builder::new()
            .name("media-dispatch".to_string())
            .spawn(move || {
                debug!("Media dispatch loop running");
                run_loop.run();
                debug!("Media dispatch loop exited");
            })
            .map_err(|e| AppError::Media(format!("dispatch thread: {}", e)))?;

        info!("Media framework initialized");
        Ok(Self {
            main_loop,
            thread: Some(thread),
        })
    }

    /// Stop the dispatch loop and join its thread.
    pub fn shutdown(mut self) {
        self.main_loop.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        info!("Media dispatch loop stopped");
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        self.main_loop.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
