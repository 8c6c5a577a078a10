//! camcore - Multi-camera capture and recording core
//!
//! This crate provides the media core of a multi-camera HDMI recording
//! appliance: always-on hardware-encoded ingest to a local media broker,
//! decoupled session recording, and real-time event fan-out to clients.

pub mod capabilities;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod pipeline;
pub mod recorder;
pub mod state;
pub mod utils;

pub use error::{AppError, Result};
