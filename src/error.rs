use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Capture device busy: {0}")]
    DeviceBusy(String),

    #[error("No signal on {0}")]
    NoSignal(String),

    #[error("Capabilities unavailable for {device}: {reason}")]
    CapabilitiesUnavailable { device: String, reason: String },

    #[error("Pipeline failed to start [{pipeline}]: {reason}")]
    PipelineStartFailed { pipeline: String, reason: String },

    #[error("Pipeline runtime error [{pipeline}]: {reason}")]
    PipelineRuntime { pipeline: String, reason: String },

    #[error("Insufficient storage: {available_gb:.1}GB free, {required_gb:.1}GB required")]
    StorageInsufficient {
        available_gb: f64,
        required_gb: f64,
    },

    #[error("Critical storage level: {available_gb:.1}GB free")]
    StorageCritical { available_gb: f64 },

    #[error("Session conflict: {0}")]
    SessionConflict(String),

    #[error("Media broker unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Media framework error: {0}")]
    Media(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable error kind identifier, mirrored in bus events and returned to
    /// the control surface alongside the human-readable message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceBusy(_) => "device-busy",
            Self::NoSignal(_) => "no-signal",
            Self::CapabilitiesUnavailable { .. } => "capabilities-unavailable",
            Self::PipelineStartFailed { .. } => "pipeline-start-failed",
            Self::PipelineRuntime { .. } => "pipeline-runtime-error",
            Self::StorageInsufficient { .. } => "storage-insufficient",
            Self::StorageCritical { .. } => "storage-critical",
            Self::SessionConflict(_) => "session-conflict",
            Self::BrokerUnreachable(_) => "broker-unreachable",
            Self::InvalidArgument(_) => "invalid-argument",
            Self::Config(_) => "config-error",
            Self::Media(_) => "media-error",
            Self::Io(_) => "io-error",
            Self::Serialization(_) => "serialization-error",
            Self::Internal(_) => "internal-error",
        }
    }

    /// Whether the owning component may retry after this error.
    ///
    /// Device-busy and runtime stream errors are transient; everything else
    /// requires operator intervention or is an operational state.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DeviceBusy(_) | Self::PipelineRuntime { .. })
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// Structured error descriptor (unified failure format)
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(AppError::DeviceBusy("/dev/video60".into()).kind(), "device-busy");
        assert_eq!(AppError::NoSignal("cam1".into()).kind(), "no-signal");
        assert_eq!(
            AppError::StorageInsufficient {
                available_gb: 3.0,
                required_gb: 5.0
            }
            .kind(),
            "storage-insufficient"
        );
        assert_eq!(AppError::SessionConflict("S1".into()).kind(), "session-conflict");
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::DeviceBusy("/dev/video60".into()).is_transient());
        assert!(AppError::PipelineRuntime {
            pipeline: "ingest_cam1".into(),
            reason: "Internal data stream error".into()
        }
        .is_transient());
        assert!(!AppError::NoSignal("cam1".into()).is_transient());
        assert!(!AppError::InvalidArgument("empty camera list".into()).is_transient());
    }

    #[test]
    fn test_descriptor_serializes() {
        let err = AppError::SessionConflict("already recording session: S1".into());
        let json = serde_json::to_string(&err.descriptor()).unwrap();
        assert!(json.contains("session-conflict"));
        assert!(json.contains("S1"));
    }
}
