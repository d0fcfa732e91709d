use thiserror::Error;

/// Failures callers are expected to branch on.
///
/// Everything else travels as `anyhow::Error`; these variants are recovered with
/// `err.downcast_ref::<ClipError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClipError {
    #[error("no frame available")]
    NoFrameAvailable,
    #[error("invalid detector config: {0}")]
    InvalidDetectorConfig(String),
    #[error("clip processor already running")]
    AlreadyRunning,
    #[error("clip queue full ({0} jobs pending)")]
    QueueFull(usize),
}
