//! Structured error types for strobe
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Only fatal conditions are errors. Per-event conditions (an address that
//! does not resolve, an exit record without a matching entry, a dropped
//! sample) are counters on the capture report's health block instead.

use super::types::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("process {0} is gone")]
    ProcessGone(Pid),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("kernel does not support {feature}")]
    KernelUnsupported { feature: &'static str },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("tracer subprocess failed: {0}")]
    TracerFailed(String),

    #[error("failed to attach to thread {tid}: {reason}")]
    AttachFailed { tid: u32, reason: String },

    #[error("capture already in progress")]
    CaptureInProgress,

    #[error("no capture is running")]
    NotCapturing,

    #[error("no capture report available yet")]
    NoReport,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Exit code for the embedding CLI.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            CaptureError::ProcessGone(_) => 1,
            CaptureError::PermissionDenied(_) | CaptureError::AttachFailed { .. } => 2,
            CaptureError::KernelUnsupported { .. } => 3,
            CaptureError::ResourceExhausted(_) => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaptureError::ProcessGone(Pid(1234));
        assert_eq!(err.to_string(), "process 1234 is gone");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CaptureError::ProcessGone(Pid(1)).exit_code(), 1);
        assert_eq!(CaptureError::PermissionDenied("ptrace".into()).exit_code(), 2);
        assert_eq!(CaptureError::KernelUnsupported { feature: "uprobe" }.exit_code(), 3);
        assert_eq!(CaptureError::ResourceExhausted("fds".into()).exit_code(), 4);
    }
}
