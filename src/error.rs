//! Error types for the harness.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`HarnessError`].
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors that can occur while building, booting or driving the VM.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Control-channel conduit creation, rendezvous or removal failed.
    #[error("Transport error ({}): {message}", path.display())]
    Transport { path: PathBuf, message: String },

    /// Handshake or command/reply correlation violated.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Missing reference artifact or content mismatch.
    #[error("Verification error: {0}")]
    Verification(String),

    /// Emulator spawn failure, unexpected exit code or forced kill.
    #[error("Process error: {0}")]
    Process(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// OVMF firmware could not be located.
    #[error("Firmware error: {0}")]
    Firmware(String),

    /// Guest build or ESP staging failed.
    #[error("Build error: {0}")]
    Build(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    pub(crate) fn transport(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        HarnessError::Transport {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether this error aborts the scanning loop.
    ///
    /// Verification failures fail the run but let the guest keep going, so
    /// every screenshot mismatch of a run gets reported.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HarnessError::Verification(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_verification_is_non_fatal() {
        assert!(!HarnessError::Verification("mismatch".into()).is_fatal());
        assert!(HarnessError::Protocol("unexpected greeting".into()).is_fatal());
        assert!(HarnessError::transport("qemu-monitor.in", "exists").is_fatal());
        assert!(HarnessError::Process("exit 1".into()).is_fatal());
    }

    #[test]
    fn test_transport_message_names_path() {
        let err = HarnessError::transport("/tmp/qemu-monitor.out", "already exists");
        assert_eq!(
            err.to_string(),
            "Transport error (/tmp/qemu-monitor.out): already exists"
        );
    }
}
