//! Error types for session lifecycle

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while starting or driving a PTY session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Working directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("Working directory is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Cannot expand home directory in {0}")]
    NoHomeDirectory(String),

    #[error("Failed to open PTY: {0}")]
    OpenPty(String),

    #[error("Failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Session not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Wrap a portable-pty error (anyhow-based) with its full chain
    pub(crate) fn pty(err: anyhow::Error) -> Self {
        SessionError::Pty(format!("{:#}", err))
    }
}

/// Errors from direct command execution
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command blocked: {0}")]
    Blocked(String),

    #[error("Direct command execution is disabled")]
    Disabled,

    #[error("Empty command")]
    Empty,

    #[error("Command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
