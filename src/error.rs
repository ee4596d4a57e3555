//! Error types for the supervisor, responder and configuration layers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Failures while starting or driving the agent subprocess.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("agent binary not found: {0}")]
    BinaryNotFound(String),

    #[error("pseudoterminal unavailable: {0}")]
    PtyUnavailable(String),

    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    #[error("no running session")]
    NotRunning,

    #[error("PTY channel closed")]
    ChannelClosed,

    #[error("failed to resize PTY")]
    Resize,

    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),
}

impl SupervisorError {
    /// Process exit status for a session that failed this way; a missing
    /// binary uses the shell's "command not found" status.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::BinaryNotFound(_) => 127,
            _ => 1,
        }
    }
}

/// Why an auto-response did not produce text to type.
///
/// Carried inside [`crate::protocol::AutoResponse`], so it is cloneable and
/// serializable as `{"kind": "...", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "kebab-case")]
pub enum ResponderError {
    #[error("No API key configured")]
    NoCredentials,

    #[error("Cancelled by user")]
    Cancelled,

    #[error("{0}")]
    Provider(String),
}

/// Failures while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid prompt pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_failure_exit_codes() {
        assert_eq!(
            SupervisorError::BinaryNotFound("claude".to_string()).exit_code(),
            127
        );
        assert_eq!(
            SupervisorError::PtyUnavailable("openpty".to_string()).exit_code(),
            1
        );
    }
}
