//! Typed error hierarchy for the autoforge orchestrator.
//!
//! Four enums cover the public seams:
//! - `BuildError` — control plane and orchestration failures
//! - `ProviderError` — generation provider calls
//! - `CommandError` — malformed or unsupported operator commands
//! - `PathError` — workspace paths rejected before any write

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors from a generation provider call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("Rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Prompt exceeds the model context window")]
    ContextOverflow,

    #[error("Provider returned an empty response")]
    EmptyResponse,

    #[error("Provider call failed: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Whether the retry policy should try the call again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Transient(_)
        )
    }

    /// Provider-supplied retry hint, if any.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A workspace path that was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Path is empty")]
    Empty,

    #[error("Absolute paths are not allowed: {0}")]
    Absolute(String),

    #[error("Path escapes the workspace root: {0}")]
    Traversal(String),
}

/// Errors parsing an operator command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Commands must start with '/': {0}")]
    MissingSlash(String),

    #[error("Unknown command '/{0}'. Available: stop, pause, start, continue, verify, fix, compact, clear, commit, push, pull, status")]
    Unknown(String),

    #[error("'/{command}' {message}")]
    Malformed { command: String, message: String },
}

/// Errors from the build control plane.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Build {id} not found")]
    NotFound { id: Uuid },

    #[error("Project '{project}' already has an active build ({build_id})")]
    AlreadyRunning { project: String, build_id: Uuid },

    #[error("Build {id} is {status}; cannot {action}")]
    InvalidState {
        id: Uuid,
        status: String,
        action: String,
    },

    #[error("Build {id} has no open gate")]
    NoOpenGate { id: Uuid },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Workspace operation failed: {0}")]
    Workspace(String),

    #[error("Build was cancelled")]
    Cancelled,

    #[error("Build stalled: no progress for {idle_secs}s during '{activity}'")]
    Stalled { idle_secs: u64, activity: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    /// Conditions the operator can fix themselves; their message is shown verbatim.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::AlreadyRunning { .. }
                | Self::InvalidState { .. }
                | Self::NoOpenGate { .. }
                | Self::Command(_)
                | Self::Path(_)
        )
    }

    /// Message safe to return to an operator. Internal faults collapse to a
    /// generic string and are logged instead.
    pub fn public_message(&self) -> String {
        if self.is_user_correctable() {
            self.to_string()
        } else {
            tracing::error!(error = %self, "internal build error");
            "internal error".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ProviderError::Transient("502".into()).is_transient());
        assert!(!ProviderError::ContextOverflow.is_transient());
        assert!(!ProviderError::EmptyResponse.is_transient());
        assert!(!ProviderError::Fatal("bad key".into()).is_transient());
    }

    #[test]
    fn provider_error_retry_hint_only_for_rate_limit() {
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_hint(), Some(Duration::from_secs(7)));
        assert_eq!(ProviderError::Transient("x".into()).retry_hint(), None);
    }

    #[test]
    fn not_found_is_user_correctable_and_verbatim() {
        let id = Uuid::new_v4();
        let err = BuildError::NotFound { id };
        assert!(err.is_user_correctable());
        assert!(err.public_message().contains(&id.to_string()));
    }

    #[test]
    fn internal_faults_get_generic_message() {
        let err = BuildError::Other(anyhow::anyhow!("disk exploded at /secret/path"));
        assert!(!err.is_user_correctable());
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn command_error_converts_into_build_error() {
        let err: BuildError = CommandError::Unknown("dance".into()).into();
        assert!(matches!(err, BuildError::Command(CommandError::Unknown(_))));
        assert!(err.is_user_correctable());
        assert!(err.to_string().contains("/dance"));
    }

    #[test]
    fn stalled_carries_idle_time_and_activity() {
        let err = BuildError::Stalled {
            idle_secs: 901,
            activity: "auditing src/app.py".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("901"));
        assert!(msg.contains("auditing src/app.py"));
    }
}
