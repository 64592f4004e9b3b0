//! Error taxonomy for the session and resource coordinator.
//!
//! Every failure that crosses a component boundary is translated into one of
//! the variants below before it reaches the Facade. The Facade never leaks a
//! lower-level transport error to the MCP tool surface.

use thiserror::Error;

/// Sub-kind for execution failures, distinguishing timeouts from other
/// infrastructure failures. User-code errors (non-zero exit, a traceback)
/// are never represented by this type — they are successful executions
/// whose payload happens to carry an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// The call did not complete within the configured or requested timeout.
    Timeout,
    /// The provider or transport failed before a result could be obtained.
    Infrastructure,
}

impl std::fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

/// Which global ceiling an admission check failed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimitKind {
    /// `active_sessions` would have exceeded `max_sessions`.
    MaxSessions,
    /// Aggregate memory would have exceeded `max_total_memory`.
    MaxTotalMemory,
}

impl std::fmt::Display for ResourceLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxSessions => write!(f, "max_sessions"),
            Self::MaxTotalMemory => write!(f, "max_total_memory"),
        }
    }
}

/// The full error taxonomy produced by the core.
///
/// Every variant carries a human-readable message and, where one makes
/// sense, a recovery suggestion a caller (or the agent behind it) can act
/// on without inspecting internals.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration was invalid or missing. Fatal at startup.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The sandbox provider was unreachable or returned a malformed
    /// response. Retryable by the caller.
    #[error("provider connection error: {message}")]
    Connection {
        message: String,
        retryable: bool,
    },

    /// The provider failed to create or start the underlying sandbox.
    #[error("sandbox creation failed for session '{session_id}': {message}")]
    SandboxCreation {
        session_id: String,
        message: String,
    },

    /// Admission was denied because a global ceiling would be exceeded.
    #[error("resource limit '{kind}' reached ({message})")]
    ResourceLimit {
        kind: ResourceLimitKind,
        message: String,
        suggestion: String,
    },

    /// `execute_code` failed for infrastructure reasons (not user code).
    #[error("code execution error ({kind}) for session '{session_id}': {message}")]
    CodeExecution {
        session_id: String,
        kind: ExecutionErrorKind,
        message: String,
    },

    /// `execute_command` failed for infrastructure reasons (not the command
    /// itself returning a non-zero exit code).
    #[error("command execution error ({kind}) for session '{session_id}': {message}")]
    CommandExecution {
        session_id: String,
        kind: ExecutionErrorKind,
        message: String,
    },

    /// An explicit lookup named a session that does not exist or has
    /// already been stopped. Note `execute_*` never raises this — an
    /// unknown `session_id` auto-creates a session instead.
    #[error("session '{session_id}' not found")]
    SessionNotFound { session_id: String },

    /// An existing session was addressed with a template different from the
    /// one it was created with.
    #[error(
        "session '{session_id}' is bound to template '{bound_template}', not '{requested_template}'"
    )]
    InvalidSessionState {
        session_id: String,
        bound_template: String,
        requested_template: String,
    },
}

impl CoreError {
    /// A short, user-actionable recovery hint, where the variant affords one.
    #[must_use]
    pub fn recovery_suggestion(&self) -> Option<String> {
        match self {
            Self::Configuration { .. } => {
                Some("check the service configuration and environment variables".to_string())
            }
            Self::Connection { retryable, .. } => retryable
                .then(|| "the provider may be transiently unavailable; retry shortly".to_string()),
            Self::SandboxCreation { .. } => {
                Some("retry, or choose a smaller flavor if the provider is under load".to_string())
            }
            Self::ResourceLimit { suggestion, .. } => Some(suggestion.clone()),
            Self::CodeExecution { kind, .. } | Self::CommandExecution { kind, .. } => {
                match kind {
                    ExecutionErrorKind::Timeout => {
                        Some("retry with a longer timeout, or simplify the workload".to_string())
                    }
                    ExecutionErrorKind::Infrastructure => {
                        Some("retry; the session remains usable on success".to_string())
                    }
                }
            }
            Self::SessionNotFound { .. } => {
                Some("omit session_id to create a new session, or call get_sessions to list active ones".to_string())
            }
            Self::InvalidSessionState { .. } => {
                Some("use a different session_id, or omit it for a fresh session".to_string())
            }
        }
    }

    /// The session id this error pertains to, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SandboxCreation { session_id, .. }
            | Self::CodeExecution { session_id, .. }
            | Self::CommandExecution { session_id, .. }
            | Self::SessionNotFound { session_id }
            | Self::InvalidSessionState { session_id, .. } => Some(session_id),
            Self::Configuration { .. } | Self::Connection { .. } | Self::ResourceLimit { .. } => {
                None
            }
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
