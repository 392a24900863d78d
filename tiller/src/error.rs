//! Error types for the tiller runtime.
//!
//! Errors are grouped by recovery semantics rather than by origin:
//! validation and state errors surface synchronously to the caller,
//! transient errors are retried inside their layer, tool-execution and
//! authorization errors are converted to tool-result data by the agent
//! loop, and fatal errors terminate the agent.

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad input: schema mismatch, unknown tool, malformed request.
    /// Surfaced to the caller and never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The operation is not legal in the agent's current state.
    #[error("operation '{operation}' is not legal in state '{state}'")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// The state the agent was in.
        state: String,
    },

    /// A tool call was denied by the permission layer or sandbox policy.
    #[error("permission denied for tool '{tool}': {reason}")]
    PermissionDenied {
        /// Name of the tool.
        tool: String,
        /// Why the call was denied.
        reason: String,
    },

    /// A transient failure that exhausted its retry budget.
    #[error("transient failure after {attempts} attempt(s): {message}")]
    Transient {
        /// Description of the underlying failure.
        message: String,
        /// How many attempts were made before surfacing.
        attempts: u32,
    },

    /// A tool body returned an error. Non-fatal for the agent loop.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution {
        /// Name of the tool that failed.
        tool: String,
        /// The underlying error message.
        message: String,
    },

    /// The model provider rejected the request permanently.
    #[error("provider error: {0}")]
    Provider(String),

    /// A sandboxed command violated the configured security policy.
    #[error("sandbox policy violation: {0}")]
    SandboxViolation(String),

    /// Session store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Unrecoverable core failure. The agent transitions to `Failed`.
    #[error("fatal: {0}")]
    Fatal(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an invalid-state error.
    #[must_use]
    pub fn invalid_state(operation: &'static str, state: impl Into<String>) -> Self {
        Self::InvalidState {
            operation,
            state: state.into(),
        }
    }

    /// Create a permission-denied error.
    #[must_use]
    pub fn denied(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Create a tool-execution error.
    #[must_use]
    pub fn tool_execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Returns `true` if the error is transient and was retried before
    /// surfacing.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns `true` if the error terminates the agent.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Returns `true` if the agent loop converts this error into a
    /// tool-result block instead of aborting the turn.
    #[must_use]
    pub const fn is_recoverable_in_loop(&self) -> bool {
        matches!(
            self,
            Self::ToolExecution { .. } | Self::PermissionDenied { .. }
        )
    }
}
