//! Tool error taxonomy.

use thiserror::Error;

/// Errors from tool resolution and execution.
///
/// The split matters for recovery: validation errors surface immediately
/// and are never retried, execution errors become tool-result data,
/// infrastructure errors are retried with backoff, and denials are
/// audited and not retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ToolError {
    /// Bad input or unknown tool. Never retried.
    #[error("invalid tool input: {0}")]
    Validation(String),

    /// The tool body failed. Injected as a tool-result with
    /// `is_error = true`.
    #[error("tool execution failed: {0}")]
    Execution(String),

    /// The executor substrate failed (sandbox down, ...). Retried with
    /// backoff up to a cap.
    #[error("tool infrastructure failure: {0}")]
    Infrastructure(String),

    /// The call was denied by policy. Audited, not retried.
    #[error("tool call denied: {0}")]
    Denied(String),

    /// The call was cancelled before completion.
    #[error("tool call cancelled")]
    Cancelled,

    /// The call is still running (polling path only).
    #[error("tool call still running")]
    StillRunning,

    /// No call with the given id is tracked.
    #[error("unknown tool call '{0}'")]
    UnknownCall(String),

    /// The requested control action is not declared by the call.
    #[error("call '{call_id}' does not support '{action}'")]
    Unsupported {
        /// The call id.
        call_id: String,
        /// The rejected action.
        action: &'static str,
    },
}

impl ToolError {
    /// Returns `true` if the runtime should retry the execution.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }

    /// Returns `true` if the error should be injected as a tool-result
    /// instead of aborting the turn.
    #[must_use]
    pub const fn is_tool_result(&self) -> bool {
        matches!(
            self,
            Self::Execution(_) | Self::Denied(_) | Self::Infrastructure(_) | Self::Cancelled
        )
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}
