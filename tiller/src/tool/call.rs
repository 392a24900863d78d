//! Tool call records and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::traits::{CallFlags, ToolCaller};

/// Lifecycle state of a tool call.
///
/// Execution state and progress are deliberately separate: `progress`
/// lives on [`ToolCall`] as a fraction in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    /// Created, not yet queued.
    Pending,
    /// Queued behind the concurrency semaphore.
    Scheduled,
    /// Running.
    Executing,
    /// Suspended at a checkpoint; resumable.
    Paused,
    /// Cancellation requested; awaiting executor acknowledgment.
    Cancelling,
    /// Terminal: completed successfully.
    Succeeded,
    /// Terminal: the tool body or infrastructure failed.
    Failed,
    /// Terminal: cancellation acknowledged.
    Cancelled,
}

impl CallState {
    /// Returns `true` for terminal states.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if `to` is a legal next state.
    #[must_use]
    pub const fn can_transition(&self, to: Self) -> bool {
        match self {
            Self::Pending => matches!(to, Self::Scheduled | Self::Cancelling | Self::Failed),
            Self::Scheduled => matches!(to, Self::Executing | Self::Cancelling | Self::Failed),
            Self::Executing => matches!(
                to,
                Self::Paused | Self::Cancelling | Self::Succeeded | Self::Failed
            ),
            Self::Paused => matches!(to, Self::Executing | Self::Cancelling | Self::Failed),
            Self::Cancelling => matches!(to, Self::Cancelled | Self::Failed),
            Self::Succeeded | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Get the string representation of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Cancelling => "cancelling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked tool invocation. Identity is `(id, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call identifier.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Opaque structured input.
    pub input: Value,
    /// Origin of the invocation.
    pub caller: ToolCaller,
    /// Lifecycle state.
    pub state: CallState,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    /// Output, once succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error description, once failed or cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Declared control surface.
    pub flags: CallFlags,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Terminal time, once reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ToolCall {
    /// Create a pending call.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
        caller: ToolCaller,
        flags: CallFlags,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            caller,
            state: CallState::Pending,
            progress: 0.0,
            result: None,
            error: None,
            flags,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Attempt a state transition. Illegal transitions are ignored and
    /// reported as `false` so racing control actions cannot corrupt a
    /// terminal call.
    pub fn transition(&mut self, to: CallState) -> bool {
        if !self.state.can_transition(to) {
            return false;
        }
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    /// Mark succeeded with a result.
    pub fn succeed(&mut self, result: Value) -> bool {
        if self.transition(CallState::Succeeded) {
            self.progress = 1.0;
            self.result = Some(result);
            true
        } else {
            false
        }
    }

    /// Mark failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        // Failure is reachable from every non-terminal state, including
        // Cancelling (cancel-timeout reaping).
        if self.state.is_terminal() {
            return false;
        }
        self.state = CallState::Failed;
        self.error = Some(reason.into());
        self.finished_at = Some(Utc::now());
        true
    }

    /// Mark cancellation acknowledged.
    pub fn cancelled(&mut self) -> bool {
        if self.transition(CallState::Cancelled) {
            self.error = Some("cancelled".into());
            true
        } else {
            false
        }
    }
}
