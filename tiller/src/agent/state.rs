//! The agent state machine.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Lifecycle state of an agent.
///
/// Invariants enforced by the loop: provider calls happen only in
/// `Thinking`; tool-start events are emitted only in `ExecutingTool`;
/// `Paused` suspends the loop without cancelling in-flight calls;
/// `Stopped` is terminal and releases every resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentState {
    /// Built, not yet started.
    Created,
    /// First-run setup in progress.
    Initializing,
    /// Idle between turns.
    Ready,
    /// Awaiting provider output.
    Thinking,
    /// Awaiting tool completions.
    ExecutingTool,
    /// Loop suspended; in-flight calls keep running.
    Paused,
    /// Drain in progress.
    Stopping,
    /// Terminal: clean shutdown.
    Stopped,
    /// Terminal: fatal error.
    Failed,
}

impl AgentState {
    /// Returns `true` for terminal states.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Returns `true` if `to` is a legal next state.
    #[must_use]
    pub const fn can_transition(&self, to: Self) -> bool {
        match self {
            Self::Created => matches!(to, Self::Initializing | Self::Stopping | Self::Failed),
            Self::Initializing => matches!(to, Self::Ready | Self::Stopping | Self::Failed),
            Self::Ready => matches!(
                to,
                Self::Thinking | Self::ExecutingTool | Self::Paused | Self::Stopping | Self::Failed
            ),
            Self::Thinking => matches!(
                to,
                Self::ExecutingTool | Self::Ready | Self::Paused | Self::Stopping | Self::Failed
            ),
            Self::ExecutingTool => matches!(
                to,
                Self::Thinking | Self::Ready | Self::Paused | Self::Stopping | Self::Failed
            ),
            Self::Paused => matches!(
                to,
                Self::Ready | Self::Thinking | Self::ExecutingTool | Self::Stopping | Self::Failed
            ),
            Self::Stopping => matches!(to, Self::Stopped | Self::Failed),
            Self::Stopped | Self::Failed => false,
        }
    }

    /// Get the string representation of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Thinking => "thinking",
            Self::ExecutingTool => "executing-tool",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, watchable holder of the current state.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<AgentState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(AgentState::Created);
        Self { tx }
    }

    pub(crate) fn current(&self) -> AgentState {
        *self.tx.borrow()
    }

    /// Attempt a transition, returning the previous state.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] for illegal transitions.
    pub(crate) fn transition(&self, to: AgentState) -> Result<AgentState> {
        let mut previous = None;
        self.tx.send_if_modified(|state| {
            if state.can_transition(to) {
                previous = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        previous.ok_or_else(|| Error::invalid_state(to.as_str(), self.current().as_str()))
    }

    /// Like [`StateCell::transition`], but a no-op when already in `to`.
    pub(crate) fn transition_idempotent(&self, to: AgentState) -> Result<Option<AgentState>> {
        if self.current() == to {
            return Ok(None);
        }
        self.transition(to).map(Some)
    }

    pub(crate) fn watch(&self) -> watch::Receiver<AgentState> {
        self.tx.subscribe()
    }
}
