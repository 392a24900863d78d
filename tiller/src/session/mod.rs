//! Event-sourced session history.
//!
//! A session is an append-only event log plus periodic checkpoints.
//! Sessions are replayable: folding the events over an empty state
//! reproduces the state at any checkpoint.

mod json_file;
mod memory;

pub use json_file::JsonFileSessionStore;
pub use memory::MemorySessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::message::Message;
use crate::tool::{CallState, ToolCall};

/// Identifier of a session.
pub type SessionId = String;

/// One recorded session event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// A message was appended to the conversation.
    MessageAdded {
        /// The message.
        message: Message,
    },
    /// A tool call was issued.
    ToolCalled {
        /// Snapshot of the call at issue time.
        call: ToolCall,
    },
    /// A tool call reached a terminal state.
    ToolResultRecorded {
        /// The call id.
        call_id: String,
        /// Output or error description.
        output: Value,
        /// Whether the call failed.
        is_error: bool,
    },
    /// The agent state machine transitioned.
    StateChanged {
        /// Previous state.
        from: String,
        /// New state.
        to: String,
    },
}

/// An event with its position in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    /// Monotonic position, starting at 1.
    pub seq: u64,
    /// Append time.
    pub timestamp: DateTime<Utc>,
    /// The event.
    pub event: SessionEvent,
}

/// Materialized state of a session at some log position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Provider invocations so far (transitions into `thinking`).
    pub step_count: usize,
    /// Last recorded agent state.
    pub agent_state: String,
    /// Every tool call seen, by issue order.
    pub calls: Vec<ToolCall>,
}

impl SessionSnapshot {
    /// Calls that never reached a terminal state.
    #[must_use]
    pub fn open_calls(&self) -> Vec<&ToolCall> {
        self.calls.iter().filter(|c| !c.state.is_terminal()).collect()
    }

    /// Mark every non-terminal call failed after a crash. Returns the
    /// ids of the affected calls so the caller can opt into re-issuing
    /// them.
    pub fn fail_open_calls(&mut self, reason: &str) -> Vec<String> {
        let mut failed = Vec::new();
        for call in &mut self.calls {
            if !call.state.is_terminal() && call.fail(reason) {
                failed.push(call.id.clone());
            }
        }
        failed
    }
}

/// Fold events over an empty state.
#[must_use]
pub fn replay(events: &[SequencedEvent]) -> SessionSnapshot {
    let mut snapshot = SessionSnapshot::default();
    for sequenced in events {
        match &sequenced.event {
            SessionEvent::MessageAdded { message } => snapshot.messages.push(message.clone()),
            SessionEvent::ToolCalled { call } => snapshot.calls.push(call.clone()),
            SessionEvent::ToolResultRecorded {
                call_id,
                output,
                is_error,
            } => {
                if let Some(call) = snapshot.calls.iter_mut().find(|c| &c.id == call_id) {
                    if *is_error {
                        call.fail(output.as_str().unwrap_or("failed").to_string());
                    } else {
                        // Replay may skip intermediate states.
                        call.transition(CallState::Scheduled);
                        call.transition(CallState::Executing);
                        call.succeed(output.clone());
                    }
                }
            }
            SessionEvent::StateChanged { to, .. } => {
                if to == "thinking" {
                    snapshot.step_count += 1;
                }
                snapshot.agent_state.clone_from(to);
            }
        }
    }
    snapshot
}

/// A durable point-in-time state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint identifier.
    pub id: String,
    /// Log position the snapshot covers.
    pub seq: u64,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
    /// The materialized state.
    pub snapshot: SessionSnapshot,
}

/// Storage backend for sessions. Backends are opaque to the core.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new, empty session.
    async fn create_session(&self) -> Result<SessionId>;

    /// Append an event, returning its sequence number.
    async fn append_event(&self, session: &str, event: SessionEvent) -> Result<u64>;

    /// Read events at or after `from_seq` (all events when `None`).
    async fn read_events(
        &self,
        session: &str,
        from_seq: Option<u64>,
    ) -> Result<Vec<SequencedEvent>>;

    /// Materialize and persist a checkpoint at the current log head.
    async fn create_checkpoint(&self, session: &str) -> Result<Checkpoint>;

    /// All checkpoints, oldest first.
    async fn list_checkpoints(&self, session: &str) -> Result<Vec<Checkpoint>>;

    /// Load the state at a checkpoint. Calls that were in flight when
    /// the checkpoint was taken come back as `failed{crash-recovery}`.
    async fn restore_from_checkpoint(
        &self,
        session: &str,
        checkpoint_id: &str,
    ) -> Result<SessionSnapshot>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod store_tests {
    use super::*;
    use crate::message::Message;
    use crate::tool::{CallFlags, ToolCaller};
    use serde_json::json;

    pub(crate) fn sample_call(id: &str) -> ToolCall {
        ToolCall::new(id, "echo", json!({}), ToolCaller::Direct, CallFlags::default())
    }

    /// Exercises a store implementation against the shared contract.
    pub(crate) async fn exercise_store(store: &dyn SessionStore) {
        let session = store.create_session().await.unwrap();

        let seq1 = store
            .append_event(
                &session,
                SessionEvent::MessageAdded {
                    message: Message::user("hello"),
                },
            )
            .await
            .unwrap();
        let seq2 = store
            .append_event(
                &session,
                SessionEvent::StateChanged {
                    from: "ready".into(),
                    to: "thinking".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);

        let events = store.read_events(&session, None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);

        let tail = store.read_events(&session, Some(2)).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 2);

        let checkpoint = store.create_checkpoint(&session).await.unwrap();
        assert_eq!(checkpoint.seq, 2);
        assert_eq!(checkpoint.snapshot.messages.len(), 1);
        assert_eq!(checkpoint.snapshot.step_count, 1);

        let listed = store.list_checkpoints(&session).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, checkpoint.id);

        let restored = store
            .restore_from_checkpoint(&session, &checkpoint.id)
            .await
            .unwrap();
        assert_eq!(restored.messages.len(), 1);
        assert_eq!(restored.agent_state, "thinking");
    }

    /// Replaying recorded events must reproduce checkpoint state.
    pub(crate) async fn exercise_replay_equivalence(store: &dyn SessionStore) {
        let session = store.create_session().await.unwrap();
        let call = sample_call("call_r");

        for event in [
            SessionEvent::MessageAdded {
                message: Message::user("do it"),
            },
            SessionEvent::StateChanged {
                from: "ready".into(),
                to: "thinking".into(),
            },
            SessionEvent::ToolCalled { call: call.clone() },
            SessionEvent::ToolResultRecorded {
                call_id: call.id.clone(),
                output: json!("done"),
                is_error: false,
            },
            SessionEvent::StateChanged {
                from: "thinking".into(),
                to: "ready".into(),
            },
        ] {
            store.append_event(&session, event).await.unwrap();
        }

        let checkpoint = store.create_checkpoint(&session).await.unwrap();
        let events = store.read_events(&session, None).await.unwrap();
        let replayed = replay(&events);

        assert_eq!(replayed.messages.len(), checkpoint.snapshot.messages.len());
        assert_eq!(replayed.step_count, checkpoint.snapshot.step_count);
        assert_eq!(replayed.agent_state, checkpoint.snapshot.agent_state);
        assert_eq!(replayed.calls.len(), 1);
        assert_eq!(replayed.calls[0].state, CallState::Succeeded);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::store_tests::sample_call;
    use super::*;
    use crate::message::Message;
    use serde_json::json;

    fn sequenced(seq: u64, event: SessionEvent) -> SequencedEvent {
        SequencedEvent {
            seq,
            timestamp: Utc::now(),
            event,
        }
    }

    #[test]
    fn replay_counts_steps_by_thinking_transitions() {
        let events = vec![
            sequenced(
                1,
                SessionEvent::StateChanged {
                    from: "ready".into(),
                    to: "thinking".into(),
                },
            ),
            sequenced(
                2,
                SessionEvent::StateChanged {
                    from: "thinking".into(),
                    to: "executing-tool".into(),
                },
            ),
            sequenced(
                3,
                SessionEvent::StateChanged {
                    from: "executing-tool".into(),
                    to: "thinking".into(),
                },
            ),
        ];
        let snapshot = replay(&events);
        assert_eq!(snapshot.step_count, 2);
        assert_eq!(snapshot.agent_state, "thinking");
    }

    #[test]
    fn replay_applies_tool_results() {
        let call = sample_call("c1");
        let events = vec![
            sequenced(1, SessionEvent::ToolCalled { call }),
            sequenced(
                2,
                SessionEvent::ToolResultRecorded {
                    call_id: "c1".into(),
                    output: json!("ok"),
                    is_error: false,
                },
            ),
        ];
        let snapshot = replay(&events);
        assert_eq!(snapshot.calls[0].state, CallState::Succeeded);
        assert!(snapshot.open_calls().is_empty());
    }

    #[test]
    fn fail_open_calls_marks_crash_recovery() {
        let mut snapshot = SessionSnapshot {
            messages: vec![Message::user("x")],
            calls: vec![sample_call("c1")],
            ..SessionSnapshot::default()
        };
        let failed = snapshot.fail_open_calls("crash-recovery");
        assert_eq!(failed, vec!["c1"]);
        assert_eq!(snapshot.calls[0].state, CallState::Failed);
        assert_eq!(snapshot.calls[0].error.as_deref(), Some("crash-recovery"));
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = SessionEvent::MessageAdded {
            message: Message::user("x"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"message_added""#));
    }
}
