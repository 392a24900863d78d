//! In-memory session store, for tests and ephemeral agents.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{Checkpoint, SequencedEvent, SessionEvent, SessionId, SessionSnapshot, SessionStore, replay};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct SessionData {
    events: Vec<SequencedEvent>,
    checkpoints: Vec<Checkpoint>,
}

/// Non-durable store keeping everything in process memory.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, SessionData>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_session<T>(
        &self,
        session: &str,
        f: impl FnOnce(&mut SessionData) -> T,
    ) -> Result<T> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        let data = sessions
            .get_mut(session)
            .ok_or_else(|| Error::Store(format!("unknown session '{session}'")))?;
        Ok(f(data))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self) -> Result<SessionId> {
        let id = Uuid::new_v4().to_string();
        self.sessions
            .lock()
            .expect("session store poisoned")
            .insert(id.clone(), SessionData::default());
        Ok(id)
    }

    async fn append_event(&self, session: &str, event: SessionEvent) -> Result<u64> {
        self.with_session(session, |data| {
            let seq = data.events.len() as u64 + 1;
            data.events.push(SequencedEvent {
                seq,
                timestamp: Utc::now(),
                event,
            });
            seq
        })
    }

    async fn read_events(
        &self,
        session: &str,
        from_seq: Option<u64>,
    ) -> Result<Vec<SequencedEvent>> {
        self.with_session(session, |data| {
            let from = from_seq.unwrap_or(0);
            data.events
                .iter()
                .filter(|e| e.seq >= from)
                .cloned()
                .collect()
        })
    }

    async fn create_checkpoint(&self, session: &str) -> Result<Checkpoint> {
        self.with_session(session, |data| {
            let checkpoint = Checkpoint {
                id: Uuid::new_v4().to_string(),
                seq: data.events.len() as u64,
                created_at: Utc::now(),
                snapshot: replay(&data.events),
            };
            data.checkpoints.push(checkpoint.clone());
            checkpoint
        })
    }

    async fn list_checkpoints(&self, session: &str) -> Result<Vec<Checkpoint>> {
        self.with_session(session, |data| data.checkpoints.clone())
    }

    async fn restore_from_checkpoint(
        &self,
        session: &str,
        checkpoint_id: &str,
    ) -> Result<SessionSnapshot> {
        let mut snapshot = self.with_session(session, |data| {
            data.checkpoints
                .iter()
                .find(|c| c.id == checkpoint_id)
                .map(|c| c.snapshot.clone())
        })?
        .ok_or_else(|| Error::Store(format!("unknown checkpoint '{checkpoint_id}'")))?;
        snapshot.fail_open_calls("crash-recovery");
        Ok(snapshot)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::store_tests;

    #[tokio::test]
    async fn satisfies_store_contract() {
        let store = MemorySessionStore::new();
        store_tests::exercise_store(&store).await;
    }

    #[tokio::test]
    async fn replay_matches_checkpoints() {
        let store = MemorySessionStore::new();
        store_tests::exercise_replay_equivalence(&store).await;
    }

    #[tokio::test]
    async fn unknown_session_errors() {
        let store = MemorySessionStore::new();
        assert!(store.read_events("ghost", None).await.is_err());
    }

    #[tokio::test]
    async fn restore_fails_open_calls() {
        let store = MemorySessionStore::new();
        let session = store.create_session().await.unwrap();
        store
            .append_event(
                &session,
                SessionEvent::ToolCalled {
                    call: store_tests::sample_call("c1"),
                },
            )
            .await
            .unwrap();
        let checkpoint = store.create_checkpoint(&session).await.unwrap();

        let restored = store
            .restore_from_checkpoint(&session, &checkpoint.id)
            .await
            .unwrap();
        assert_eq!(restored.calls[0].error.as_deref(), Some("crash-recovery"));
    }
}
