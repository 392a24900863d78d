//! JSON-file session store: one directory per session, an append-only
//! `events.jsonl` log, and a `checkpoints.json` document.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write as _};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use super::{Checkpoint, SequencedEvent, SessionEvent, SessionId, SessionSnapshot, SessionStore, replay};
use crate::error::{Error, Result};

const EVENTS_FILE: &str = "events.jsonl";
const CHECKPOINTS_FILE: &str = "checkpoints.json";

/// Durable store for `STORE_TYPE=json`.
///
/// Log writes are line-append only; a partial trailing line (torn write
/// on crash) is skipped during reads.
#[derive(Debug)]
pub struct JsonFileSessionStore {
    root: PathBuf,
}

impl JsonFileSessionStore {
    /// Create a store rooted at `root`, creating the directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns a store error when the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::Store(format!("cannot create store root: {e}")))?;
        Ok(Self { root })
    }

    fn session_dir(&self, session: &str) -> Result<PathBuf> {
        // Session ids are uuids we minted; refuse anything path-like.
        if session.contains(['/', '\\', '.']) {
            return Err(Error::Store(format!("invalid session id '{session}'")));
        }
        let dir = self.root.join(session);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(Error::Store(format!("unknown session '{session}'")))
        }
    }

    fn load_events(&self, session: &str) -> Result<Vec<SequencedEvent>> {
        let path = self.session_dir(session)?.join(EVENTS_FILE);
        let file = fs::File::open(&path)
            .map_err(|e| Error::Store(format!("cannot open event log: {e}")))?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| Error::Store(format!("cannot read event log: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SequencedEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    debug!(error = %e, "skipping torn event log line");
                }
            }
        }
        Ok(events)
    }

    fn load_checkpoints(&self, session: &str) -> Result<Vec<Checkpoint>> {
        let path = self.session_dir(session)?.join(CHECKPOINTS_FILE);
        let data = fs::read_to_string(&path)
            .map_err(|e| Error::Store(format!("cannot read checkpoints: {e}")))?;
        serde_json::from_str(&data).map_err(|e| Error::Store(format!("corrupt checkpoints: {e}")))
    }

    fn save_checkpoints(&self, session: &str, checkpoints: &[Checkpoint]) -> Result<()> {
        let dir = self.session_dir(session)?;
        let tmp = dir.join(format!("{CHECKPOINTS_FILE}.tmp"));
        let data = serde_json::to_string_pretty(checkpoints)?;
        fs::write(&tmp, data).map_err(|e| Error::Store(format!("cannot write checkpoints: {e}")))?;
        fs::rename(&tmp, dir.join(CHECKPOINTS_FILE))
            .map_err(|e| Error::Store(format!("cannot replace checkpoints: {e}")))
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn create_session(&self) -> Result<SessionId> {
        let id = Uuid::new_v4().to_string();
        let dir = self.root.join(&id);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Store(format!("cannot create session dir: {e}")))?;
        fs::write(dir.join(EVENTS_FILE), "")
            .map_err(|e| Error::Store(format!("cannot create event log: {e}")))?;
        fs::write(dir.join(CHECKPOINTS_FILE), "[]")
            .map_err(|e| Error::Store(format!("cannot create checkpoints: {e}")))?;
        Ok(id)
    }

    async fn append_event(&self, session: &str, event: SessionEvent) -> Result<u64> {
        let seq = self.load_events(session)?.last().map_or(0, |e| e.seq) + 1;
        let sequenced = SequencedEvent {
            seq,
            timestamp: Utc::now(),
            event,
        };
        let line = serde_json::to_string(&sequenced)?;
        let path = self.session_dir(session)?.join(EVENTS_FILE);
        // Seal a torn trailing line before appending.
        let needs_newline = fs::read(&path)
            .map(|bytes| bytes.last().is_some_and(|b| *b != b'\n'))
            .unwrap_or(false);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| Error::Store(format!("cannot open event log: {e}")))?;
        if needs_newline {
            writeln!(file).map_err(|e| Error::Store(format!("cannot append event: {e}")))?;
        }
        writeln!(file, "{line}").map_err(|e| Error::Store(format!("cannot append event: {e}")))?;
        Ok(seq)
    }

    async fn read_events(
        &self,
        session: &str,
        from_seq: Option<u64>,
    ) -> Result<Vec<SequencedEvent>> {
        let from = from_seq.unwrap_or(0);
        Ok(self
            .load_events(session)?
            .into_iter()
            .filter(|e| e.seq >= from)
            .collect())
    }

    async fn create_checkpoint(&self, session: &str) -> Result<Checkpoint> {
        let events = self.load_events(session)?;
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            seq: events.last().map_or(0, |e| e.seq),
            created_at: Utc::now(),
            snapshot: replay(&events),
        };
        let mut checkpoints = self.load_checkpoints(session)?;
        checkpoints.push(checkpoint.clone());
        self.save_checkpoints(session, &checkpoints)?;
        Ok(checkpoint)
    }

    async fn list_checkpoints(&self, session: &str) -> Result<Vec<Checkpoint>> {
        self.load_checkpoints(session)
    }

    async fn restore_from_checkpoint(
        &self,
        session: &str,
        checkpoint_id: &str,
    ) -> Result<SessionSnapshot> {
        let mut snapshot = self
            .load_checkpoints(session)?
            .into_iter()
            .find(|c| c.id == checkpoint_id)
            .map(|c| c.snapshot)
            .ok_or_else(|| Error::Store(format!("unknown checkpoint '{checkpoint_id}'")))?;
        snapshot.fail_open_calls("crash-recovery");
        Ok(snapshot)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::session::store_tests;

    #[tokio::test]
    async fn satisfies_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path()).unwrap();
        store_tests::exercise_store(&store).await;
    }

    #[tokio::test]
    async fn replay_matches_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path()).unwrap();
        store_tests::exercise_replay_equivalence(&store).await;
    }

    #[tokio::test]
    async fn events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let session = {
            let store = JsonFileSessionStore::new(dir.path()).unwrap();
            let session = store.create_session().await.unwrap();
            store
                .append_event(
                    &session,
                    SessionEvent::MessageAdded {
                        message: Message::user("persist me"),
                    },
                )
                .await
                .unwrap();
            session
        };

        let reopened = JsonFileSessionStore::new(dir.path()).unwrap();
        let events = reopened.read_events(&session, None).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path()).unwrap();
        let session = store.create_session().await.unwrap();
        store
            .append_event(
                &session,
                SessionEvent::MessageAdded {
                    message: Message::user("whole"),
                },
            )
            .await
            .unwrap();

        // Simulate a crash mid-append.
        let log = dir.path().join(&session).join(EVENTS_FILE);
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        write!(file, r#"{{"seq": 2, "time"#).unwrap();
        drop(file);

        let events = store.read_events(&session, None).await.unwrap();
        assert_eq!(events.len(), 1);

        // Appending after the torn line seals it and assigns the next seq.
        let seq = store
            .append_event(
                &session,
                SessionEvent::MessageAdded {
                    message: Message::user("next"),
                },
            )
            .await
            .unwrap();
        assert_eq!(seq, 2);
        let events = store.read_events(&session, None).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn path_like_session_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path()).unwrap();
        assert!(store.read_events("../evil", None).await.is_err());
    }
}
