//! Agent memory: a TTL-scoped working document and a provenance-backed
//! semantic store.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Validates a working-memory write. Returning `Err` rejects it.
pub type WorkingValidator = Box<dyn Fn(&str, &Value) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkingEntry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl WorkingEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Session-scoped structured store with per-key TTL.
#[derive(Default)]
pub struct WorkingMemory {
    entries: HashMap<String, WorkingEntry>,
    validator: Option<WorkingValidator>,
}

impl std::fmt::Debug for WorkingMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingMemory")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

impl WorkingMemory {
    /// Create an empty, unvalidated store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a schema validator applied to every write.
    #[must_use]
    pub fn with_validator(mut self, validator: WorkingValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Write a key, optionally with a time-to-live.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the installed validator rejects
    /// the value.
    pub fn set(&mut self, key: impl Into<String>, value: Value, ttl: Option<Duration>) -> Result<()> {
        let key = key.into();
        if let Some(validator) = &self.validator {
            validator(&key, &value)
                .map_err(|reason| Error::validation(format!("working memory '{key}': {reason}")))?;
        }
        self.entries.insert(
            key,
            WorkingEntry {
                value,
                expires_at: ttl.map(|ttl| Utc::now() + ttl),
            },
        );
        Ok(())
    }

    /// Read a key. Expired entries read as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        let now = Utc::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| &entry.value)
    }

    /// Remove a key. Returns `true` if it was present and live.
    pub fn remove(&mut self, key: &str) -> bool {
        let now = Utc::now();
        self.entries
            .remove(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries.values().filter(|e| e.is_live(now)).count()
    }

    /// Returns `true` if no live keys exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live entries as one JSON object, for prompt injection.
    #[must_use]
    pub fn digest(&self) -> Value {
        let now = Utc::now();
        let map: serde_json::Map<String, Value> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        Value::Object(map)
    }
}

/// Links a semantic entry back to the conversation that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Id of the source message.
    pub source_message_id: String,
    /// Supporting quote or rationale.
    pub evidence: String,
}

/// One long-term memory entry. Always carries at least one provenance
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticEntry {
    /// Entry identifier.
    pub id: String,
    /// The remembered content.
    pub content: String,
    /// Optional embedding vector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Routing tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Where the entry came from. Never empty.
    pub provenance: Vec<Provenance>,
}

impl SemanticEntry {
    /// Create an entry, enforcing the provenance invariant and clamping
    /// confidence into `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `provenance` is empty.
    pub fn new(
        content: impl Into<String>,
        confidence: f64,
        provenance: Vec<Provenance>,
    ) -> Result<Self> {
        if provenance.is_empty() {
            return Err(Error::validation(
                "semantic entries require at least one provenance record",
            ));
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            embedding: None,
            tags: Vec::new(),
            confidence: confidence.clamp(0.0, 1.0),
            provenance,
        })
    }

    /// Attach tags.
    #[must_use]
    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Attach an embedding.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Long-term store of semantic entries.
#[derive(Debug, Default)]
pub struct SemanticMemory {
    entries: Vec<SemanticEntry>,
}

impl SemanticMemory {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, returning its id.
    pub fn add(&mut self, entry: SemanticEntry) -> String {
        let id = entry.id.clone();
        self.entries.push(entry);
        id
    }

    /// Look up by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&SemanticEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Entries carrying `tag`, most confident first.
    #[must_use]
    pub fn find_by_tag(&self, tag: &str) -> Vec<&SemanticEntry> {
        let mut found: Vec<&SemanticEntry> = self
            .entries
            .iter()
            .filter(|e| e.tags.iter().any(|t| t == tag))
            .collect();
        found.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        found
    }

    /// Remove entries below a confidence floor. Returns how many were
    /// removed.
    pub fn evict_below(&mut self, confidence: f64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.confidence >= confidence);
        before - self.entries.len()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
