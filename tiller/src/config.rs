//! Process-level configuration: environment-driven options and logging
//! setup.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};
use crate::session::{JsonFileSessionStore, MemorySessionStore, SessionStore};

/// Recognized session store backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// JSON files on local disk (in-tree).
    #[default]
    Json,
    /// SQL database (external backend required).
    Sql,
    /// Key-value store (external backend required).
    Kv,
    /// In-process memory, non-durable.
    Memory,
}

/// Session store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind.
    pub kind: StoreKind,
    /// Backend location (directory for `json`, DSN otherwise).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Env-filter directive (`"info"`, `"tiller=debug"`, ...).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::default(),
        }
    }
}

/// Process-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Session store settings.
    pub store: StoreConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Build a configuration from recognized environment variables:
    /// `STORE_TYPE` (`json` | `sql` | `kv` | `memory`), `STORE_DSN`,
    /// `LOG_LEVEL`, and `LOG_FORMAT` (`text` | `json`).
    ///
    /// # Errors
    ///
    /// Returns a validation error for unrecognized values.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(kind) = std::env::var("STORE_TYPE") {
            config.store.kind = match kind.to_lowercase().as_str() {
                "json" => StoreKind::Json,
                "sql" => StoreKind::Sql,
                "kv" => StoreKind::Kv,
                "memory" => StoreKind::Memory,
                other => {
                    return Err(Error::validation(format!("unknown STORE_TYPE '{other}'")));
                }
            };
        }
        if let Ok(dsn) = std::env::var("STORE_DSN") {
            config.store.dsn = Some(dsn);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.log.format = match format.to_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => {
                    return Err(Error::validation(format!("unknown LOG_FORMAT '{other}'")));
                }
            };
        }

        Ok(config)
    }

    /// Open the configured session store.
    ///
    /// # Errors
    ///
    /// `sql` and `kv` backends live outside this crate: selecting them
    /// without wiring one in is a configuration error. The
    /// [`SessionStore`] trait is the extension point.
    pub fn open_store(&self) -> Result<Arc<dyn SessionStore>> {
        match self.store.kind {
            StoreKind::Json => {
                let root = self.store.dsn.clone().unwrap_or_else(|| "./sessions".into());
                Ok(Arc::new(JsonFileSessionStore::new(root)?))
            }
            StoreKind::Memory => Ok(Arc::new(MemorySessionStore::new())),
            StoreKind::Sql | StoreKind::Kv => Err(Error::validation(
                "sql/kv session stores require an external backend implementing SessionStore",
            )),
        }
    }
}

/// Install the global tracing subscriber per the log configuration.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_ok() {
        info!(level = %config.level, format = ?config.format, "tracing initialized");
    }
}
