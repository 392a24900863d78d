//! Sandbox abstraction: policy-enforced command execution.
//!
//! The core consumes the [`Sandbox`] interface only; cloud providers
//! plug in through [`SandboxFactory`]. The in-tree [`LocalSandbox`] runs
//! commands in-process under the full policy stack (command gating,
//! environment scrubbing, path containment, resource limits, audit).

mod local;
mod policy;

pub use local::LocalSandbox;
pub use policy::{
    AuditEntry, AuditLog, CommandPolicy, CommandStats, NetworkDecision, NetworkPolicy,
    ViolationAction,
};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, Result};

/// Enforcement tier of a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// No gating at all.
    None,
    /// Dangerous-pattern gating and environment scrubbing.
    #[default]
    Basic,
    /// Basic plus a command allow-list.
    Strict,
    /// Strict plus a shell-metacharacter ban.
    Paranoid,
}

/// Resource ceilings for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU seconds.
    pub max_cpu_seconds: u64,
    /// Resident memory in bytes.
    pub max_memory_bytes: u64,
    /// Largest file the command may create, in bytes.
    pub max_file_size_bytes: u64,
    /// Process count.
    pub max_processes: u32,
    /// Captured output in bytes; the rest is truncated.
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_seconds: 30,
            max_memory_bytes: 512 * 1024 * 1024,
            max_file_size_bytes: 10 * 1024 * 1024,
            max_processes: 16,
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Configuration handed to a sandbox factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Factory id (`"local"`, `"docker"`, ...).
    pub kind: String,
    /// Root directory executions are contained in.
    pub work_dir: PathBuf,
    /// Enforcement tier.
    #[serde(default)]
    pub security_level: SecurityLevel,
    /// Resource ceilings.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Network gating.
    #[serde(default)]
    pub network: NetworkPolicy,
    /// Glob patterns exempt from path containment reporting.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

impl SandboxConfig {
    /// A local sandbox rooted at `work_dir` with defaults.
    #[must_use]
    pub fn local(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind: "local".into(),
            work_dir: work_dir.into(),
            security_level: SecurityLevel::default(),
            limits: ResourceLimits::default(),
            network: NetworkPolicy::default(),
            ignore_patterns: Vec::new(),
        }
    }
}

/// One command execution request.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// The command (binary or shell line, sandbox-dependent).
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Environment. Scrubbed before execution.
    pub env: HashMap<String, String>,
    /// Working directory, contained within the sandbox root.
    pub work_dir: Option<PathBuf>,
    /// Per-command deadline.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    /// A request with no args, default env, root work dir.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            work_dir: None,
            timeout: None,
        }
    }

    /// Set the arguments.
    #[must_use]
    pub fn args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a sandboxed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// Captured stdout, possibly truncated.
    pub stdout: String,
    /// Captured stderr, possibly truncated.
    pub stderr: String,
    /// Process exit code.
    pub exit_code: i32,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Whether output hit the size ceiling.
    pub truncated: bool,
}

/// Errors from sandboxed execution.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// The command violated the security policy.
    #[error("sandbox policy violation: {0}")]
    Violation(String),

    /// The command exceeded its deadline.
    #[error("sandbox command timed out after {0:?}")]
    Timeout(Duration),

    /// The substrate failed to run the command at all.
    #[error("sandbox infrastructure failure: {0}")]
    Infrastructure(String),
}

impl From<SandboxError> for Error {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Violation(reason) => Self::SandboxViolation(reason),
            SandboxError::Timeout(d) => Self::Transient {
                message: format!("sandbox timeout after {d:?}"),
                attempts: 1,
            },
            SandboxError::Infrastructure(reason) => Self::Transient {
                message: reason,
                attempts: 1,
            },
        }
    }
}

/// The pluggable execution backend.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Execute a command under policy.
    async fn execute(&self, request: ExecRequest) -> std::result::Result<ExecResult, SandboxError>;

    /// The audit log of this sandbox.
    fn audit(&self) -> &AuditLog;

    /// The command policy in force.
    fn policy(&self) -> &CommandPolicy;
}

/// Creates sandboxes from configs. Registered by the `kind` string.
pub trait SandboxFactory: Send + Sync {
    /// The kind this factory handles.
    fn kind(&self) -> &str;

    /// Build a sandbox.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed configs.
    fn create(&self, config: &SandboxConfig) -> Result<Arc<dyn Sandbox>>;
}

/// Registry of sandbox factories.
#[derive(Default)]
pub struct SandboxRegistry {
    factories: RwLock<HashMap<String, Arc<dyn SandboxFactory>>>,
}

impl std::fmt::Debug for SandboxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<String> = self
            .factories
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("SandboxRegistry").field("kinds", &kinds).finish()
    }
}

impl SandboxRegistry {
    /// A registry with the in-tree local factory preinstalled.
    #[must_use]
    pub fn with_local() -> Self {
        let registry = Self::default();
        registry.register(Arc::new(local::LocalSandboxFactory));
        registry
    }

    /// Register a factory, replacing any previous one of the same kind.
    pub fn register(&self, factory: Arc<dyn SandboxFactory>) {
        self.factories
            .write()
            .expect("sandbox registry poisoned")
            .insert(factory.kind().to_string(), factory);
    }

    /// Build a sandbox for `config`.
    ///
    /// # Errors
    ///
    /// Returns a validation error when no factory is registered for
    /// `config.kind`.
    pub fn create(&self, config: &SandboxConfig) -> Result<Arc<dyn Sandbox>> {
        let factory = self
            .factories
            .read()
            .expect("sandbox registry poisoned")
            .get(&config.kind)
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown sandbox kind '{}'", config.kind)))?;
        factory.create(config)
    }
}
