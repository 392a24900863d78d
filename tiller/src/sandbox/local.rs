//! In-process sandbox backed by `tokio::process`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, warn};

use super::policy::{AuditEntry, AuditLog, CommandPolicy};
use super::{ExecRequest, ExecResult, Sandbox, SandboxConfig, SandboxError, SandboxFactory};
use crate::error::Result;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs commands on the host under the full policy stack. The default
/// sandbox; container and cloud substrates plug in via
/// [`SandboxFactory`].
pub struct LocalSandbox {
    config: SandboxConfig,
    policy: CommandPolicy,
    audit: AuditLog,
}

impl std::fmt::Debug for LocalSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSandbox")
            .field("work_dir", &self.config.work_dir)
            .field("level", &self.config.security_level)
            .finish_non_exhaustive()
    }
}

impl LocalSandbox {
    /// Create a sandbox for the given config.
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        let policy = CommandPolicy::for_level(config.security_level);
        Self {
            config,
            policy,
            audit: AuditLog::new(),
        }
    }

    /// Override the command policy (allow-list, violation action).
    #[must_use]
    pub fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn record_denial(&self, request: &ExecRequest, reason: &str) {
        warn!(command = %request.command, reason, "sandbox denied command");
        self.audit.record(AuditEntry {
            timestamp: Utc::now(),
            command: request.command.clone(),
            args: request.args.clone(),
            decision: "denied".into(),
            exit_code: None,
            duration_ms: None,
        });
    }

    fn truncate(text: Vec<u8>, limit: usize, truncated: &mut bool) -> String {
        let mut text = String::from_utf8_lossy(&text).into_owned();
        if text.len() > limit {
            // The byte limit may land inside a multibyte character; back
            // off to the nearest char boundary so truncation cannot panic.
            let end = (0..=limit)
                .rev()
                .find(|&i| text.is_char_boundary(i))
                .unwrap_or(0);
            text.truncate(end);
            *truncated = true;
        }
        text
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn execute(&self, request: ExecRequest) -> std::result::Result<ExecResult, SandboxError> {
        // Gate the full command line, arguments included.
        let command_line = if request.args.is_empty() {
            request.command.clone()
        } else {
            format!("{} {}", request.command, request.args.join(" "))
        };
        if let Err(reason) = self.policy.validate_command(&command_line) {
            self.record_denial(&request, &reason);
            return Err(SandboxError::Violation(reason));
        }

        // Contain the working directory.
        let work_dir: PathBuf = match &request.work_dir {
            Some(dir) => self
                .policy
                .contain_path(&self.config.work_dir, dir)
                .map_err(|reason| {
                    self.record_denial(&request, &reason);
                    SandboxError::Violation(reason)
                })?,
            None => self.config.work_dir.clone(),
        };

        let mut env = self.policy.scrub_env(&request.env);
        // Binary resolution needs a search path even under an otherwise
        // cleared environment.
        if !env.contains_key("PATH") {
            if let Ok(path) = std::env::var("PATH") {
                env.insert("PATH".into(), path);
            }
        }
        let timeout = request.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);

        debug!(command = %request.command, work_dir = %work_dir.display(), "executing sandboxed command");
        let started = Instant::now();

        let mut command = Command::new(&request.command);
        command
            .args(&request.args)
            .env_clear()
            .envs(&env)
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| SandboxError::Infrastructure(format!("spawn failed: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SandboxError::Infrastructure(format!("wait failed: {e}")));
            }
            Err(_) => {
                self.audit.record(AuditEntry {
                    timestamp: Utc::now(),
                    command: request.command.clone(),
                    args: request.args.clone(),
                    decision: "timeout".into(),
                    exit_code: None,
                    duration_ms: Some(started.elapsed().as_millis() as u64),
                });
                return Err(SandboxError::Timeout(timeout));
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        let limit = self.config.limits.max_output_bytes;
        let mut truncated = false;
        let stdout = Self::truncate(output.stdout, limit, &mut truncated);
        let stderr = Self::truncate(output.stderr, limit, &mut truncated);

        self.audit.record(AuditEntry {
            timestamp: Utc::now(),
            command: request.command.clone(),
            args: request.args.clone(),
            decision: "executed".into(),
            exit_code: Some(exit_code),
            duration_ms: Some(duration_ms),
        });

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code,
            duration_ms,
            truncated,
        })
    }

    fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn policy(&self) -> &CommandPolicy {
        &self.policy
    }
}

/// Factory for [`LocalSandbox`], registered under kind `"local"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSandboxFactory;

impl SandboxFactory for LocalSandboxFactory {
    fn kind(&self) -> &str {
        "local"
    }

    fn create(&self, config: &SandboxConfig) -> Result<Arc<dyn Sandbox>> {
        Ok(Arc::new(LocalSandbox::new(config.clone())))
    }
}
