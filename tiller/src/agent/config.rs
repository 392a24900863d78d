//! Agent configuration.

use std::time::Duration;

use crate::event::BusConfig;
use crate::middleware::CompressionConfig;
use crate::permission::PermissionMode;
use crate::provider::RetryPolicy;
use crate::sandbox::ViolationAction;

/// Tunables for one agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Display name, also the prefix of the agent id.
    pub name: String,
    /// Base system prompt.
    pub system_prompt: Option<String>,
    /// Parallel tool executions per turn.
    pub max_parallel_tools: usize,
    /// Provider invocations per turn before the loop stops with
    /// `stop_reason = step-limit`.
    pub step_limit: usize,
    /// Tool approval mode.
    pub permission_mode: PermissionMode,
    /// Conversation compression tunables.
    pub compression: CompressionConfig,
    /// Event bus retention and delivery defaults.
    pub bus: BusConfig,
    /// Deadline for control-channel approval asks.
    pub ask_timeout: Duration,
    /// Drain deadline for `stop()`; exceeded means
    /// `failed{stop-timeout}`.
    pub stop_grace: Duration,
    /// What a sandbox policy violation does to the agent.
    pub violation_action: ViolationAction,
    /// Per-call provider deadline.
    pub provider_timeout: Option<Duration>,
    /// Provider retry/backoff tunables.
    pub retry: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "agent".into(),
            system_prompt: None,
            max_parallel_tools: 4,
            step_limit: 20,
            permission_mode: PermissionMode::default(),
            compression: CompressionConfig::default(),
            bus: BusConfig::default(),
            ask_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(30),
            violation_action: ViolationAction::default(),
            provider_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = AgentConfig::default();
        assert_eq!(config.max_parallel_tools, 4);
        assert_eq!(config.step_limit, 20);
        assert_eq!(config.permission_mode, PermissionMode::Default);
        assert_eq!(config.stop_grace, Duration::from_secs(30));
    }
}
