//! Builder for [`Agent`].

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::state::StateCell;
use super::{Agent, AgentConfig, AgentCore};
use crate::control::{CancelToken, pause_gate};
use crate::error::{Error, Result};
use crate::event::EventBus;
use crate::memory::WorkingMemory;
use crate::middleware::{Middleware, MiddlewareChain, Summarizer};
use crate::permission::{CanUseTool, PermissionEngine, PermissionMode};
use crate::provider::Provider;
use crate::sandbox::CommandPolicy;
use crate::session::{MemorySessionStore, SessionStore};
use crate::template::{TemplateRegistry, TemplateVars};
use crate::tool::{Tool, ToolRegistry, ToolRuntime, ToolRuntimeConfig};

/// Builds an [`Agent`]. A provider is the only required input;
/// everything else has defaults: an in-memory session store, an empty
/// tool registry, and a middleware chain carrying the summarizer.
pub struct AgentBuilder {
    config: AgentConfig,
    provider: Option<Arc<dyn Provider>>,
    registry: Arc<ToolRegistry>,
    store: Option<Arc<dyn SessionStore>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    can_use: Option<Box<dyn CanUseTool>>,
    sandbox_policy: Option<CommandPolicy>,
    templates: Arc<TemplateRegistry>,
    system_template: Option<(String, TemplateVars)>,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("config", &self.config)
            .field("has_provider", &self.provider.is_some())
            .field("tools", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    /// Create a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
            provider: None,
            registry: Arc::new(ToolRegistry::new()),
            store: None,
            middlewares: Vec::new(),
            can_use: None,
            sandbox_policy: None,
            templates: Arc::new(TemplateRegistry::with_defaults()),
            system_template: None,
        }
    }

    /// Set the agent's name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the base system prompt.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    /// Set the model provider. Required.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register a tool, allowing every caller.
    #[must_use]
    pub fn tool(self, tool: impl Tool) -> Self {
        self.registry.register(tool);
        self
    }

    /// Use a shared tool registry instead of a private one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Use a specific session store. Defaults to in-memory.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add a middleware layer.
    #[must_use]
    pub fn middleware(mut self, layer: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(layer);
        self
    }

    /// Install the custom authorization callback.
    #[must_use]
    pub fn can_use_tool(mut self, hook: Box<dyn CanUseTool>) -> Self {
        self.can_use = Some(hook);
        self
    }

    /// Gate command-shaped tool inputs through a sandbox policy.
    #[must_use]
    pub fn sandbox_policy(mut self, policy: CommandPolicy) -> Self {
        self.sandbox_policy = Some(policy);
        self
    }

    /// Use a shared template registry instead of the built-in one.
    #[must_use]
    pub fn templates(mut self, registry: Arc<TemplateRegistry>) -> Self {
        self.templates = registry;
        self
    }

    /// Render the system prompt from a registered template at build
    /// time. A `{tools}` placeholder receives the tool listing.
    #[must_use]
    pub fn system_prompt_template(mut self, name: impl Into<String>, vars: TemplateVars) -> Self {
        self.system_template = Some((name.into(), vars));
        self
    }

    /// Set the tool approval mode.
    #[must_use]
    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.config.permission_mode = mode;
        self
    }

    /// Bound per-turn tool concurrency.
    #[must_use]
    pub fn max_parallel_tools(mut self, n: usize) -> Self {
        self.config.max_parallel_tools = n.max(1);
        self
    }

    /// Bound provider invocations per turn.
    #[must_use]
    pub fn step_limit(mut self, n: usize) -> Self {
        self.config.step_limit = n.max(1);
        self
    }

    /// Replace the full configuration.
    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the agent.
    ///
    /// # Errors
    ///
    /// Returns a validation error when no provider is configured.
    pub fn build(mut self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| Error::validation("agent requires a provider; call .provider()"))?;

        if let Some((name, mut vars)) = self.system_template.take() {
            if vars.get("tools").is_none() {
                let listing: String = self
                    .registry
                    .specs()
                    .iter()
                    .map(|spec| format!("- {}: {}\n", spec.name, spec.description))
                    .collect();
                vars.set("tools", listing.trim_end());
            }
            self.config.system_prompt = Some(self.templates.render(&name, &vars)?);
        }

        let agent_id = format!("{}-{}", self.config.name, &Uuid::new_v4().simple().to_string()[..8]);
        let bus = EventBus::new(self.config.bus.clone());
        let runtime = ToolRuntime::new(
            Arc::clone(&self.registry),
            bus.clone(),
            agent_id.clone(),
            ToolRuntimeConfig {
                max_parallel: self.config.max_parallel_tools,
                ..ToolRuntimeConfig::default()
            },
        );

        let mut permissions = PermissionEngine::new(self.config.permission_mode)
            .with_ask_timeout(self.config.ask_timeout);
        if let Some(hook) = self.can_use {
            permissions = permissions.with_can_use(hook);
        }

        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(Summarizer::new(self.config.compression.clone())));
        for layer in self.middlewares {
            chain.push(layer);
        }

        let store: Arc<dyn SessionStore> = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));
        let (pause_ctrl, pause_gate) = pause_gate();

        Ok(Agent::from_core(AgentCore {
            config: self.config,
            agent_id,
            provider,
            registry: self.registry,
            runtime,
            bus,
            store,
            session: Mutex::new(None),
            conversation: Mutex::new(Vec::new()),
            chain,
            permissions,
            sandbox_policy: self.sandbox_policy,
            state: StateCell::new(),
            cancel: CancelToken::new(),
            run_interrupt: StdMutex::new(CancelToken::new()),
            pause_ctrl,
            pause_gate,
            run_lock: Mutex::new(()),
            step_count: AtomicUsize::new(0),
            last_activity: StdMutex::new(Utc::now()),
            working_memory: Arc::new(StdMutex::new(WorkingMemory::new())),
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;

    #[test]
    fn provider_is_required() {
        let err = Agent::builder().build().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn builds_with_defaults() {
        let agent = Agent::builder()
            .name("helper")
            .provider(Arc::new(MockProvider::text_turns(vec!["hi"])))
            .build()
            .unwrap();
        assert!(agent.id().starts_with("helper-"));
        assert_eq!(agent.status().state, super::super::AgentState::Created);
    }

    #[test]
    fn unknown_system_template_fails_build() {
        let err = Agent::builder()
            .provider(Arc::new(MockProvider::text_turns(vec!["hi"])))
            .system_prompt_template("ghost", TemplateVars::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
