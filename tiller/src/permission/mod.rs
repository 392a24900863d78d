//! The permission layer: mode evaluation and human-in-the-loop asks.
//!
//! Authorization is a fixed pipeline where the first veto wins:
//! registry existence, caller allowance, permission mode, sandbox policy,
//! then the optional [`CanUseTool`] callback (which may rewrite the
//! input). Every denial is published to the monitor channel as an audit
//! event.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::event::{Channel, EventBus, EventPayload};
use crate::sandbox::CommandPolicy;
use crate::tool::{RiskLevel, ToolCaller, ToolRegistry};

/// How tool calls are approved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Ask a human via the control channel.
    #[default]
    Default,
    /// Auto-approve writes; still ask for destructive or high-risk calls.
    AcceptEdits,
    /// Auto-approve everything.
    Bypass,
    /// Deny execution and record the intended call only.
    Plan,
    /// Auto-approve read-only calls with risk at most [`RiskLevel::Low`];
    /// ask for everything else. The auto-approval is deterministic and
    /// never consults the control channel.
    SmartApprove,
}

/// Which pipeline step vetoed a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialSource {
    /// The tool is not registered.
    Registry,
    /// The caller is not allowed.
    Caller,
    /// The permission mode refused (or the approver did).
    Mode,
    /// The sandbox policy refused.
    Sandbox,
    /// The custom callback refused.
    Callback,
}

/// Outcome of the authorization pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// The call may proceed with this (possibly rewritten) input.
    Approved {
        /// The effective tool input.
        input: Value,
    },
    /// The call may not proceed.
    Denied {
        /// Why.
        reason: String,
        /// Plan mode: record the intent, do not treat it as a refusal.
        record_only: bool,
        /// Which step vetoed.
        source: DenialSource,
    },
}

impl Authorization {
    /// Returns `true` if the call was approved.
    #[must_use]
    pub const fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }
}

/// Decision of a [`CanUseTool`] callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanUseDecision {
    /// Proceed unchanged.
    Allow,
    /// Proceed with a rewritten input.
    AllowRewritten(Value),
    /// Refuse.
    Deny(String),
}

/// Custom last-step authorization hook. May rewrite the tool input.
#[async_trait]
pub trait CanUseTool: Send + Sync {
    /// Decide whether the call may proceed.
    async fn can_use(&self, name: &str, input: &Value, caller: ToolCaller) -> CanUseDecision;
}

/// Tracks in-flight control-channel approval requests.
#[derive(Debug, Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl ApprovalBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an approval request and await the response, up to
    /// `timeout`. Missing approvers and timeouts both deny.
    pub async fn ask(
        &self,
        bus: &EventBus,
        agent_id: &str,
        call_id: &str,
        name: &str,
        input: &Value,
        timeout: Duration,
    ) -> bool {
        if !bus.has_subscriber_on(Channel::Control) {
            debug!(tool = name, "no control-channel approver; denying");
            return false;
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("approval broker poisoned")
            .insert(request_id.clone(), tx);

        bus.publish(
            agent_id,
            &EventPayload::ApprovalRequest {
                request_id: request_id.clone(),
                call_id: call_id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            },
        )
        .await;

        let approved = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(approved)) => approved,
            _ => false,
        };
        self.pending
            .lock()
            .expect("approval broker poisoned")
            .remove(&request_id);
        approved
    }

    /// Resolve a pending request. Returns `false` for unknown ids.
    pub fn resolve(&self, request_id: &str, approved: bool) -> bool {
        self.pending
            .lock()
            .expect("approval broker poisoned")
            .remove(request_id)
            .is_some_and(|tx| tx.send(approved).is_ok())
    }

    /// Number of unanswered requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("approval broker poisoned").len()
    }
}

/// The authorization pipeline of the tool runtime.
pub struct PermissionEngine {
    mode: PermissionMode,
    can_use: Option<Box<dyn CanUseTool>>,
    broker: ApprovalBroker,
    ask_timeout: Duration,
}

impl std::fmt::Debug for PermissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionEngine")
            .field("mode", &self.mode)
            .field("ask_timeout", &self.ask_timeout)
            .field("has_can_use", &self.can_use.is_some())
            .finish()
    }
}

impl PermissionEngine {
    /// Create an engine for the given mode.
    #[must_use]
    pub fn new(mode: PermissionMode) -> Self {
        Self {
            mode,
            can_use: None,
            broker: ApprovalBroker::new(),
            ask_timeout: Duration::from_secs(60),
        }
    }

    /// Install the custom authorization callback.
    #[must_use]
    pub fn with_can_use(mut self, can_use: Box<dyn CanUseTool>) -> Self {
        self.can_use = Some(can_use);
        self
    }

    /// Set the control-channel ask deadline.
    #[must_use]
    pub const fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = timeout;
        self
    }

    /// The active mode.
    #[must_use]
    pub const fn mode(&self) -> PermissionMode {
        self.mode
    }

    /// The approval broker, for resolving control responses.
    #[must_use]
    pub const fn broker(&self) -> &ApprovalBroker {
        &self.broker
    }

    /// Run the pipeline for one tool-use block. First veto wins.
    #[allow(clippy::too_many_arguments)]
    pub async fn authorize(
        &self,
        registry: &ToolRegistry,
        sandbox_policy: Option<&CommandPolicy>,
        bus: &EventBus,
        agent_id: &str,
        call_id: &str,
        name: &str,
        input: Value,
        caller: ToolCaller,
    ) -> Authorization {
        // 1. The tool must exist.
        let Some(entry) = registry.get(name) else {
            return self
                .deny(bus, agent_id, name, format!("unknown tool '{name}'"), false, DenialSource::Registry)
                .await;
        };

        // 2. The caller must be allowed.
        if !entry.allowed_callers.contains(&caller) {
            return self
                .deny(
                    bus,
                    agent_id,
                    name,
                    format!("caller '{}' is not allowed", caller.as_str()),
                    false,
                    DenialSource::Caller,
                )
                .await;
        }

        // 3. Permission mode.
        let annotations = entry.tool.annotations();
        match self.mode {
            PermissionMode::Bypass => {}
            PermissionMode::Plan => {
                info!(tool = name, "plan mode: recording intended call");
                return self.deny(bus, agent_id, name, "plan-mode".to_string(), true, DenialSource::Mode)
                    .await;
            }
            PermissionMode::SmartApprove => {
                let auto = annotations.read_only && annotations.risk_level <= RiskLevel::Low;
                if !auto
                    && !self
                        .broker
                        .ask(bus, agent_id, call_id, name, &input, self.ask_timeout)
                        .await
                {
                    return self
                        .deny(bus, agent_id, name, "approval refused".to_string(), false, DenialSource::Mode)
                        .await;
                }
            }
            PermissionMode::AcceptEdits => {
                let needs_ask =
                    annotations.destructive || annotations.risk_level >= RiskLevel::High;
                if needs_ask
                    && !self
                        .broker
                        .ask(bus, agent_id, call_id, name, &input, self.ask_timeout)
                        .await
                {
                    return self
                        .deny(bus, agent_id, name, "approval refused".to_string(), false, DenialSource::Mode)
                        .await;
                }
            }
            PermissionMode::Default => {
                if !self
                    .broker
                    .ask(bus, agent_id, call_id, name, &input, self.ask_timeout)
                    .await
                {
                    return self
                        .deny(bus, agent_id, name, "approval refused".to_string(), false, DenialSource::Mode)
                        .await;
                }
            }
        }

        // 4. Sandbox policy: gate command-shaped inputs.
        if let Some(policy) = sandbox_policy {
            if let Some(command) = input.get("command").and_then(Value::as_str) {
                if let Err(reason) = policy.validate_command(command) {
                    return self.deny(bus, agent_id, name, reason, false, DenialSource::Sandbox).await;
                }
            }
        }

        // 5. Custom callback, which may rewrite the input.
        let effective_input = match &self.can_use {
            Some(hook) => match hook.can_use(name, &input, caller).await {
                CanUseDecision::Allow => input,
                CanUseDecision::AllowRewritten(rewritten) => rewritten,
                CanUseDecision::Deny(reason) => {
                    return self.deny(bus, agent_id, name, reason, false, DenialSource::Callback).await;
                }
            },
            None => input,
        };

        bus.publish(
            agent_id,
            &EventPayload::Audit {
                subject: name.to_string(),
                decision: "approved".to_string(),
                reason: format!("mode {:?}", self.mode),
            },
        )
        .await;

        Authorization::Approved {
            input: effective_input,
        }
    }

    async fn deny(
        &self,
        bus: &EventBus,
        agent_id: &str,
        name: &str,
        reason: String,
        record_only: bool,
        source: DenialSource,
    ) -> Authorization {
        bus.publish(
            agent_id,
            &EventPayload::Audit {
                subject: name.to_string(),
                decision: if record_only { "recorded" } else { "denied" }.to_string(),
                reason: reason.clone(),
            },
        )
        .await;
        Authorization::Denied {
            reason,
            record_only,
            source,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::SubscribeOptions;
    use crate::tool::test_tools::EchoTool;
    use serde_json::json;

    fn registry() -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry
    }

    async fn authorize_with(engine: &PermissionEngine, bus: &EventBus) -> Authorization {
        engine
            .authorize(
                &registry(),
                None,
                bus,
                "agent",
                "call_1",
                "echo",
                json!({"message": "hi"}),
                ToolCaller::Direct,
            )
            .await
    }

    #[tokio::test]
    async fn bypass_approves_everything() {
        let engine = PermissionEngine::new(PermissionMode::Bypass);
        let auth = authorize_with(&engine, &EventBus::default()).await;
        assert!(auth.is_approved());
    }

    #[tokio::test]
    async fn plan_mode_records_without_executing() {
        let engine = PermissionEngine::new(PermissionMode::Plan);
        let bus = EventBus::default();
        let mut monitor = bus.subscribe(SubscribeOptions::channels([Channel::Monitor]));

        let auth = authorize_with(&engine, &bus).await;
        assert_eq!(
            auth,
            Authorization::Denied {
                reason: "plan-mode".into(),
                record_only: true,
                source: DenialSource::Mode,
            }
        );

        let audit = monitor.recv().await.unwrap();
        assert_eq!(audit.event_type, "audit");
        assert_eq!(audit.payload["decision"], "recorded");
    }

    #[tokio::test]
    async fn smart_approve_is_deterministic_for_safe_read_only() {
        // EchoTool is read-only + safe: never consults the control channel.
        let engine = PermissionEngine::new(PermissionMode::SmartApprove)
            .with_ask_timeout(Duration::from_millis(10));
        let bus = EventBus::default();
        for _ in 0..5 {
            assert!(authorize_with(&engine, &bus).await.is_approved());
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_denied() {
        let engine = PermissionEngine::new(PermissionMode::Bypass);
        let bus = EventBus::default();
        let auth = engine
            .authorize(
                &registry(),
                None,
                &bus,
                "agent",
                "call_1",
                "ghost",
                json!({}),
                ToolCaller::Direct,
            )
            .await;
        assert!(!auth.is_approved());
    }

    #[tokio::test]
    async fn disallowed_caller_is_denied() {
        let reg = ToolRegistry::new();
        reg.register_with_callers(std::sync::Arc::new(EchoTool), [ToolCaller::Direct]);
        let engine = PermissionEngine::new(PermissionMode::Bypass);
        let auth = engine
            .authorize(
                &reg,
                None,
                &EventBus::default(),
                "agent",
                "call_1",
                "echo",
                json!({}),
                ToolCaller::CodeExecution,
            )
            .await;
        assert!(!auth.is_approved());
    }

    #[tokio::test]
    async fn default_mode_denies_without_approver() {
        let engine = PermissionEngine::new(PermissionMode::Default)
            .with_ask_timeout(Duration::from_millis(50));
        let auth = authorize_with(&engine, &EventBus::default()).await;
        assert!(!auth.is_approved());
    }

    #[tokio::test]
    async fn default_mode_honors_approval() {
        let engine = std::sync::Arc::new(
            PermissionEngine::new(PermissionMode::Default)
                .with_ask_timeout(Duration::from_secs(5)),
        );
        let bus = EventBus::default();
        let mut control = bus.subscribe(SubscribeOptions {
            filter: crate::event::SubscriptionFilter::channels([Channel::Control]),
            drop_policy: Some(crate::event::DropPolicy::Block),
            ..SubscribeOptions::all()
        });

        let approver_engine = std::sync::Arc::clone(&engine);
        let approver = tokio::spawn(async move {
            let request = control.recv().await.unwrap();
            let request_id = request.payload["request_id"].as_str().unwrap().to_string();
            assert!(approver_engine.broker().resolve(&request_id, true));
        });

        let auth = authorize_with(&engine, &bus).await;
        assert!(auth.is_approved());
        approver.await.unwrap();
    }

    #[tokio::test]
    async fn can_use_may_rewrite_input() {
        struct Rewriter;

        #[async_trait]
        impl CanUseTool for Rewriter {
            async fn can_use(
                &self,
                _name: &str,
                input: &Value,
                _caller: ToolCaller,
            ) -> CanUseDecision {
                let mut rewritten = input.clone();
                rewritten["message"] = json!("rewritten");
                CanUseDecision::AllowRewritten(rewritten)
            }
        }

        let engine = PermissionEngine::new(PermissionMode::Bypass).with_can_use(Box::new(Rewriter));
        match authorize_with(&engine, &EventBus::default()).await {
            Authorization::Approved { input } => assert_eq!(input["message"], "rewritten"),
            other => panic!("expected approval, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_unknown_request_is_false() {
        let broker = ApprovalBroker::new();
        assert!(!broker.resolve("nope", true));
    }
}
