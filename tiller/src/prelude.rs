//! Convenience re-exports for the common case.

pub use crate::agent::{Agent, AgentBuilder, AgentConfig, AgentState, AgentStatus, TurnResult, TurnStopReason};
pub use crate::config::{LogConfig, RuntimeConfig, init_tracing};
pub use crate::control::CancelToken;
pub use crate::error::{Error, Result};
pub use crate::event::{
    Channel, DropPolicy, EventBus, EventEnvelope, EventPayload, SubscribeOptions, Subscription,
    SubscriptionFilter,
};
pub use crate::memory::{SemanticEntry, SemanticMemory, WorkingMemory};
pub use crate::message::{ContentBlock, Message, MessageMetadata, Role};
pub use crate::middleware::{Middleware, MiddlewareChain, Summarizer};
pub use crate::permission::{CanUseDecision, CanUseTool, PermissionMode};
pub use crate::provider::{
    ChatRequest, Completion, ModelConfig, Provider, ProviderRegistry, StreamChunk,
};
pub use crate::sandbox::{ExecRequest, Sandbox, SandboxConfig, SecurityLevel};
pub use crate::session::{SessionEvent, SessionStore};
pub use crate::template::{TemplateRegistry, TemplateVars};
pub use crate::tool::{
    CallState, RiskLevel, Tool, ToolAnnotations, ToolCall, ToolCaller, ToolContext, ToolError,
    ToolRegistry,
};
pub use crate::usage::TokenUsage;
