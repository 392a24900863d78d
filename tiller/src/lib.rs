#![cfg_attr(docsrs, feature(doc_cfg))]
//! Tiller is an async runtime for stateful, tool-using AI agents.
//!
//! The core is a multi-step reason-act loop that streams partial model
//! output, dispatches tool calls to sandboxed executors under
//! concurrency limits with pause/resume and cancellation, fans events
//! out over three typed channels, and passes every request through a
//! priority-ordered middleware onion. Around it sit the tool runtime,
//! the event bus, the streaming primitives, provider and sandbox
//! abstractions, event-sourced sessions, and working/semantic memory.
//!
//! # Example
//!
//! ```rust,ignore
//! use tiller::prelude::*;
//!
//! let agent = Agent::builder()
//!     .provider(provider)
//!     .tool(ReadFileTool)
//!     .permission_mode(PermissionMode::SmartApprove)
//!     .build()?;
//!
//! let mut events = agent.chat_stream("read /tmp/a.txt");
//! while let Some(Ok(envelope)) = events.next().await {
//!     println!("{}: {}", envelope.channel.as_str(), envelope.event_type);
//! }
//! ```

// Core modules
pub mod config;
pub mod control;
pub mod error;
pub mod message;
pub mod stream;
pub mod template;
pub mod usage;

// Agent and tools
pub mod agent;
pub mod permission;
pub mod tool;

// Surrounding subsystems
pub mod event;
pub mod memory;
pub mod middleware;
pub mod provider;
pub mod sandbox;
pub mod session;

pub mod prelude;

// Re-export commonly used types
pub use agent::{Agent, AgentBuilder, AgentConfig, AgentState, TurnResult, TurnStopReason};
pub use error::{Error, Result};
pub use event::{Channel, EventBus, EventEnvelope, EventPayload};
pub use message::{ContentBlock, Message, Role};
