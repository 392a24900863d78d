//! Event envelopes and their typed payloads.
//!
//! The envelope JSON shape is a stable, cross-process contract:
//! `{"channel", "type", "timestamp", "seq", "agent_id", "payload"}`.
//! The payload variant set is closed and add-only; consumers must ignore
//! unknown types rather than fail, which is what [`EventEnvelope::decode`]
//! does by returning `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::usage::TokenUsage;

/// Delivery channel of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Low-latency stream for UI rendering; loss-tolerant.
    Progress,
    /// Human-in-the-loop approvals and interrupts; loss is unacceptable.
    Control,
    /// Governance and audit; retention-prioritized.
    Monitor,
}

impl Channel {
    /// Get the string representation of the channel.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Control => "control",
            Self::Monitor => "monitor",
        }
    }
}

/// Typed payload of an envelope.
///
/// Serialized with a `type` tag which the envelope lifts into its own
/// `type` field, keeping the wire payload tag-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum EventPayload {
    /// Incremental assistant text.
    TextChunk {
        /// The text delta.
        text: String,
    },
    /// Incremental model reasoning, delivered only to opted-in
    /// subscriptions.
    ThinkingChunk {
        /// The reasoning delta.
        text: String,
    },
    /// A tool execution started.
    ToolStart {
        /// Call identifier.
        call_id: String,
        /// Tool name.
        name: String,
    },
    /// Progress update from a long-running tool.
    ToolProgress {
        /// Call identifier.
        call_id: String,
        /// Tool name.
        name: String,
        /// Completion fraction in `[0, 1]`.
        progress: f64,
        /// Optional human-readable detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// A tool execution reached a terminal state.
    ToolEnd {
        /// Call identifier.
        call_id: String,
        /// Tool name.
        name: String,
        /// Tool output (or error description).
        output: Value,
        /// Whether the call failed.
        is_error: bool,
    },
    /// A tool call awaits human approval.
    ApprovalRequest {
        /// Correlates the eventual response.
        request_id: String,
        /// Call identifier.
        call_id: String,
        /// Tool name.
        name: String,
        /// Proposed tool input.
        input: Value,
    },
    /// Resolution of a pending approval.
    ApprovalResponse {
        /// The request being answered.
        request_id: String,
        /// Whether the call may proceed.
        approved: bool,
    },
    /// A user interrupt was requested.
    Interrupt {
        /// Why the run is being interrupted.
        reason: String,
    },
    /// Agent state machine transition.
    StateChanged {
        /// Previous state.
        from: String,
        /// New state.
        to: String,
    },
    /// An error surfaced to governance consumers.
    Error {
        /// Error description.
        message: String,
        /// Whether the agent terminated because of it.
        fatal: bool,
    },
    /// Token usage for one provider invocation.
    TokenUsage {
        /// The usage record.
        usage: TokenUsage,
    },
    /// Audit record for an authorization or sandbox decision.
    Audit {
        /// What was evaluated (tool or command name).
        subject: String,
        /// The decision taken.
        decision: String,
        /// Why.
        reason: String,
    },
}

impl EventPayload {
    /// The channel this payload travels on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self {
            Self::TextChunk { .. }
            | Self::ThinkingChunk { .. }
            | Self::ToolStart { .. }
            | Self::ToolProgress { .. }
            | Self::ToolEnd { .. } => Channel::Progress,
            Self::ApprovalRequest { .. } | Self::ApprovalResponse { .. } | Self::Interrupt { .. } => {
                Channel::Control
            }
            Self::StateChanged { .. }
            | Self::Error { .. }
            | Self::TokenUsage { .. }
            | Self::Audit { .. } => Channel::Monitor,
        }
    }

    /// The public event type name.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::TextChunk { .. } => "text-chunk",
            Self::ThinkingChunk { .. } => "thinking-chunk",
            Self::ToolStart { .. } => "tool-start",
            Self::ToolProgress { .. } => "tool-progress",
            Self::ToolEnd { .. } => "tool-end",
            Self::ApprovalRequest { .. } => "approval-request",
            Self::ApprovalResponse { .. } => "approval-response",
            Self::Interrupt { .. } => "interrupt",
            Self::StateChanged { .. } => "state-changed",
            Self::Error { .. } => "error",
            Self::TokenUsage { .. } => "token-usage",
            Self::Audit { .. } => "audit",
        }
    }
}

/// A typed event with routing metadata; the unit of fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Delivery channel.
    pub channel: Channel,
    /// Event type name (kebab-case, part of the public contract).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Publication time (RFC 3339 on the wire).
    pub timestamp: DateTime<Utc>,
    /// Monotonic sequence number assigned by the bus.
    pub seq: i64,
    /// Publishing agent.
    pub agent_id: String,
    /// Tag-free payload object.
    pub payload: Value,
}

impl EventEnvelope {
    /// Build an envelope from a typed payload, lifting the serde tag out
    /// of the payload object.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, seq: i64, payload: &EventPayload) -> Self {
        let mut value = serde_json::to_value(payload).unwrap_or_else(|_| Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("type");
        }
        Self {
            channel: payload.channel(),
            event_type: payload.event_type().to_string(),
            timestamp: Utc::now(),
            seq,
            agent_id: agent_id.into(),
            payload: value,
        }
    }

    /// Decode the typed payload. Returns `None` for unknown event types,
    /// so forward-compatible consumers can skip rather than fail.
    #[must_use]
    pub fn decode(&self) -> Option<EventPayload> {
        let mut value = self.payload.clone();
        if let Some(map) = value.as_object_mut() {
            map.insert("type".to_string(), Value::String(self.event_type.clone()));
        }
        serde_json::from_value(value).ok()
    }

    /// Tags carried inside the payload, if any. Used by tag filters.
    #[must_use]
    pub fn payload_tags(&self) -> Vec<&str> {
        self.payload
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}
