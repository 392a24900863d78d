//! Message types for agent-model communication.
//!
//! A [`Message`] is an ordered sequence of content blocks. Messages are
//! immutable once emitted: the agent loop and the compression middleware
//! always build new messages instead of mutating history in place.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool::ToolCaller;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool result carrier.
    Tool,
}

impl Role {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One element of a message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ContentBlock {
    /// Plain text content.
    Text {
        /// The text content.
        text: String,
    },

    /// A model-requested tool invocation.
    ToolUse {
        /// Unique identifier of the call, paired with a later tool result.
        id: String,
        /// Name of the tool.
        name: String,
        /// Structured input for the tool.
        input: Value,
        /// Origin of the invocation.
        caller: ToolCaller,
    },

    /// The outcome of a tool invocation.
    ToolResult {
        /// The `ToolUse` id this result answers.
        call_id: String,
        /// Tool output, or an error description when `is_error` is set.
        output: Value,
        /// Whether the tool failed.
        is_error: bool,
    },

    /// Model reasoning content.
    Thinking {
        /// The reasoning text.
        text: String,
    },
}

impl ContentBlock {
    /// Create a text block.
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a tool-use block.
    #[must_use]
    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
        caller: ToolCaller,
    ) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
            caller,
        }
    }

    /// Create a tool-result block.
    #[must_use]
    pub fn tool_result(call_id: impl Into<String>, output: Value, is_error: bool) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            output,
            is_error,
        }
    }

    /// Create a thinking block.
    #[inline]
    #[must_use]
    pub fn thinking(text: impl Into<String>) -> Self {
        Self::Thinking { text: text.into() }
    }

    /// Returns the text if this is a text block.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Returns `true` if this is a tool-use block.
    #[must_use]
    pub const fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }

    /// Returns `true` if this is a tool-result block.
    #[must_use]
    pub const fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }
}

/// Controls which audiences see a message during window filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Whether UI consumers see the message.
    pub user_visible: bool,
    /// Whether the message is included in the model's conversation window.
    pub agent_visible: bool,
    /// Free-form origin label (`"compression"`, `"injection"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Routing tags.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            user_visible: true,
            agent_visible: true,
            source: None,
            tags: BTreeSet::new(),
        }
    }
}

impl MessageMetadata {
    /// Metadata hiding the message from the model but not the user.
    #[must_use]
    pub fn agent_hidden() -> Self {
        Self {
            agent_visible: false,
            ..Self::default()
        }
    }
}

/// An immutable conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who authored the message.
    pub role: Role,
    /// Ordered content blocks.
    pub content: Vec<ContentBlock>,
    /// Optional audience metadata. Absent means fully visible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    /// Create a message from a role and blocks.
    #[must_use]
    pub const fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            metadata: None,
        }
    }

    /// Create a system message with a single text block.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::text(text)])
    }

    /// Create a user message with a single text block.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    /// Create an assistant message with a single text block.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    /// Create a user-role message carrying tool results.
    #[must_use]
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        debug_assert!(blocks.iter().all(ContentBlock::is_tool_result));
        Self::new(Role::User, blocks)
    }

    /// Attach metadata, consuming the message.
    #[must_use]
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Concatenated text of all text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Iterate over the tool-use blocks in emission order.
    pub fn tool_uses(&self) -> impl Iterator<Item = &ContentBlock> {
        self.content.iter().filter(|b| b.is_tool_use())
    }

    /// Returns `true` if the message belongs in the model's window.
    #[must_use]
    pub fn is_agent_visible(&self) -> bool {
        self.metadata.as_ref().is_none_or(|m| m.agent_visible)
    }

    /// Returns `true` if the message should be rendered to the user.
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        self.metadata.as_ref().is_none_or(|m| m.user_visible)
    }
}
