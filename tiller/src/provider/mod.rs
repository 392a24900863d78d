//! Provider abstraction for LLM backends.
//!
//! This module provides:
//! - [`ChatRequest`] / [`Completion`]: the uniform request/response contract
//! - [`StreamChunk`]: the tagged chunk variants of a streaming response
//! - [`Provider`]: the pluggable backend trait
//! - [`ChunkAggregator`]: rebuilds a complete assistant message from chunks
//! - [`RetryPolicy`] / [`with_retry`]: transient-failure recovery with
//!   exponential backoff and jitter

mod mock;
mod registry;

pub use mock::{MockProvider, MockTurn};
pub use registry::{ExecutionMode, ModelConfig, ProviderFactory, ProviderRegistry};

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::message::{ContentBlock, Message};
use crate::stream::Reader;
use crate::tool::{ToolCaller, ToolSpec};
use crate::usage::TokenUsage;

/// Reason why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum StopReason {
    /// Natural stop.
    #[default]
    EndTurn,
    /// The model requested tool invocations.
    ToolUse,
    /// Maximum token limit reached.
    MaxTokens,
    /// Content was filtered.
    ContentFilter,
}

impl StopReason {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::ContentFilter => "content_filter",
        }
    }
}

/// A chunk of a streaming model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StreamChunk {
    /// Incremental assistant text.
    TextDelta {
        /// The text delta.
        text: String,
    },
    /// Incremental model reasoning.
    ThinkingDelta {
        /// The reasoning delta.
        text: String,
    },
    /// Start of a tool-use block.
    ToolUseStart {
        /// Position of this tool use in the response.
        index: usize,
        /// Call identifier.
        id: String,
        /// Tool name.
        name: String,
    },
    /// Partial JSON input for an in-progress tool use.
    ToolUseInputDelta {
        /// Position of the tool use being extended.
        index: usize,
        /// Partial JSON input.
        partial_json: String,
    },
    /// The tool-use block at `index` is complete.
    ToolUseStop {
        /// Position of the completed tool use.
        index: usize,
    },
    /// Token usage for the response.
    Usage {
        /// The usage record.
        usage: TokenUsage,
    },
    /// The stream is complete.
    Finish {
        /// Why the model stopped.
        stop_reason: StopReason,
    },
}

/// Declared capabilities of a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Supports [`Provider::stream`].
    pub streaming: bool,
    /// Supports tool definitions.
    pub tools: bool,
    /// Supports a separately settable system prompt.
    pub system_prompt: bool,
    /// Supports image inputs.
    pub vision: bool,
}

/// A chat completion request.
///
/// The system prompt is a separately settable field, not inlined in
/// `messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// System instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Conversation messages.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Tools the model may call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Per-call deadline.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ChatRequest {
    /// Create a request from messages.
    #[must_use]
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Set the system prompt.
    #[must_use]
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set the available tools.
    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }
}

/// A complete (non-streaming) model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// The assistant message.
    pub message: Message,
    /// Why the model stopped.
    pub stop_reason: StopReason,
    /// Token usage, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl Completion {
    /// Concatenated text content of the assistant message.
    #[must_use]
    pub fn text(&self) -> String {
        self.message.text()
    }

    /// Tool-use blocks in emission order.
    #[must_use]
    pub fn tool_uses(&self) -> Vec<&ContentBlock> {
        self.message.tool_uses().collect()
    }
}

/// Errors from a provider backend.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// Rate limit, network failure, or 5xx: retried with backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Bad request, auth failure, or 4xx: surfaced immediately.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// The stream ended in the middle of a tool-use block. The turn's
    /// assistant message is discarded and the turn fails.
    #[error("stream truncated mid tool-use: {0}")]
    TruncatedStream(String),
}

impl ProviderError {
    /// Returns `true` if the error should be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The pluggable LLM backend contract.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider identifier (also the env-var prefix for API keys).
    fn id(&self) -> &str;

    /// Declared capabilities.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Execute a non-streaming completion.
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, ProviderError>;

    /// Execute a streaming completion, returning a lazy chunk sequence.
    async fn stream(&self, request: &ChatRequest) -> Result<Reader<StreamChunk>, ProviderError>;
}

// ---------------------------------------------------------------------------
// Chunk aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct ToolUseBuilder {
    id: String,
    name: String,
    partial_json: String,
    complete: bool,
}

/// Rebuilds a [`Completion`] from a consumed chunk stream.
#[derive(Debug, Clone, Default)]
pub struct ChunkAggregator {
    text: String,
    thinking: String,
    tool_uses: BTreeMap<usize, ToolUseBuilder>,
    usage: Option<TokenUsage>,
    stop_reason: Option<StopReason>,
}

impl ChunkAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk.
    pub fn apply(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::TextDelta { text } => self.text.push_str(text),
            StreamChunk::ThinkingDelta { text } => self.thinking.push_str(text),
            StreamChunk::ToolUseStart { index, id, name } => {
                self.tool_uses.insert(
                    *index,
                    ToolUseBuilder {
                        id: id.clone(),
                        name: name.clone(),
                        partial_json: String::new(),
                        complete: false,
                    },
                );
            }
            StreamChunk::ToolUseInputDelta {
                index,
                partial_json,
            } => {
                if let Some(builder) = self.tool_uses.get_mut(index) {
                    builder.partial_json.push_str(partial_json);
                }
            }
            StreamChunk::ToolUseStop { index } => {
                if let Some(builder) = self.tool_uses.get_mut(index) {
                    builder.complete = true;
                }
            }
            StreamChunk::Usage { usage } => self.usage = Some(*usage),
            StreamChunk::Finish { stop_reason } => self.stop_reason = Some(*stop_reason),
        }
    }

    /// Returns `true` if any tool-use block has been started.
    #[must_use]
    pub fn has_tool_uses(&self) -> bool {
        !self.tool_uses.is_empty()
    }

    /// Build the final completion.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::TruncatedStream`] if a tool-use block was
    /// started but never completed, or its accumulated input is not valid
    /// JSON. A partial tool call must fail the whole turn.
    pub fn into_completion(self) -> Result<Completion, ProviderError> {
        let mut blocks = Vec::new();
        if !self.thinking.is_empty() {
            blocks.push(ContentBlock::thinking(self.thinking));
        }
        if !self.text.is_empty() {
            blocks.push(ContentBlock::text(self.text));
        }

        let has_tools = !self.tool_uses.is_empty();
        for (index, builder) in self.tool_uses {
            if !builder.complete {
                return Err(ProviderError::TruncatedStream(format!(
                    "tool-use block {index} ('{}') never completed",
                    builder.name
                )));
            }
            let input: Value = if builder.partial_json.is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(&builder.partial_json).map_err(|e| {
                    ProviderError::TruncatedStream(format!(
                        "tool-use block {index} ('{}') carries invalid JSON input: {e}",
                        builder.name
                    ))
                })?
            };
            blocks.push(ContentBlock::tool_use(
                builder.id,
                builder.name,
                input,
                ToolCaller::Direct,
            ));
        }

        let stop_reason = self.stop_reason.unwrap_or(if has_tools {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });

        Ok(Completion {
            message: Message::new(crate::message::Role::Assistant, blocks),
            stop_reason,
            usage: self.usage,
        })
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Backoff configuration for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Jittered exponential delay for the given retry (0-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(retry))
            .min(self.max_delay);
        // Full jitter keeps concurrent retries from stampeding.
        exp.mul_f64(0.5 + fastrand::f64() / 2.0)
    }
}

/// Run `op`, retrying transient failures per `policy`. Permanent errors
/// surface immediately; transient errors surface after the retry cap.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                warn!(error = %err, retry, delay_ms = delay.as_millis() as u64, "retrying provider call");
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(err) => {
                debug!(error = %err, attempts = retry + 1, "provider call failed");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    mod aggregator {
        use super::*;

        #[test]
        fn text_accumulates() {
            let mut agg = ChunkAggregator::new();
            agg.apply(&StreamChunk::TextDelta { text: "The ".into() });
            agg.apply(&StreamChunk::TextDelta {
                text: "answer".into(),
            });
            agg.apply(&StreamChunk::Finish {
                stop_reason: StopReason::EndTurn,
            });
            let completion = agg.into_completion().unwrap();
            assert_eq!(completion.text(), "The answer");
            assert_eq!(completion.stop_reason, StopReason::EndTurn);
        }

        #[test]
        fn tool_use_rebuilt_from_deltas() {
            let mut agg = ChunkAggregator::new();
            agg.apply(&StreamChunk::ToolUseStart {
                index: 0,
                id: "call_1".into(),
                name: "read_file".into(),
            });
            agg.apply(&StreamChunk::ToolUseInputDelta {
                index: 0,
                partial_json: r#"{"path":"#.into(),
            });
            agg.apply(&StreamChunk::ToolUseInputDelta {
                index: 0,
                partial_json: r#""/tmp/a.txt"}"#.into(),
            });
            agg.apply(&StreamChunk::ToolUseStop { index: 0 });

            let completion = agg.into_completion().unwrap();
            let uses = completion.tool_uses();
            assert_eq!(uses.len(), 1);
            match uses[0] {
                ContentBlock::ToolUse { id, name, input, .. } => {
                    assert_eq!(id, "call_1");
                    assert_eq!(name, "read_file");
                    assert_eq!(input, &json!({"path": "/tmp/a.txt"}));
                }
                other => panic!("unexpected block: {other:?}"),
            }
            assert_eq!(completion.stop_reason, StopReason::ToolUse);
        }

        #[test]
        fn multiple_tool_uses_keep_index_order() {
            let mut agg = ChunkAggregator::new();
            for (index, name) in [(1_usize, "b"), (0, "a"), (2, "c")] {
                agg.apply(&StreamChunk::ToolUseStart {
                    index,
                    id: format!("call_{name}"),
                    name: name.into(),
                });
                agg.apply(&StreamChunk::ToolUseStop { index });
            }
            let completion = agg.into_completion().unwrap();
            let names: Vec<String> = completion
                .tool_uses()
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { name, .. } => Some(name.clone()),
                    _ => None,
                })
                .collect();
            assert_eq!(names, vec!["a", "b", "c"]);
        }

        #[test]
        fn truncated_tool_use_is_fatal() {
            let mut agg = ChunkAggregator::new();
            agg.apply(&StreamChunk::ToolUseStart {
                index: 0,
                id: "call_1".into(),
                name: "bash".into(),
            });
            // No ToolUseStop: the stream died mid-block.
            let err = agg.into_completion().unwrap_err();
            assert!(matches!(err, ProviderError::TruncatedStream(_)));
        }

        #[test]
        fn invalid_tool_json_is_fatal() {
            let mut agg = ChunkAggregator::new();
            agg.apply(&StreamChunk::ToolUseStart {
                index: 0,
                id: "call_1".into(),
                name: "bash".into(),
            });
            agg.apply(&StreamChunk::ToolUseInputDelta {
                index: 0,
                partial_json: r#"{"cmd": "#.into(),
            });
            agg.apply(&StreamChunk::ToolUseStop { index: 0 });
            assert!(agg.into_completion().is_err());
        }

        #[test]
        fn empty_input_defaults_to_object() {
            let mut agg = ChunkAggregator::new();
            agg.apply(&StreamChunk::ToolUseStart {
                index: 0,
                id: "c".into(),
                name: "ping".into(),
            });
            agg.apply(&StreamChunk::ToolUseStop { index: 0 });
            let completion = agg.into_completion().unwrap();
            match completion.tool_uses()[0] {
                ContentBlock::ToolUse { input, .. } => assert_eq!(input, &json!({})),
                other => panic!("unexpected block: {other:?}"),
            }
        }

        #[test]
        fn usage_and_thinking_captured() {
            let mut agg = ChunkAggregator::new();
            agg.apply(&StreamChunk::ThinkingDelta {
                text: "mull ".into(),
            });
            agg.apply(&StreamChunk::ThinkingDelta { text: "it".into() });
            agg.apply(&StreamChunk::TextDelta { text: "4".into() });
            agg.apply(&StreamChunk::Usage {
                usage: TokenUsage::new(10, 2),
            });
            let completion = agg.into_completion().unwrap();
            assert_eq!(completion.usage, Some(TokenUsage::new(10, 2)));
            assert!(matches!(
                completion.message.content[0],
                ContentBlock::Thinking { .. }
            ));
        }
    }

    mod retry {
        use super::*;
        use std::sync::atomic::{AtomicU32, Ordering};

        #[tokio::test]
        async fn transient_errors_are_retried() {
            let attempts = AtomicU32::new(0);
            let result = with_retry(
                RetryPolicy {
                    max_retries: 3,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
                || {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ProviderError::Transient("rate limit".into()))
                        } else {
                            Ok(42)
                        }
                    }
                },
            )
            .await;
            assert_eq!(result.unwrap(), 42);
            assert_eq!(attempts.load(Ordering::SeqCst), 3);
        }

        #[tokio::test]
        async fn permanent_errors_surface_immediately() {
            let attempts = AtomicU32::new(0);
            let result: Result<(), _> = with_retry(RetryPolicy::default(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Permanent("bad request".into())) }
            })
            .await;
            assert!(result.is_err());
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn retry_cap_is_respected() {
            let attempts = AtomicU32::new(0);
            let policy = RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            };
            let result: Result<(), _> = with_retry(policy, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Transient("still down".into())) }
            })
            .await;
            assert!(result.unwrap_err().is_transient());
            assert_eq!(attempts.load(Ordering::SeqCst), 3);
        }

        #[test]
        fn delay_grows_and_is_bounded() {
            let policy = RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(400),
            };
            for retry in 0..5 {
                let delay = policy.delay_for(retry);
                assert!(delay <= Duration::from_millis(400));
                assert!(delay >= Duration::from_millis(50));
            }
        }
    }
}
