//! Conversation compression.
//!
//! Invoked when the estimated token usage of a request exceeds
//! `token_budget * threshold`. Strategies are applied in order until the
//! request fits the budget:
//!
//! 1. hide tool-result content (metadata-visibility) in the oldest
//!    10% → 20% → 50% → 100% of eligible messages
//! 2. remove tool-result blocks entirely in the same windows
//! 3. replace the oldest contiguous prefix with a single summary
//!    message, LLM-generated when configured, rule-based otherwise
//!
//! The system message and the last `messages_to_keep` messages are never
//! touched.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Middleware, ModelNext};
use crate::error::Result;
use crate::message::{ContentBlock, Message, MessageMetadata, Role};
use crate::provider::{ChatRequest, Completion, Provider};

const HIDDEN_MARKER: &str = "[tool result hidden]";
const WINDOWS: [f64; 4] = [0.10, 0.20, 0.50, 1.00];

/// Tunables for the compression pass.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Target request size in estimated tokens.
    pub token_budget: usize,
    /// Compression triggers above `token_budget * threshold`.
    pub threshold: f64,
    /// Newest messages that are never modified.
    pub messages_to_keep: usize,
    /// Whether strategy 1 (visibility hiding) is used.
    pub use_metadata_visibility: bool,
    /// Whether strategy 3 asks the model for the summary.
    pub use_llm_summarizer: bool,
    /// Summary language.
    pub language: String,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            token_budget: 8192,
            threshold: 0.8,
            messages_to_keep: 4,
            use_metadata_visibility: true,
            use_llm_summarizer: false,
            language: "en".into(),
        }
    }
}

fn estimate_text(text: &str) -> usize {
    text.chars().count() / 4 + 1
}

fn estimate_value(value: &Value) -> usize {
    estimate_text(&value.to_string())
}

fn estimate_message(message: &Message) -> usize {
    message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } | ContentBlock::Thinking { text } => estimate_text(text),
            ContentBlock::ToolUse { input, .. } => estimate_value(input) + 8,
            ContentBlock::ToolResult { output, .. } => estimate_value(output) + 8,
        })
        .sum()
}

/// Rough token estimate of a full request.
#[must_use]
pub fn estimate_request_tokens(request: &ChatRequest) -> usize {
    let system = request.system.as_deref().map_or(0, estimate_text);
    system + request.messages.iter().map(estimate_message).sum::<usize>()
}

/// The compression middleware.
pub struct Summarizer {
    config: CompressionConfig,
    llm: Option<Arc<dyn Provider>>,
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("config", &self.config)
            .field("has_llm", &self.llm.is_some())
            .finish()
    }
}

impl Summarizer {
    /// Create a summarizer with the given tunables.
    #[must_use]
    pub fn new(config: CompressionConfig) -> Self {
        Self { config, llm: None }
    }

    /// Provide the model used when `use_llm_summarizer` is set.
    #[must_use]
    pub fn with_llm(mut self, provider: Arc<dyn Provider>) -> Self {
        self.llm = Some(provider);
        self
    }

    /// Index range of messages eligible for compression: everything
    /// except system messages and the protected tail.
    fn eligible_indices(&self, messages: &[Message]) -> Vec<usize> {
        let protected_from = messages.len().saturating_sub(self.config.messages_to_keep);
        (0..protected_from)
            .filter(|&i| messages[i].role != Role::System)
            .collect()
    }

    /// Strategy 1: hide tool-result content behind a marker, tagging the
    /// message so the hiding is recoverable from session history.
    fn hide_tool_results(messages: &mut [Message], indices: &[usize]) -> bool {
        let mut changed = false;
        for &i in indices {
            let message = &mut messages[i];
            let mut touched = false;
            let content = message
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::ToolResult {
                        call_id,
                        output,
                        is_error,
                    } if output.as_str() != Some(HIDDEN_MARKER) => {
                        touched = true;
                        ContentBlock::tool_result(
                            call_id.clone(),
                            Value::String(HIDDEN_MARKER.into()),
                            *is_error,
                        )
                    }
                    other => other.clone(),
                })
                .collect();
            if touched {
                let mut metadata = message.metadata.clone().unwrap_or_default();
                metadata.source = Some("compression".into());
                *message = Message::new(message.role, content).with_metadata(metadata);
                changed = true;
            }
        }
        changed
    }

    /// Strategy 2: drop tool-result blocks entirely.
    fn remove_tool_results(messages: &mut Vec<Message>, indices: &[usize]) -> bool {
        let mut changed = false;
        for &i in indices {
            let message = &mut messages[i];
            let before = message.content.len();
            let content: Vec<ContentBlock> = message
                .content
                .iter()
                .filter(|block| !block.is_tool_result())
                .cloned()
                .collect();
            if content.len() != before {
                *message = Message::new(message.role, content);
                changed = true;
            }
        }
        // Messages emptied by the removal carry no information.
        let before = messages.len();
        messages.retain(|m| !m.content.is_empty());
        changed || messages.len() != before
    }

    /// Strategy 3: replace the eligible prefix with one summary message.
    async fn summarize_prefix(&self, messages: &mut Vec<Message>) {
        let indices = self.eligible_indices(messages);
        if indices.is_empty() {
            return;
        }

        let prefix: Vec<Message> = indices.iter().map(|&i| messages[i].clone()).collect();
        let summary_text = match (&self.llm, self.config.use_llm_summarizer) {
            (Some(provider), true) => match self.llm_summary(provider.as_ref(), &prefix).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "llm summary failed; falling back to rule-based");
                    Self::rule_based_summary(&prefix)
                }
            },
            _ => Self::rule_based_summary(&prefix),
        };

        let summary = Message::user(format!("[previous conversation summary]\n{summary_text}"))
            .with_metadata(MessageMetadata {
                source: Some("compression".into()),
                ..MessageMetadata::default()
            });

        // Keep system messages and everything after the summarized prefix.
        let mut compressed = Vec::with_capacity(messages.len());
        let mut summary_inserted = false;
        for (i, message) in messages.drain(..).enumerate() {
            if indices.contains(&i) {
                if !summary_inserted {
                    compressed.push(summary.clone());
                    summary_inserted = true;
                }
            } else {
                compressed.push(message);
            }
        }
        *messages = compressed;
    }

    async fn llm_summary(&self, provider: &dyn Provider, prefix: &[Message]) -> Result<String> {
        let transcript: String = prefix
            .iter()
            .map(|m| format!("{}: {}\n", m.role.as_str(), m.text()))
            .collect();
        let request = ChatRequest::with_messages(vec![Message::user(format!(
            "Summarize this conversation in {} in a few sentences, keeping decisions and open items:\n\n{transcript}",
            self.config.language
        ))]);
        let completion: Completion = provider
            .complete(&request)
            .await
            .map_err(|e| crate::error::Error::Provider(e.to_string()))?;
        Ok(completion.text())
    }

    fn rule_based_summary(prefix: &[Message]) -> String {
        prefix
            .iter()
            .filter(|m| !m.text().is_empty())
            .map(|m| {
                let text = m.text();
                let head: String = text.chars().take(80).collect();
                format!("- {}: {head}", m.role.as_str())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Middleware for Summarizer {
    fn name(&self) -> &str {
        "summarizer"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn wrap_model_call(
        &self,
        mut request: ChatRequest,
        next: ModelNext<'_>,
    ) -> Result<Completion> {
        let trigger = (self.config.token_budget as f64 * self.config.threshold) as usize;
        let estimated = estimate_request_tokens(&request);
        if estimated <= trigger {
            return next.run(request).await;
        }
        debug!(estimated, trigger, "compression triggered");

        let budget = self.config.token_budget;
        let eligible = self.eligible_indices(&request.messages);

        // Strategy 1: visibility hiding over growing windows.
        if self.config.use_metadata_visibility {
            for window in WINDOWS {
                let count = ((eligible.len() as f64) * window).ceil() as usize;
                if Self::hide_tool_results(&mut request.messages, &eligible[..count.min(eligible.len())])
                    && estimate_request_tokens(&request) <= budget
                {
                    return next.run(request).await;
                }
            }
        }

        // Strategy 2: hard removal over the same windows.
        for window in WINDOWS {
            let eligible = self.eligible_indices(&request.messages);
            let count = ((eligible.len() as f64) * window).ceil() as usize;
            if Self::remove_tool_results(&mut request.messages, &eligible[..count.min(eligible.len())])
                && estimate_request_tokens(&request) <= budget
            {
                return next.run(request).await;
            }
        }

        // Strategy 3: summarize the remaining prefix.
        if estimate_request_tokens(&request) > budget {
            self.summarize_prefix(&mut request.messages).await;
        }

        next.run(request).await
    }
}
