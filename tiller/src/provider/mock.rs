//! Scripted provider for testing.
//!
//! Returns predefined chunk sequences in order, one per invocation.
//! Useful for exercising the agent loop without a real backend.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    ChatRequest, ChunkAggregator, Completion, Provider, ProviderCapabilities, ProviderError,
    StopReason, StreamChunk,
};
use crate::stream::{self, Reader};

/// One scripted provider invocation.
#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Stream these chunks.
    Chunks(Vec<StreamChunk>),
    /// Fail the invocation with this error.
    Error(ProviderError),
}

/// A provider that replays scripted turns.
///
/// Each call to [`Provider::stream`] or [`Provider::complete`] consumes
/// the next turn. Calls past the script return a permanent error.
#[derive(Debug)]
pub struct MockProvider {
    turns: Mutex<Vec<MockTurn>>,
    cursor: AtomicUsize,
    capabilities: ProviderCapabilities,
}

impl MockProvider {
    /// Create a provider from explicit turns.
    #[must_use]
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Mutex::new(turns),
            cursor: AtomicUsize::new(0),
            capabilities: ProviderCapabilities {
                streaming: true,
                tools: true,
                system_prompt: true,
                vision: false,
            },
        }
    }

    /// A provider whose every turn is a single text response.
    #[must_use]
    pub fn text_turns<S: Into<String>>(texts: Vec<S>) -> Self {
        let turns = texts
            .into_iter()
            .map(|text| {
                MockTurn::Chunks(vec![
                    StreamChunk::TextDelta { text: text.into() },
                    StreamChunk::Finish {
                        stop_reason: StopReason::EndTurn,
                    },
                ])
            })
            .collect();
        Self::new(turns)
    }

    /// Append a turn that emits tool uses (id, name, input) and stops.
    #[must_use]
    pub fn push_tool_turn(self, uses: Vec<(&str, &str, Value)>) -> Self {
        let mut chunks = Vec::new();
        for (index, (id, name, input)) in uses.into_iter().enumerate() {
            chunks.push(StreamChunk::ToolUseStart {
                index,
                id: id.into(),
                name: name.into(),
            });
            chunks.push(StreamChunk::ToolUseInputDelta {
                index,
                partial_json: input.to_string(),
            });
            chunks.push(StreamChunk::ToolUseStop { index });
        }
        chunks.push(StreamChunk::Finish {
            stop_reason: StopReason::ToolUse,
        });
        self.push_turn(MockTurn::Chunks(chunks))
    }

    /// Append a turn that emits a single text chunk and stops.
    #[must_use]
    pub fn push_text_turn(self, text: impl Into<String>) -> Self {
        self.push_turn(MockTurn::Chunks(vec![
            StreamChunk::TextDelta { text: text.into() },
            StreamChunk::Finish {
                stop_reason: StopReason::EndTurn,
            },
        ]))
    }

    /// Append an explicit turn.
    #[must_use]
    pub fn push_turn(self, turn: MockTurn) -> Self {
        self.turns.lock().expect("mock turns poisoned").push(turn);
        self
    }

    /// Number of invocations made so far.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    fn next_turn(&self) -> Result<Vec<StreamChunk>, ProviderError> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let turns = self.turns.lock().expect("mock turns poisoned");
        match turns.get(index) {
            Some(MockTurn::Chunks(chunks)) => Ok(chunks.clone()),
            Some(MockTurn::Error(err)) => Err(err.clone()),
            None => Err(ProviderError::Permanent(format!(
                "mock script exhausted after {index} turn(s)"
            ))),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<Completion, ProviderError> {
        let chunks = self.next_turn()?;
        let mut aggregator = ChunkAggregator::new();
        for chunk in &chunks {
            aggregator.apply(chunk);
        }
        aggregator.into_completion()
    }

    async fn stream(&self, _request: &ChatRequest) -> Result<Reader<StreamChunk>, ProviderError> {
        let chunks = self.next_turn()?;
        Ok(stream::from_iter(chunks))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn turns_are_consumed_in_order() {
        let provider = MockProvider::text_turns(vec!["first", "second"]);
        let request = ChatRequest::default();

        let first = provider.complete(&request).await.unwrap();
        assert_eq!(first.text(), "first");
        let second = provider.complete(&request).await.unwrap();
        assert_eq!(second.text(), "second");

        // Past the script.
        assert!(provider.complete(&request).await.is_err());
        assert_eq!(provider.invocations(), 3);
    }

    #[tokio::test]
    async fn stream_yields_scripted_chunks() {
        let provider = MockProvider::text_turns(vec!["hello"]);
        let mut reader = provider.stream(&ChatRequest::default()).await.unwrap();

        let first = reader.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamChunk::TextDelta { text } if text == "hello"));
        let second = reader.next().await.unwrap().unwrap();
        assert!(matches!(second, StreamChunk::Finish { .. }));
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn error_turns_propagate() {
        let provider = MockProvider::new(vec![
            MockTurn::Error(ProviderError::Transient("rate limit".into())),
            MockTurn::Chunks(vec![
                StreamChunk::TextDelta { text: "ok".into() },
                StreamChunk::Finish {
                    stop_reason: StopReason::EndTurn,
                },
            ]),
        ]);
        let request = ChatRequest::default();

        let err = provider.stream(&request).await.unwrap_err();
        assert!(err.is_transient());

        // The retry consumes the next scripted turn.
        let completion = provider.complete(&request).await.unwrap();
        assert_eq!(completion.text(), "ok");
    }

    #[tokio::test]
    async fn tool_turn_builder() {
        let provider = MockProvider::new(Vec::new())
            .push_tool_turn(vec![("c1", "read_file", serde_json::json!({"path": "/a"}))]);
        let completion = provider.complete(&ChatRequest::default()).await.unwrap();
        assert_eq!(completion.tool_uses().len(), 1);
        assert_eq!(completion.stop_reason, StopReason::ToolUse);
    }
}
