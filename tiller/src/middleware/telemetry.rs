//! Telemetry: spans and counters around model and tool calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{Instrument, info_span};

use super::{Middleware, ModelNext, ToolInvocation, ToolNext, ToolOutcome};
use crate::error::Result;
use crate::provider::{ChatRequest, Completion};

/// Counters accumulated by [`TelemetryMiddleware`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Model invocations.
    pub model_calls: u64,
    /// Tool invocations.
    pub tool_calls: u64,
    /// Failed tool invocations.
    pub tool_errors: u64,
    /// Input tokens reported by providers.
    pub input_tokens: u64,
    /// Output tokens reported by providers.
    pub output_tokens: u64,
    /// Total time spent in model calls, in milliseconds.
    pub model_time_ms: u64,
}

/// The observability layer. Sits outermost so its spans cover the whole
/// onion.
#[derive(Debug, Default)]
pub struct TelemetryMiddleware {
    model_calls: AtomicU64,
    tool_calls: AtomicU64,
    tool_errors: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    model_time_ms: AtomicU64,
}

impl TelemetryMiddleware {
    /// Create a zeroed collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            model_calls: self.model_calls.load(Ordering::SeqCst),
            tool_calls: self.tool_calls.load(Ordering::SeqCst),
            tool_errors: self.tool_errors.load(Ordering::SeqCst),
            input_tokens: self.input_tokens.load(Ordering::SeqCst),
            output_tokens: self.output_tokens.load(Ordering::SeqCst),
            model_time_ms: self.model_time_ms.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl Middleware for TelemetryMiddleware {
    fn name(&self) -> &str {
        "telemetry"
    }

    fn priority(&self) -> i32 {
        1000
    }

    async fn wrap_model_call(
        &self,
        request: ChatRequest,
        next: ModelNext<'_>,
    ) -> Result<Completion> {
        let span = info_span!(
            "model_call",
            messages = request.messages.len(),
            tools = request.tools.len(),
            usage.input = tracing::field::Empty,
            usage.output = tracing::field::Empty,
        );
        let started = Instant::now();
        let response = next.run(request).instrument(span.clone()).await;
        self.model_calls.fetch_add(1, Ordering::SeqCst);
        self.model_time_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::SeqCst);

        if let Ok(completion) = &response {
            if let Some(usage) = completion.usage {
                self.input_tokens.fetch_add(usage.input_tokens, Ordering::SeqCst);
                self.output_tokens.fetch_add(usage.output_tokens, Ordering::SeqCst);
                span.record("usage.input", usage.input_tokens);
                span.record("usage.output", usage.output_tokens);
            }
        }
        response
    }

    async fn wrap_tool_call(&self, call: ToolInvocation, next: ToolNext<'_>) -> Result<ToolOutcome> {
        let span = info_span!(
            "tool_call",
            tool.name = %call.name,
            tool.call_id = %call.call_id,
            tool.success = tracing::field::Empty,
        );
        let outcome = next.run(call).instrument(span.clone()).await;
        self.tool_calls.fetch_add(1, Ordering::SeqCst);
        match &outcome {
            Ok(result) => {
                span.record("tool.success", !result.is_error);
                if result.is_error {
                    self.tool_errors.fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(_) => {
                span.record("tool.success", false);
                self.tool_errors.fetch_add(1, Ordering::SeqCst);
            }
        }
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::middleware::{MiddlewareChain, ModelTerminal, ToolTerminal};
    use crate::provider::StopReason;
    use crate::tool::ToolCaller;
    use crate::usage::TokenUsage;
    use std::sync::Arc;

    #[tokio::test]
    async fn counts_model_calls_and_tokens() {
        let telemetry = Arc::new(TelemetryMiddleware::new());
        let layer: Arc<dyn Middleware> = Arc::clone(&telemetry);
        let mut chain = MiddlewareChain::new();
        chain.push(layer);

        let terminal: ModelTerminal<'_> = &|_| {
            Box::pin(async {
                Ok(Completion {
                    message: Message::assistant("ok"),
                    stop_reason: StopReason::EndTurn,
                    usage: Some(TokenUsage::new(100, 25)),
                })
            })
        };
        chain.model_call(ChatRequest::default(), terminal).await.unwrap();
        chain.model_call(ChatRequest::default(), terminal).await.unwrap();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.model_calls, 2);
        assert_eq!(snapshot.input_tokens, 200);
        assert_eq!(snapshot.output_tokens, 50);
    }

    #[tokio::test]
    async fn counts_tool_errors() {
        let telemetry = Arc::new(TelemetryMiddleware::new());
        let layer: Arc<dyn Middleware> = Arc::clone(&telemetry);
        let mut chain = MiddlewareChain::new();
        chain.push(layer);

        let terminal: ToolTerminal<'_> = &|call| {
            Box::pin(async move {
                Ok(ToolOutcome {
                    output: serde_json::Value::Null,
                    is_error: call.name == "bad",
                })
            })
        };
        for name in ["good", "bad"] {
            chain
                .tool_call(
                    ToolInvocation {
                        call_id: "c".into(),
                        name: name.into(),
                        input: serde_json::json!({}),
                        caller: ToolCaller::Direct,
                    },
                    terminal,
                )
                .await
                .unwrap();
        }

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.tool_calls, 2);
        assert_eq!(snapshot.tool_errors, 1);
    }
}
