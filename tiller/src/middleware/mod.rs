//! The middleware onion.
//!
//! Middlewares compose cross-cutting concerns around model and tool
//! calls. Higher priority sits in the outer layer: it runs first on the
//! request and last on the response. Ties are broken by registration
//! order. A middleware must invoke `next` exactly once unless it
//! deliberately short-circuits, which counts as a full response.

mod fs_context;
mod redact;
mod summarizer;
mod telemetry;
mod working_memory;

pub use fs_context::FsContextPacker;
pub use redact::{PiiRedactor, RedactionRecord};
pub use summarizer::{CompressionConfig, Summarizer, estimate_request_tokens};
pub use telemetry::{TelemetryMiddleware, TelemetrySnapshot};
pub use working_memory::WorkingMemoryInjector;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::provider::{ChatRequest, Completion};
use crate::tool::ToolCaller;

/// A tool call as seen by the onion.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Call identifier.
    pub call_id: String,
    /// Tool name.
    pub name: String,
    /// Tool input; middlewares may transform it.
    pub input: Value,
    /// Origin of the call.
    pub caller: ToolCaller,
}

/// A tool result as seen by the onion.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Output or error description.
    pub output: Value,
    /// Whether the call failed.
    pub is_error: bool,
}

/// Innermost handler of a model call.
pub type ModelTerminal<'a> =
    &'a (dyn Fn(ChatRequest) -> BoxFuture<'a, Result<Completion>> + Send + Sync);

/// Innermost handler of a tool call.
pub type ToolTerminal<'a> =
    &'a (dyn Fn(ToolInvocation) -> BoxFuture<'a, Result<ToolOutcome>> + Send + Sync);

/// Continuation handed to [`Middleware::wrap_model_call`].
pub struct ModelNext<'a> {
    layers: &'a [Arc<dyn Middleware>],
    terminal: ModelTerminal<'a>,
}

impl<'a> ModelNext<'a> {
    /// Invoke the remaining layers and the provider.
    pub async fn run(self, request: ChatRequest) -> Result<Completion> {
        match self.layers.split_first() {
            Some((head, rest)) => {
                head.wrap_model_call(
                    request,
                    ModelNext {
                        layers: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => (self.terminal)(request).await,
        }
    }
}

/// Continuation handed to [`Middleware::wrap_tool_call`].
pub struct ToolNext<'a> {
    layers: &'a [Arc<dyn Middleware>],
    terminal: ToolTerminal<'a>,
}

impl<'a> ToolNext<'a> {
    /// Invoke the remaining layers and the tool runtime.
    pub async fn run(self, call: ToolInvocation) -> Result<ToolOutcome> {
        match self.layers.split_first() {
            Some((head, rest)) => {
                head.wrap_tool_call(
                    call,
                    ToolNext {
                        layers: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => (self.terminal)(call).await,
        }
    }
}

/// One layer of the onion. Both hooks default to pass-through.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Layer name, for logs.
    fn name(&self) -> &str;

    /// Ordering weight. Higher runs outermost.
    fn priority(&self) -> i32 {
        0
    }

    /// Intercept a model call.
    async fn wrap_model_call(
        &self,
        request: ChatRequest,
        next: ModelNext<'_>,
    ) -> Result<Completion> {
        next.run(request).await
    }

    /// Intercept a tool call.
    async fn wrap_tool_call(&self, call: ToolInvocation, next: ToolNext<'_>) -> Result<ToolOutcome> {
        next.run(call).await
    }
}

/// A priority-ordered set of layers.
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.layers.iter().map(|l| l.name()).collect();
        f.debug_struct("MiddlewareChain").field("layers", &names).finish()
    }
}

impl MiddlewareChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer. The chain re-sorts by descending priority; a stable
    /// sort keeps registration order among equal priorities.
    pub fn push(&mut self, layer: Arc<dyn Middleware>) {
        self.layers.push(layer);
        self.layers.sort_by_key(|l| std::cmp::Reverse(l.priority()));
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` if the chain has no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run a model call through the onion. With zero layers this is
    /// exactly the terminal call.
    pub async fn model_call<'a>(
        &'a self,
        request: ChatRequest,
        terminal: ModelTerminal<'a>,
    ) -> Result<Completion> {
        ModelNext {
            layers: &self.layers,
            terminal,
        }
        .run(request)
        .await
    }

    /// Run a tool call through the onion.
    pub async fn tool_call<'a>(
        &'a self,
        call: ToolInvocation,
        terminal: ToolTerminal<'a>,
    ) -> Result<ToolOutcome> {
        ToolNext {
            layers: &self.layers,
            terminal,
        }
        .run(call)
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::provider::StopReason;
    use std::sync::Mutex;

    fn completion(text: &str) -> Completion {
        Completion {
            message: Message::assistant(text),
            stop_reason: StopReason::EndTurn,
            usage: None,
        }
    }

    struct Recorder {
        label: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn wrap_model_call(
            &self,
            request: ChatRequest,
            next: ModelNext<'_>,
        ) -> Result<Completion> {
            self.log.lock().unwrap().push(format!("{}:pre", self.label));
            let response = next.run(request).await;
            self.log.lock().unwrap().push(format!("{}:post", self.label));
            response
        }
    }

    #[tokio::test]
    async fn zero_layers_is_identity() {
        let chain = MiddlewareChain::new();
        let terminal: ModelTerminal<'_> =
            &|request| Box::pin(async move { Ok(completion(&format!("echo:{}", request.messages.len()))) });

        let request = ChatRequest::with_messages(vec![Message::user("a"), Message::user("b")]);
        let direct = (terminal)(request.clone()).await.unwrap();
        let chained = chain.model_call(request, terminal).await.unwrap();
        assert_eq!(direct.text(), chained.text());
    }

    #[tokio::test]
    async fn onion_order_follows_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        // Registered inner-first; priority must reorder them.
        chain.push(Arc::new(Recorder {
            label: "inner",
            priority: 1,
            log: Arc::clone(&log),
        }));
        chain.push(Arc::new(Recorder {
            label: "outer",
            priority: 10,
            log: Arc::clone(&log),
        }));

        let terminal: ModelTerminal<'_> = &|_| Box::pin(async { Ok(completion("x")) });
        chain
            .model_call(ChatRequest::default(), terminal)
            .await
            .unwrap();

        let order = log.lock().unwrap().clone();
        assert_eq!(order, vec!["outer:pre", "inner:pre", "inner:post", "outer:post"]);
    }

    #[tokio::test]
    async fn ties_keep_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        for label in ["first", "second"] {
            chain.push(Arc::new(Recorder {
                label,
                priority: 5,
                log: Arc::clone(&log),
            }));
        }

        let terminal: ModelTerminal<'_> = &|_| Box::pin(async { Ok(completion("x")) });
        chain
            .model_call(ChatRequest::default(), terminal)
            .await
            .unwrap();

        let order = log.lock().unwrap().clone();
        assert_eq!(
            order,
            vec!["first:pre", "second:pre", "second:post", "first:post"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_terminal() {
        struct ShortCircuit;

        #[async_trait]
        impl Middleware for ShortCircuit {
            fn name(&self) -> &str {
                "short-circuit"
            }

            async fn wrap_model_call(
                &self,
                _request: ChatRequest,
                _next: ModelNext<'_>,
            ) -> Result<Completion> {
                Ok(completion("cached"))
            }
        }

        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(ShortCircuit));

        let terminal: ModelTerminal<'_> =
            &|_| Box::pin(async { panic!("terminal must not run") });
        let response = chain
            .model_call(ChatRequest::default(), terminal)
            .await
            .unwrap();
        assert_eq!(response.text(), "cached");
    }

    #[tokio::test]
    async fn middleware_error_aborts_chain() {
        struct Failing;

        #[async_trait]
        impl Middleware for Failing {
            fn name(&self) -> &str {
                "failing"
            }

            async fn wrap_model_call(
                &self,
                _request: ChatRequest,
                _next: ModelNext<'_>,
            ) -> Result<Completion> {
                Err(crate::error::Error::validation("refused"))
            }
        }

        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(Failing));

        let terminal: ModelTerminal<'_> =
            &|_| Box::pin(async { panic!("terminal must not run") });
        assert!(chain.model_call(ChatRequest::default(), terminal).await.is_err());
    }

    #[tokio::test]
    async fn tool_onion_transforms_arguments() {
        struct Doubler;

        #[async_trait]
        impl Middleware for Doubler {
            fn name(&self) -> &str {
                "doubler"
            }

            async fn wrap_tool_call(
                &self,
                mut call: ToolInvocation,
                next: ToolNext<'_>,
            ) -> Result<ToolOutcome> {
                if let Some(n) = call.input.get("n").and_then(Value::as_i64) {
                    call.input["n"] = Value::from(n * 2);
                }
                next.run(call).await
            }
        }

        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(Doubler));

        let terminal: ToolTerminal<'_> = &|call| {
            Box::pin(async move {
                Ok(ToolOutcome {
                    output: call.input["n"].clone(),
                    is_error: false,
                })
            })
        };
        let outcome = chain
            .tool_call(
                ToolInvocation {
                    call_id: "c".into(),
                    name: "t".into(),
                    input: serde_json::json!({"n": 21}),
                    caller: ToolCaller::Direct,
                },
                terminal,
            )
            .await
            .unwrap();
        assert_eq!(outcome.output, serde_json::json!(42));
    }
}
