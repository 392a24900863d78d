//! Core tool traits and their implementations.
//!
//! This module defines:
//! - [`Tool`] - the typed tool interface
//! - [`ToolDyn`] - dynamic dispatch wrapper for registry storage
//! - [`ToolContext`] - cancellation, pause, and progress plumbing handed
//!   to every execution
//! - [`ToolAnnotations`] - static risk descriptors used by the
//!   permission layer

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::mpsc;

use super::errors::ToolError;
use crate::control::{CancelToken, PauseGate};

/// Origin of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCaller {
    /// A tool-use block emitted directly by the model.
    Direct,
    /// A call made from inside a sandboxed script the model generated.
    CodeExecution,
}

impl ToolCaller {
    /// Get the string representation of the caller.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::CodeExecution => "code-execution",
        }
    }
}

/// Static risk tier of a tool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// No side effects worth gating.
    Safe,
    /// Minor, contained side effects.
    Low,
    /// Meaningful side effects.
    #[default]
    Medium,
    /// Hard-to-reverse side effects.
    High,
    /// Irreversible or security-sensitive.
    Critical,
}

/// Static descriptor attached to a tool, consumed by the permission
/// layer (notably `smart-approve` auto-approval).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAnnotations {
    /// The tool never mutates external state.
    pub read_only: bool,
    /// The tool can destroy data.
    pub destructive: bool,
    /// Repeating the call with the same input is safe.
    pub idempotent: bool,
    /// The tool reaches outside the controlled environment.
    pub open_world: bool,
    /// Risk tier.
    pub risk_level: RiskLevel,
}

impl Default for ToolAnnotations {
    fn default() -> Self {
        Self {
            read_only: false,
            destructive: false,
            idempotent: false,
            open_world: false,
            risk_level: RiskLevel::Medium,
        }
    }
}

impl ToolAnnotations {
    /// Annotations for a side-effect-free tool.
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            idempotent: true,
            risk_level: RiskLevel::Safe,
            ..Self::default()
        }
    }

    /// Set the risk level.
    #[must_use]
    pub const fn with_risk(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    /// Mark the tool destructive.
    #[must_use]
    pub const fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }
}

/// Long-running control surface a call declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFlags {
    /// The call honors cancellation.
    pub cancelable: bool,
    /// The call honors pause/resume.
    pub pausable: bool,
}

impl Default for CallFlags {
    fn default() -> Self {
        Self {
            cancelable: true,
            pausable: false,
        }
    }
}

/// Wire-facing tool description handed to providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique tool name.
    pub name: String,
    /// Human/model-readable description.
    pub description: String,
    /// JSON-schema-compatible input schema.
    pub input_schema: Value,
}

/// Derive the JSON schema for a tool's argument type.
///
/// The common [`Tool::input_schema`] implementation:
///
/// ```rust,ignore
/// fn input_schema(&self) -> Value {
///     schema_of::<AddArgs>()
/// }
/// ```
#[must_use]
pub fn schema_of<T: schemars::JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

/// A progress update pushed by a long-running tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    /// Optional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Sink a tool pushes progress into. Cheap to clone; delivery is
/// best-effort.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressSink {
    /// Create a sink and its receiving half.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// A sink whose updates are discarded.
    #[must_use]
    pub fn discard() -> Self {
        let (sink, _rx) = Self::channel(1);
        sink
    }

    /// Report progress. Clamped to `[0, 1]`; errors are ignored.
    pub async fn report(&self, progress: f64, detail: Option<String>) {
        let update = ProgressUpdate {
            progress: progress.clamp(0.0, 1.0),
            detail,
        };
        let _ = self.tx.send(update).await;
    }
}

/// Execution context handed to every tool invocation.
///
/// Tools that opt into cancellation must call [`ToolContext::checkpoint`]
/// at their own suspension points; tools that opt into progress push to
/// [`ToolContext::progress`].
#[derive(Debug)]
pub struct ToolContext {
    /// The call id this execution belongs to.
    pub call_id: String,
    /// Origin of the invocation.
    pub caller: ToolCaller,
    /// Cancellation token, a child of the agent's root token.
    pub cancel: CancelToken,
    /// Pause gate for pausable calls.
    pub pause: PauseGate,
    /// Progress sink.
    pub progress: ProgressSink,
}

impl ToolContext {
    /// Returns `true` if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cooperative suspension point: observes cancellation and suspends
    /// while paused.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Cancelled`] once cancellation is requested.
    pub async fn checkpoint(&mut self) -> Result<(), ToolError> {
        if self.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        self.pause.wait_ready().await;
        if self.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        Ok(())
    }

    /// Report progress through the context's sink.
    pub async fn report_progress(&self, progress: f64, detail: Option<String>) {
        self.progress.report(progress, detail).await;
    }
}

/// The typed tool interface.
///
/// # Example
///
/// ```rust,ignore
/// struct Adder;
///
/// #[derive(serde::Deserialize, schemars::JsonSchema)]
/// struct AddArgs { x: i64, y: i64 }
///
/// impl Tool for Adder {
///     const NAME: &'static str = "add";
///     type Args = AddArgs;
///     type Output = i64;
///
///     fn description(&self) -> String { "Add x and y.".into() }
///
///     fn input_schema(&self) -> Value {
///         serde_json::to_value(schemars::schema_for!(AddArgs)).unwrap_or_default()
///     }
///
///     async fn execute(&self, _ctx: &mut ToolContext, args: AddArgs) -> Result<i64, ToolError> {
///         Ok(args.x + args.y)
///     }
/// }
/// ```
pub trait Tool: Send + Sync + 'static {
    /// The unique tool name.
    const NAME: &'static str;

    /// Deserialized input type.
    type Args: DeserializeOwned + Send;
    /// Serialized output type.
    type Output: Serialize;

    /// The tool name.
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    /// Human/model-readable description.
    fn description(&self) -> String;

    /// JSON-schema-compatible input schema.
    fn input_schema(&self) -> Value;

    /// Static risk descriptors.
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::default()
    }

    /// Long-running control flags.
    fn flags(&self) -> CallFlags {
        CallFlags::default()
    }

    /// Execute the tool.
    fn execute(
        &self,
        ctx: &mut ToolContext,
        args: Self::Args,
    ) -> impl Future<Output = Result<Self::Output, ToolError>> + Send;
}

/// Dynamic dispatch wrapper for tools, as stored in the registry.
pub trait ToolDyn: Send + Sync {
    /// The tool name.
    fn name(&self) -> String;

    /// Human/model-readable description.
    fn description(&self) -> String;

    /// JSON-schema-compatible input schema.
    fn input_schema(&self) -> Value;

    /// Static risk descriptors.
    fn annotations(&self) -> ToolAnnotations;

    /// Long-running control flags.
    fn flags(&self) -> CallFlags;

    /// Execute with an opaque JSON input.
    fn execute<'a>(
        &'a self,
        ctx: &'a mut ToolContext,
        input: Value,
    ) -> BoxFuture<'a, Result<Value, ToolError>>;

    /// The wire-facing spec for provider requests.
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name(),
            description: self.description(),
            input_schema: self.input_schema(),
        }
    }
}

impl<T: Tool> ToolDyn for T {
    fn name(&self) -> String {
        Tool::name(self)
    }

    fn description(&self) -> String {
        Tool::description(self)
    }

    fn input_schema(&self) -> Value {
        Tool::input_schema(self)
    }

    fn annotations(&self) -> ToolAnnotations {
        Tool::annotations(self)
    }

    fn flags(&self) -> CallFlags {
        Tool::flags(self)
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a mut ToolContext,
        input: Value,
    ) -> BoxFuture<'a, Result<Value, ToolError>> {
        Box::pin(async move {
            let args: T::Args = serde_json::from_value(input)
                .map_err(|e| ToolError::Validation(format!("schema mismatch: {e}")))?;
            let output = Tool::execute(self, ctx, args).await?;
            serde_json::to_value(output).map_err(ToolError::from)
        })
    }
}
