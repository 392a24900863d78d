//! Tool runtime: traits, registry, call tracking, and scheduling.

mod call;
mod errors;
mod registry;
mod runtime;
mod traits;

pub use call::{CallState, ToolCall};
pub use errors::ToolError;
pub use registry::{ToolEntry, ToolRegistry};
pub use runtime::{CallAction, ToolRuntime, ToolRuntimeConfig};
pub use traits::{
    CallFlags, ProgressSink, ProgressUpdate, RiskLevel, Tool, ToolAnnotations, ToolCaller,
    ToolContext, ToolDyn, ToolSpec, schema_of,
};

#[cfg(test)]
pub(crate) use traits::test_tools;
