//! Injects the live working-memory digest into the system prompt.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Middleware, ModelNext};
use crate::error::Result;
use crate::memory::WorkingMemory;
use crate::provider::{ChatRequest, Completion};

/// Middleware appending a working-memory section to the system prompt.
pub struct WorkingMemoryInjector {
    memory: Arc<Mutex<WorkingMemory>>,
}

impl std::fmt::Debug for WorkingMemoryInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingMemoryInjector").finish_non_exhaustive()
    }
}

impl WorkingMemoryInjector {
    /// Create an injector over a shared working memory.
    #[must_use]
    pub fn new(memory: Arc<Mutex<WorkingMemory>>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Middleware for WorkingMemoryInjector {
    fn name(&self) -> &str {
        "working-memory"
    }

    fn priority(&self) -> i32 {
        40
    }

    async fn wrap_model_call(
        &self,
        mut request: ChatRequest,
        next: ModelNext<'_>,
    ) -> Result<Completion> {
        let digest = {
            let mut memory = self.memory.lock().expect("working memory poisoned");
            memory.prune();
            memory.digest()
        };
        if digest.as_object().is_some_and(|o| !o.is_empty()) {
            let section = format!(
                "\n\n## Working memory\n```json\n{}\n```",
                serde_json::to_string_pretty(&digest)?
            );
            request.system = Some(match request.system.take() {
                Some(system) => system + &section,
                None => section.trim_start().to_string(),
            });
        }
        next.run(request).await
    }
}
