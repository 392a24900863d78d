//! The agent: a stateful, long-lived task executing reason-act
//! iterations.
//!
//! # Example
//!
//! ```rust,ignore
//! let agent = Agent::builder()
//!     .provider(provider)
//!     .tool(ReadFileTool)
//!     .build()?;
//!
//! let result = agent.chat("read /tmp/a.txt").await?;
//! println!("{}", result.text);
//! ```

mod builder;
mod config;
mod runner;
mod state;

pub use builder::AgentBuilder;
pub use config::AgentConfig;
pub use state::AgentState;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::control::{CancelToken, PauseController, PauseGate};
use crate::error::{Error, Result};
use crate::event::{EventBus, EventEnvelope, EventPayload, SubscribeOptions, Subscription};
use crate::memory::WorkingMemory;
use crate::middleware::MiddlewareChain;
use crate::permission::PermissionEngine;
use crate::provider::Provider;
use crate::sandbox::CommandPolicy;
use crate::session::{SessionEvent, SessionId, SessionSnapshot, SessionStore};
use crate::stream::{self, Reader};
use crate::tool::{ToolCaller, ToolRegistry, ToolRuntime};
use crate::usage::TokenUsage;

use state::StateCell;

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnStopReason {
    /// The model produced a final text answer.
    Done,
    /// The model produced no content and no tool calls.
    Empty,
    /// The step budget was exhausted. Not an error.
    StepLimit,
    /// The run was stopped or interrupted.
    Cancelled,
}

/// Outcome of one [`Agent::chat`] turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    /// Final assistant text.
    pub text: String,
    /// Why the loop terminated.
    pub stop_reason: TurnStopReason,
    /// Accumulated token usage across all steps.
    pub usage: TokenUsage,
    /// Provider invocations made.
    pub steps: usize,
}

/// Snapshot returned by [`Agent::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    /// Current state.
    pub state: AgentState,
    /// Steps taken in the current or last turn.
    pub step_count: usize,
    /// Last time the agent did anything observable.
    pub last_activity: DateTime<Utc>,
}

pub(crate) struct AgentCore {
    pub(crate) config: AgentConfig,
    pub(crate) agent_id: String,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) runtime: ToolRuntime,
    pub(crate) bus: EventBus,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) session: Mutex<Option<SessionId>>,
    pub(crate) conversation: Mutex<Vec<crate::message::Message>>,
    pub(crate) chain: MiddlewareChain,
    pub(crate) permissions: PermissionEngine,
    pub(crate) sandbox_policy: Option<CommandPolicy>,
    pub(crate) state: StateCell,
    pub(crate) cancel: CancelToken,
    pub(crate) run_interrupt: StdMutex<CancelToken>,
    pub(crate) pause_ctrl: PauseController,
    pub(crate) pause_gate: PauseGate,
    pub(crate) run_lock: Mutex<()>,
    pub(crate) step_count: AtomicUsize,
    pub(crate) last_activity: StdMutex<DateTime<Utc>>,
    pub(crate) working_memory: Arc<StdMutex<WorkingMemory>>,
}

impl AgentCore {
    pub(crate) fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Utc::now();
    }

    pub(crate) async fn publish(&self, payload: &EventPayload) {
        self.touch();
        self.bus.publish(&self.agent_id, payload).await;
    }

    /// Append a session event, if a session exists yet. Store failures
    /// are fatal: a session that cannot record is corrupt.
    pub(crate) async fn append_session(&self, event: SessionEvent) -> Result<()> {
        let session = self.session.lock().await.clone();
        if let Some(session) = session {
            self.store
                .append_event(&session, event)
                .await
                .map_err(|e| Error::fatal(format!("session store failure: {e}")))?;
        }
        Ok(())
    }

    pub(crate) async fn ensure_session(&self) -> Result<SessionId> {
        let mut session = self.session.lock().await;
        if let Some(id) = session.as_ref() {
            return Ok(id.clone());
        }
        let id = self.store.create_session().await?;
        debug!(agent = %self.agent_id, session = %id, "created session");
        *session = Some(id.clone());
        Ok(id)
    }

    /// Transition the state machine, emitting the monitor event and the
    /// session record.
    pub(crate) async fn set_state(&self, to: AgentState) -> Result<()> {
        let Some(from) = self.state.transition_idempotent(to)? else {
            return Ok(());
        };
        self.publish(&EventPayload::StateChanged {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
        .await;
        self.append_session(SessionEvent::StateChanged {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
        .await
    }

    pub(crate) async fn push_message(&self, message: crate::message::Message) -> Result<()> {
        self.conversation.lock().await.push(message.clone());
        self.append_session(SessionEvent::MessageAdded { message }).await
    }
}

/// A stateful, tool-using agent. Cheap to clone; all clones share the
/// same core, so control-plane calls can come from any task.
#[derive(Clone)]
pub struct Agent {
    core: Arc<AgentCore>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.core.agent_id)
            .field("state", &self.core.state.current())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create a new agent builder.
    #[inline]
    #[must_use]
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub(crate) fn from_core(core: AgentCore) -> Self {
        Self { core: Arc::new(core) }
    }

    /// The agent's unique id, carried on every envelope it publishes.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.core.agent_id
    }

    /// Execute one user turn to completion.
    ///
    /// Drives reason-act iterations until the model stops requesting
    /// tools, the step budget is exhausted, the run is cancelled, or a
    /// fatal error occurs.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when the agent is not startable, provider
    /// errors that exhausted their retries, and fatal runtime failures.
    pub async fn chat(&self, input: impl Into<String>) -> Result<TurnResult> {
        runner::run_turn(&self.core, input.into()).await
    }

    /// Execute one user turn, returning a lazy envelope sequence instead
    /// of blocking.
    ///
    /// The reader delivers every envelope the turn publishes (thinking
    /// chunks included - filter by type if unwanted) and closes when the
    /// turn completes. Use [`Agent::resume_from_checkpoint`] to restart
    /// an interrupted conversation from its last durable point.
    #[must_use]
    pub fn chat_stream(&self, input: impl Into<String>) -> Reader<EventEnvelope> {
        let mut subscription = self.subscribe(SubscribeOptions::all());
        let agent = self.clone();
        let input = input.into();
        let (writer, reader) = stream::pipe(64);

        let handle = tokio::spawn(async move {
            let chat_agent = agent.clone();
            let mut chat = tokio::spawn(async move { chat_agent.chat(input).await });
            loop {
                tokio::select! {
                    envelope = subscription.recv() => match envelope {
                        Some(envelope) => {
                            if writer.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    result = &mut chat => {
                        if let Ok(Err(e)) = &result {
                            debug!(error = %e, "streamed turn failed");
                        }
                        // Drain what the turn already published.
                        while subscription.buffered() > 0 {
                            match subscription.recv().await {
                                Some(envelope) => {
                                    if writer.send(envelope).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                        break;
                    }
                }
            }
            subscription.close();
        });

        reader.with_producer(handle).auto_close()
    }

    /// Allocate a filtered, bounded subscription on the agent's bus.
    /// The caller must close it.
    #[must_use]
    pub fn subscribe(&self, options: SubscribeOptions) -> Subscription {
        self.core.bus.subscribe(options)
    }

    /// Suspend the loop at its next suspension point. In-flight tool
    /// calls keep running. Idempotent.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] outside `Ready`/`Thinking`/
    /// `ExecutingTool`.
    pub async fn pause(&self) -> Result<()> {
        match self.core.state.current() {
            AgentState::Paused => Ok(()),
            AgentState::Ready | AgentState::Thinking | AgentState::ExecutingTool => {
                self.core.set_state(AgentState::Paused).await?;
                self.core.pause_ctrl.pause();
                info!(agent = %self.core.agent_id, "paused");
                Ok(())
            }
            other => Err(Error::invalid_state("pause", other.as_str())),
        }
    }

    /// Release a paused loop. Idempotent.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when the agent is neither paused nor
    /// already running.
    pub async fn resume(&self) -> Result<()> {
        match self.core.state.current() {
            AgentState::Paused => {
                self.core.set_state(AgentState::Ready).await?;
                self.core.pause_ctrl.resume();
                info!(agent = %self.core.agent_id, "resumed");
                Ok(())
            }
            AgentState::Ready | AgentState::Thinking | AgentState::ExecutingTool => Ok(()),
            other => Err(Error::invalid_state("resume", other.as_str())),
        }
    }

    /// Stop the agent: cancel every in-flight operation, await drain up
    /// to the configured grace period, release resources, and close all
    /// subscriptions. Idempotent.
    ///
    /// After this returns, the agent publishes nothing further and
    /// `list_running()` is empty.
    ///
    /// # Errors
    ///
    /// [`Error::Fatal`] when the drain deadline expired and stragglers
    /// were force-released (`failed{stop-timeout}`).
    pub async fn stop(&self) -> Result<()> {
        if self.core.state.current().is_terminal() {
            return Ok(());
        }
        info!(agent = %self.core.agent_id, "stopping");
        let _ = self.core.set_state(AgentState::Stopping).await;

        // Unblock a paused loop so it can observe cancellation.
        self.core.pause_ctrl.resume();
        self.core.cancel.cancel();
        self.core.runtime.cancel_all();

        let drained = self.core.runtime.drain(self.core.config.stop_grace).await;
        self.core.runtime.reap_terminal();

        if drained {
            let _ = self.core.set_state(AgentState::Stopped).await;
            self.core.bus.close().await;
            Ok(())
        } else {
            warn!(agent = %self.core.agent_id, "stop deadline expired");
            let _ = self.core.set_state(AgentState::Failed).await;
            self.core
                .publish(&EventPayload::Error {
                    message: "stop-timeout".into(),
                    fatal: true,
                })
                .await;
            self.core.bus.close().await;
            Err(Error::fatal("stop-timeout"))
        }
    }

    /// Ask the current run to terminate at its next suspension point.
    /// The agent stays usable for further turns. Idempotent.
    pub async fn interrupt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(agent = %self.core.agent_id, reason = %reason, "interrupt requested");
        self.core
            .publish(&EventPayload::Interrupt { reason })
            .await;
        self.core
            .run_interrupt
            .lock()
            .expect("interrupt lock poisoned")
            .cancel();
        // In-flight calls are signalled too; the loop exits only after
        // every cancellation acknowledges.
        self.core.runtime.cancel_all();
        // A paused run must wake to observe the interrupt.
        if self.core.state.current() == AgentState::Paused {
            let _ = self.core.set_state(AgentState::Ready).await;
            self.core.pause_ctrl.resume();
        }
    }

    /// The current session id, once the first turn has created one.
    pub async fn session_id(&self) -> Option<SessionId> {
        self.core.session.lock().await.clone()
    }

    /// Current state, step count, and last activity.
    #[must_use]
    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            state: self.core.state.current(),
            step_count: self.core.step_count.load(Ordering::SeqCst),
            last_activity: *self
                .core
                .last_activity
                .lock()
                .expect("activity lock poisoned"),
        }
    }

    /// Resolve a pending control-channel approval request.
    /// Returns `false` for unknown request ids.
    pub fn respond_approval(&self, request_id: &str, approved: bool) -> bool {
        self.core.permissions.broker().resolve(request_id, approved)
    }

    /// Rehydrate the conversation from a checkpoint of the current
    /// session. Calls that were in flight at checkpoint time come back
    /// as `failed{crash-recovery}`; with `reissue_interrupted` they are
    /// scheduled again and their ids returned.
    ///
    /// # Errors
    ///
    /// Store errors, unknown checkpoints, and
    /// [`Error::InvalidState`] while a turn is running.
    pub async fn resume_from_checkpoint(
        &self,
        checkpoint_id: &str,
        reissue_interrupted: bool,
    ) -> Result<Vec<String>> {
        let _guard = self.core.run_lock.lock().await;
        let session = self
            .core
            .session
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::validation("agent has no session yet"))?;

        let snapshot: SessionSnapshot = self
            .core
            .store
            .restore_from_checkpoint(&session, checkpoint_id)
            .await?;

        let recovered: Vec<_> = snapshot
            .calls
            .iter()
            .filter(|c| c.error.as_deref() == Some("crash-recovery"))
            .cloned()
            .collect();

        *self.core.conversation.lock().await = snapshot.messages;
        self.core
            .step_count
            .store(snapshot.step_count, Ordering::SeqCst);
        if self.core.state.current() == AgentState::Created {
            self.core.set_state(AgentState::Initializing).await?;
            self.core.set_state(AgentState::Ready).await?;
        }

        let mut reissued = Vec::new();
        if reissue_interrupted {
            for call in recovered {
                match self.core.runtime.schedule(
                    None,
                    &call.name,
                    call.input.clone(),
                    call.caller,
                    &self.core.cancel,
                ) {
                    Ok(id) => reissued.push(id),
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "could not re-issue recovered call");
                    }
                }
            }
        }
        info!(
            agent = %self.core.agent_id,
            checkpoint = checkpoint_id,
            reissued = reissued.len(),
            "restored from checkpoint",
        );
        Ok(reissued)
    }

    /// Create a checkpoint of the current session.
    ///
    /// # Errors
    ///
    /// Store errors, or a validation error before the first turn.
    pub async fn checkpoint(&self) -> Result<crate::session::Checkpoint> {
        let session = self
            .core
            .session
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::validation("agent has no session yet"))?;
        self.core.store.create_checkpoint(&session).await
    }

    /// Snapshots of the currently tracked non-terminal tool calls.
    #[must_use]
    pub fn list_running(&self) -> Vec<crate::tool::ToolCall> {
        self.core.runtime.list_running()
    }

    /// The agent's tool runtime, for long-running call control.
    #[must_use]
    pub fn tools(&self) -> &ToolRuntime {
        &self.core.runtime
    }

    /// The agent's tool registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.core.registry
    }

    /// The agent's working memory.
    #[must_use]
    pub fn working_memory(&self) -> &Arc<StdMutex<WorkingMemory>> {
        &self.core.working_memory
    }

    /// Execute a registered tool outside the reason-act loop, as the
    /// given caller, subject to the same authorization pipeline.
    ///
    /// # Errors
    ///
    /// Authorization denials and tool failures.
    pub async fn call_tool(
        &self,
        name: &str,
        input: serde_json::Value,
        caller: ToolCaller,
    ) -> Result<serde_json::Value> {
        runner::call_tool_direct(&self.core, name, input, caller).await
    }
}
