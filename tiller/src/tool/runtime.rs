//! The tool runtime: scheduling, tracking, and control of executions.
//!
//! Every execution runs on its own task behind a per-agent semaphore.
//! Long-running calls stay in the running-call table until explicitly
//! reaped; progress updates are multiplexed onto the progress channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::call::{CallState, ToolCall};
use super::errors::ToolError;
use super::registry::ToolRegistry;
use super::traits::{ProgressSink, ToolCaller, ToolContext, ToolDyn};
use crate::control::{CancelToken, PauseController, pause_gate};
use crate::event::{EventBus, EventPayload};

/// Control action on a running call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallAction {
    /// Suspend at the next checkpoint.
    Pause,
    /// Release a paused call.
    Resume,
    /// Request cancellation.
    Cancel,
}

impl CallAction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }
}

/// Tunables for the runtime.
#[derive(Debug, Clone, Copy)]
pub struct ToolRuntimeConfig {
    /// Parallel executions per agent.
    pub max_parallel: usize,
    /// How long a cancellation may stay unacknowledged before the call
    /// is forcibly reaped as `failed{cancel-timeout}`.
    pub cancel_ack_timeout: Duration,
    /// Retries for infrastructure failures.
    pub max_infra_retries: u32,
    /// Base delay between infrastructure retries.
    pub infra_retry_delay: Duration,
}

impl Default for ToolRuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            cancel_ack_timeout: Duration::from_secs(30),
            max_infra_retries: 2,
            infra_retry_delay: Duration::from_millis(100),
        }
    }
}

struct RunningCall {
    call: Mutex<ToolCall>,
    cancel: CancelToken,
    pause: PauseController,
    done: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RunningCall {
    fn snapshot(&self) -> ToolCall {
        self.call.lock().expect("call lock poisoned").clone()
    }

    fn is_terminal(&self) -> bool {
        self.call
            .lock()
            .expect("call lock poisoned")
            .state
            .is_terminal()
    }
}

/// Per-agent tool execution engine.
pub struct ToolRuntime {
    registry: Arc<ToolRegistry>,
    semaphore: Arc<Semaphore>,
    table: Mutex<HashMap<String, Arc<RunningCall>>>,
    bus: EventBus,
    agent_id: String,
    config: ToolRuntimeConfig,
}

impl std::fmt::Debug for ToolRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRuntime")
            .field("agent_id", &self.agent_id)
            .field("max_parallel", &self.config.max_parallel)
            .field("tracked", &self.table.lock().map(|t| t.len()).unwrap_or(0))
            .finish()
    }
}

impl ToolRuntime {
    /// Create a runtime bound to an agent's bus and registry.
    #[must_use]
    pub fn new(
        registry: Arc<ToolRegistry>,
        bus: EventBus,
        agent_id: impl Into<String>,
        config: ToolRuntimeConfig,
    ) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            table: Mutex::new(HashMap::new()),
            bus,
            agent_id: agent_id.into(),
            config,
        }
    }

    /// Schedule a call on its own task and return the call id.
    ///
    /// Validates registry existence and caller authorization; every
    /// other authorization step happens before scheduling.
    ///
    /// # Errors
    ///
    /// [`ToolError::Validation`] for unknown tools, [`ToolError::Denied`]
    /// for disallowed callers.
    pub fn schedule(
        &self,
        call_id: Option<String>,
        name: &str,
        input: Value,
        caller: ToolCaller,
        parent_cancel: &CancelToken,
    ) -> Result<String, ToolError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| ToolError::Validation(format!("unknown tool '{name}'")))?;
        if !entry.allowed_callers.contains(&caller) {
            return Err(ToolError::Denied(format!(
                "caller '{}' may not invoke '{name}'",
                caller.as_str()
            )));
        }

        let call_id = call_id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
        let flags = entry.tool.flags();
        let cancel = parent_cancel.child();
        let (pause_ctrl, pause_rx) = pause_gate();

        let running = Arc::new(RunningCall {
            call: Mutex::new(ToolCall::new(
                call_id.clone(),
                name,
                input.clone(),
                caller,
                flags,
            )),
            cancel: cancel.clone(),
            pause: pause_ctrl,
            done: Notify::new(),
            task: Mutex::new(None),
        });

        self.table
            .lock()
            .expect("call table poisoned")
            .insert(call_id.clone(), Arc::clone(&running));

        let handle = tokio::spawn(run_call(
            Arc::clone(&running),
            entry.tool,
            input,
            caller,
            cancel,
            pause_rx,
            Arc::clone(&self.semaphore),
            self.bus.clone(),
            self.agent_id.clone(),
            self.config,
        ));
        *running.task.lock().expect("task lock poisoned") = Some(handle);

        debug!(call_id = %call_id, tool = name, "scheduled tool call");
        Ok(call_id)
    }

    /// Short-running synchronous path: schedule, await the terminal
    /// state, reap, and return the output.
    ///
    /// # Errors
    ///
    /// Propagates scheduling errors, [`ToolError::Execution`] for failed
    /// calls, and [`ToolError::Cancelled`] for cancelled ones.
    pub async fn execute(
        &self,
        name: &str,
        input: Value,
        caller: ToolCaller,
        parent_cancel: &CancelToken,
    ) -> Result<Value, ToolError> {
        let call_id = self.schedule(None, name, input, caller, parent_cancel)?;
        let call = self.wait_result(&call_id).await?;
        self.reap(&call_id);
        match call.state {
            CallState::Succeeded => Ok(call.result.unwrap_or(Value::Null)),
            CallState::Cancelled => Err(ToolError::Cancelled),
            _ => Err(ToolError::Execution(
                call.error.unwrap_or_else(|| "unknown failure".into()),
            )),
        }
    }

    /// Apply a control action to a tracked call.
    ///
    /// # Errors
    ///
    /// [`ToolError::UnknownCall`] for untracked ids,
    /// [`ToolError::Unsupported`] when the call does not declare the
    /// matching flag, [`ToolError::Validation`] for illegal states.
    pub fn control(&self, call_id: &str, action: CallAction) -> Result<(), ToolError> {
        let running = self
            .lookup(call_id)
            .ok_or_else(|| ToolError::UnknownCall(call_id.to_string()))?;

        let flags = running.snapshot().flags;
        match action {
            CallAction::Pause => {
                if !flags.pausable {
                    return Err(ToolError::Unsupported {
                        call_id: call_id.to_string(),
                        action: action.as_str(),
                    });
                }
                let mut call = running.call.lock().expect("call lock poisoned");
                if call.state == CallState::Paused {
                    return Ok(());
                }
                if !call.transition(CallState::Paused) {
                    return Err(ToolError::Validation(format!(
                        "cannot pause call in state '{}'",
                        call.state
                    )));
                }
                drop(call);
                running.pause.pause();
                Ok(())
            }
            CallAction::Resume => {
                if !flags.pausable {
                    return Err(ToolError::Unsupported {
                        call_id: call_id.to_string(),
                        action: action.as_str(),
                    });
                }
                let mut call = running.call.lock().expect("call lock poisoned");
                if call.state == CallState::Executing {
                    return Ok(());
                }
                if !call.transition(CallState::Executing) {
                    return Err(ToolError::Validation(format!(
                        "cannot resume call in state '{}'",
                        call.state
                    )));
                }
                drop(call);
                running.pause.resume();
                Ok(())
            }
            CallAction::Cancel => {
                if !flags.cancelable {
                    return Err(ToolError::Unsupported {
                        call_id: call_id.to_string(),
                        action: action.as_str(),
                    });
                }
                self.request_cancel(&running);
                Ok(())
            }
        }
    }

    /// Snapshot of every non-terminal call.
    #[must_use]
    pub fn list_running(&self) -> Vec<ToolCall> {
        self.table
            .lock()
            .expect("call table poisoned")
            .values()
            .map(|r| r.snapshot())
            .filter(|c| !c.state.is_terminal())
            .collect()
    }

    /// Current snapshot of a tracked call.
    #[must_use]
    pub fn get_status(&self, call_id: &str) -> Option<ToolCall> {
        self.lookup(call_id).map(|r| r.snapshot())
    }

    /// Non-blocking result fetch.
    ///
    /// # Errors
    ///
    /// [`ToolError::StillRunning`] while non-terminal,
    /// [`ToolError::UnknownCall`] for untracked ids.
    pub fn get_result(&self, call_id: &str) -> Result<ToolCall, ToolError> {
        let running = self
            .lookup(call_id)
            .ok_or_else(|| ToolError::UnknownCall(call_id.to_string()))?;
        let call = running.snapshot();
        if call.state.is_terminal() {
            Ok(call)
        } else {
            Err(ToolError::StillRunning)
        }
    }

    /// Await the terminal state of a tracked call.
    ///
    /// # Errors
    ///
    /// [`ToolError::UnknownCall`] for untracked ids.
    pub async fn wait_result(&self, call_id: &str) -> Result<ToolCall, ToolError> {
        let running = self
            .lookup(call_id)
            .ok_or_else(|| ToolError::UnknownCall(call_id.to_string()))?;
        loop {
            let notified = running.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let call = running.snapshot();
            if call.state.is_terminal() {
                return Ok(call);
            }
            notified.await;
        }
    }

    /// Remove a terminal call from the table. Returns it, or `None`
    /// when the call is unknown or still running.
    pub fn reap(&self, call_id: &str) -> Option<ToolCall> {
        let mut table = self.table.lock().expect("call table poisoned");
        let running = table.get(call_id)?;
        if !running.is_terminal() {
            return None;
        }
        table.remove(call_id).map(|r| r.snapshot())
    }

    /// Signal cancellation to every non-terminal call. Agent stop
    /// overrides per-call `cancelable` flags.
    pub fn cancel_all(&self) {
        let targets: Vec<Arc<RunningCall>> = self
            .table
            .lock()
            .expect("call table poisoned")
            .values()
            .filter(|r| !r.is_terminal())
            .map(Arc::clone)
            .collect();
        for running in targets {
            self.request_cancel(&running);
        }
    }

    /// Await every tracked call's terminal state, up to `deadline`.
    /// Returns `false` when the deadline expired; stragglers are then
    /// forcibly reaped and marked failed.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let wait_all = async {
            loop {
                let pending: Vec<Arc<RunningCall>> = {
                    let table = self.table.lock().expect("call table poisoned");
                    table
                        .values()
                        .filter(|r| !r.is_terminal())
                        .map(Arc::clone)
                        .collect()
                };
                if pending.is_empty() {
                    return;
                }
                for running in pending {
                    let notified = running.done.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if !running.is_terminal() {
                        notified.await;
                    }
                }
            }
        };

        if tokio::time::timeout(deadline, wait_all).await.is_ok() {
            return true;
        }

        warn!(agent = %self.agent_id, "drain deadline expired; force-reaping stragglers");
        let stragglers: Vec<Arc<RunningCall>> = {
            let table = self.table.lock().expect("call table poisoned");
            table
                .values()
                .filter(|r| !r.is_terminal())
                .map(Arc::clone)
                .collect()
        };
        for running in stragglers {
            force_fail(&running, "stop-timeout", &self.bus, &self.agent_id).await;
        }
        false
    }

    /// Remove every terminal call from the table.
    pub fn reap_terminal(&self) {
        self.table
            .lock()
            .expect("call table poisoned")
            .retain(|_, r| !r.is_terminal());
    }

    fn lookup(&self, call_id: &str) -> Option<Arc<RunningCall>> {
        self.table
            .lock()
            .expect("call table poisoned")
            .get(call_id)
            .map(Arc::clone)
    }

    fn request_cancel(&self, running: &Arc<RunningCall>) {
        {
            let mut call = running.call.lock().expect("call lock poisoned");
            if call.state.is_terminal() || call.state == CallState::Cancelling {
                return;
            }
            call.transition(CallState::Cancelling);
        }
        // Unblock a paused executor so it can observe cancellation.
        running.pause.resume();
        running.cancel.cancel();

        let watchdog_target = Arc::clone(running);
        let bus = self.bus.clone();
        let agent_id = self.agent_id.clone();
        let ack_timeout = self.config.cancel_ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(ack_timeout).await;
            let unacked = {
                let call = watchdog_target.call.lock().expect("call lock poisoned");
                call.state == CallState::Cancelling
            };
            if unacked {
                warn!("cancel unacknowledged; force-reaping");
                force_fail(&watchdog_target, "cancel-timeout", &bus, &agent_id).await;
            }
        });
    }
}

/// Force a non-terminal call into `Failed` with the given reason,
/// aborting its task and emitting the terminal event.
async fn force_fail(running: &Arc<RunningCall>, reason: &str, bus: &EventBus, agent_id: &str) {
    let terminal = {
        let mut call = running.call.lock().expect("call lock poisoned");
        if call.fail(reason) {
            Some(call.clone())
        } else {
            None
        }
    };
    let Some(call) = terminal else { return };

    if let Some(handle) = running.task.lock().expect("task lock poisoned").take() {
        handle.abort();
    }
    running.done.notify_waiters();

    bus.publish(
        agent_id,
        &EventPayload::ToolEnd {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output: Value::String(reason.to_string()),
            is_error: true,
        },
    )
    .await;
}

/// Body of one scheduled execution task.
#[allow(clippy::too_many_arguments)]
async fn run_call(
    running: Arc<RunningCall>,
    tool: Arc<dyn ToolDyn>,
    input: Value,
    caller: ToolCaller,
    cancel: CancelToken,
    pause: crate::control::PauseGate,
    semaphore: Arc<Semaphore>,
    bus: EventBus,
    agent_id: String,
    config: ToolRuntimeConfig,
) {
    let call_id = running.snapshot().id;
    let name = tool.name();

    {
        let mut call = running.call.lock().expect("call lock poisoned");
        call.transition(CallState::Scheduled);
    }

    // Queue behind the per-agent concurrency bound.
    let permit = tokio::select! {
        permit = Arc::clone(&semaphore).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                finish(&running, &bus, &agent_id, Err(ToolError::Infrastructure("semaphore closed".into()))).await;
                return;
            }
        },
        () = cancel.cancelled() => {
            finish(&running, &bus, &agent_id, Err(ToolError::Cancelled)).await;
            return;
        }
    };

    let cancelled_while_queued = {
        let mut call = running.call.lock().expect("call lock poisoned");
        !call.transition(CallState::Executing)
    };
    if cancelled_while_queued {
        // Cancelled while queued.
        drop(permit);
        finish(&running, &bus, &agent_id, Err(ToolError::Cancelled)).await;
        return;
    }

    bus.publish(
        &agent_id,
        &EventPayload::ToolStart {
            call_id: call_id.clone(),
            name: name.clone(),
        },
    )
    .await;

    // Multiplex tool progress onto the progress channel.
    let (sink, mut progress_rx) = ProgressSink::channel(16);
    let progress_target = Arc::clone(&running);
    let progress_bus = bus.clone();
    let progress_agent = agent_id.clone();
    let progress_call_id = call_id.clone();
    let progress_name = name.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(update) = progress_rx.recv().await {
            {
                let mut call = progress_target.call.lock().expect("call lock poisoned");
                call.progress = update.progress;
            }
            progress_bus
                .publish(
                    &progress_agent,
                    &EventPayload::ToolProgress {
                        call_id: progress_call_id.clone(),
                        name: progress_name.clone(),
                        progress: update.progress,
                        detail: update.detail,
                    },
                )
                .await;
        }
    });

    let mut ctx = ToolContext {
        call_id: call_id.clone(),
        caller,
        cancel: cancel.clone(),
        pause,
        progress: sink,
    };

    // Infrastructure failures are retried; everything else is final.
    let mut attempt: u32 = 0;
    let outcome = loop {
        let execution = tool.execute(&mut ctx, input.clone());
        let result = tokio::select! {
            result = execution => result,
            () = cancel.cancelled() => Err(ToolError::Cancelled),
        };
        match result {
            Err(ToolError::Infrastructure(message)) if attempt < config.max_infra_retries => {
                attempt += 1;
                let delay = config
                    .infra_retry_delay
                    .saturating_mul(2_u32.saturating_pow(attempt - 1))
                    .mul_f64(0.5 + fastrand::f64() / 2.0);
                warn!(call_id = %call_id, tool = %name, attempt, error = %message, "retrying after infrastructure failure");
                tokio::time::sleep(delay).await;
            }
            other => break other,
        }
    };

    drop(ctx);
    let _ = forwarder.await;
    drop(permit);

    finish(&running, &bus, &agent_id, outcome).await;
}

/// Record a terminal state and emit the terminal event.
async fn finish(
    running: &Arc<RunningCall>,
    bus: &EventBus,
    agent_id: &str,
    outcome: Result<Value, ToolError>,
) {
    let call = {
        let mut call = running.call.lock().expect("call lock poisoned");
        match outcome {
            Ok(value) => {
                if !call.succeed(value.clone()) {
                    // Completion raced a pause or cancel request.
                    if call.state == CallState::Paused && call.transition(CallState::Executing) {
                        call.succeed(value);
                    } else {
                        if call.state != CallState::Cancelling {
                            call.transition(CallState::Cancelling);
                        }
                        call.cancelled();
                    }
                }
            }
            Err(ToolError::Cancelled) => {
                // Acknowledge a pending cancel, or record an uninvited one.
                if call.state != CallState::Cancelling {
                    call.transition(CallState::Cancelling);
                }
                call.cancelled();
            }
            Err(err) => {
                call.fail(err.to_string());
            }
        }
        call.clone()
    };
    running.done.notify_waiters();

    let (output, is_error) = match call.state {
        CallState::Succeeded => (call.result.clone().unwrap_or(Value::Null), false),
        _ => (
            Value::String(call.error.clone().unwrap_or_else(|| "failed".into())),
            true,
        ),
    };
    bus.publish(
        agent_id,
        &EventPayload::ToolEnd {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output,
            is_error,
        },
    )
    .await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tool::traits::test_tools::EchoTool;
    use crate::tool::traits::{CallFlags, Tool, ToolAnnotations};
    use serde_json::json;

    /// Sleeps in small cancellable steps, reporting progress.
    #[derive(Debug, Clone, Copy)]
    struct SlowTool;

    #[derive(Debug, serde::Deserialize)]
    struct SlowArgs {
        steps: u32,
    }

    impl Tool for SlowTool {
        const NAME: &'static str = "slow";
        type Args = SlowArgs;
        type Output = String;

        fn description(&self) -> String {
            "Sleeps in cancellable steps.".into()
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {"steps": {"type": "integer"}}})
        }

        fn flags(&self) -> CallFlags {
            CallFlags {
                cancelable: true,
                pausable: true,
            }
        }

        async fn execute(
            &self,
            ctx: &mut ToolContext,
            args: SlowArgs,
        ) -> Result<String, ToolError> {
            for step in 0..args.steps {
                ctx.checkpoint().await?;
                ctx.report_progress(f64::from(step) / f64::from(args.steps), None)
                    .await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok("done".into())
        }
    }

    /// Fails with an infrastructure error a fixed number of times.
    #[derive(Debug)]
    struct FlakyTool {
        failures: std::sync::atomic::AtomicU32,
    }

    impl Tool for FlakyTool {
        const NAME: &'static str = "flaky";
        type Args = serde_json::Map<String, Value>;
        type Output = String;

        fn description(&self) -> String {
            "Fails twice, then succeeds.".into()
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn annotations(&self) -> ToolAnnotations {
            ToolAnnotations::read_only()
        }

        async fn execute(
            &self,
            _ctx: &mut ToolContext,
            _args: Self::Args,
        ) -> Result<String, ToolError> {
            use std::sync::atomic::Ordering;
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                Err(ToolError::Infrastructure("sandbox restarting".into()))
            } else {
                Ok("recovered".into())
            }
        }
    }

    fn runtime_with(registry: ToolRegistry) -> ToolRuntime {
        ToolRuntime::new(
            Arc::new(registry),
            EventBus::default(),
            "agent-test",
            ToolRuntimeConfig {
                cancel_ack_timeout: Duration::from_millis(500),
                infra_retry_delay: Duration::from_millis(1),
                ..ToolRuntimeConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn execute_short_path() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool);
        let runtime = runtime_with(registry);

        let output = runtime
            .execute(
                "echo",
                json!({"message": "hi"}),
                ToolCaller::Direct,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(output, json!("hi"));
        assert!(runtime.list_running().is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_is_validation_error() {
        let runtime = runtime_with(ToolRegistry::new());
        let err = runtime
            .execute("ghost", json!({}), ToolCaller::Direct, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[tokio::test]
    async fn disallowed_caller_is_denied() {
        let registry = ToolRegistry::new();
        registry.register_with_callers(Arc::new(EchoTool), [ToolCaller::Direct]);
        let runtime = runtime_with(registry);

        let err = runtime
            .execute(
                "echo",
                json!({"message": "x"}),
                ToolCaller::CodeExecution,
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Denied(_)));
    }

    #[tokio::test]
    async fn schedule_tracks_and_waits() {
        let registry = ToolRegistry::new();
        registry.register(SlowTool);
        let runtime = runtime_with(registry);

        let call_id = runtime
            .schedule(
                None,
                "slow",
                json!({"steps": 3}),
                ToolCaller::Direct,
                &CancelToken::new(),
            )
            .unwrap();

        assert!(runtime.get_status(&call_id).is_some());
        assert!(matches!(
            runtime.get_result(&call_id),
            Err(ToolError::StillRunning)
        ));

        let call = runtime.wait_result(&call_id).await.unwrap();
        assert_eq!(call.state, CallState::Succeeded);
        assert_eq!(call.result, Some(json!("done")));

        assert!(runtime.reap(&call_id).is_some());
        assert!(runtime.get_status(&call_id).is_none());
    }

    #[tokio::test]
    async fn cancel_transitions_through_cancelling() {
        let registry = ToolRegistry::new();
        registry.register(SlowTool);
        let runtime = runtime_with(registry);

        let call_id = runtime
            .schedule(
                None,
                "slow",
                json!({"steps": 1000}),
                ToolCaller::Direct,
                &CancelToken::new(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        runtime.control(&call_id, CallAction::Cancel).unwrap();
        let call = runtime.wait_result(&call_id).await.unwrap();
        assert_eq!(call.state, CallState::Cancelled);
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let registry = ToolRegistry::new();
        registry.register(SlowTool);
        let runtime = runtime_with(registry);

        let call_id = runtime
            .schedule(
                None,
                "slow",
                json!({"steps": 10}),
                ToolCaller::Direct,
                &CancelToken::new(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        runtime.control(&call_id, CallAction::Pause).unwrap();
        assert_eq!(
            runtime.get_status(&call_id).unwrap().state,
            CallState::Paused
        );

        runtime.control(&call_id, CallAction::Resume).unwrap();
        let call = runtime.wait_result(&call_id).await.unwrap();
        assert_eq!(call.state, CallState::Succeeded);
    }

    #[tokio::test]
    async fn pause_requires_flag() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool);
        let runtime = runtime_with(registry);

        let call_id = runtime
            .schedule(
                None,
                "echo",
                json!({"message": "x"}),
                ToolCaller::Direct,
                &CancelToken::new(),
            )
            .unwrap();
        let result = runtime.control(&call_id, CallAction::Pause);
        assert!(matches!(result, Err(ToolError::Unsupported { .. })));
        runtime.wait_result(&call_id).await.unwrap();
    }

    #[tokio::test]
    async fn infrastructure_errors_are_retried() {
        let registry = ToolRegistry::new();
        registry.register(FlakyTool {
            failures: std::sync::atomic::AtomicU32::new(2),
        });
        let runtime = runtime_with(registry);

        let output = runtime
            .execute("flaky", json!({}), ToolCaller::Direct, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(output, json!("recovered"));
    }

    #[tokio::test]
    async fn cancel_all_empties_running() {
        let registry = ToolRegistry::new();
        registry.register(SlowTool);
        let runtime = runtime_with(registry);

        for _ in 0..3 {
            runtime
                .schedule(
                    None,
                    "slow",
                    json!({"steps": 1000}),
                    ToolCaller::Direct,
                    &CancelToken::new(),
                )
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        runtime.cancel_all();
        assert!(runtime.drain(Duration::from_secs(2)).await);
        runtime.reap_terminal();
        assert!(runtime.list_running().is_empty());
    }

    #[tokio::test]
    async fn parent_cancel_reaches_calls() {
        let registry = ToolRegistry::new();
        registry.register(SlowTool);
        let runtime = runtime_with(registry);
        let root = CancelToken::new();

        let call_id = runtime
            .schedule(None, "slow", json!({"steps": 1000}), ToolCaller::Direct, &root)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        root.cancel();
        let call = runtime.wait_result(&call_id).await.unwrap();
        assert!(call.state.is_terminal());
    }
}
