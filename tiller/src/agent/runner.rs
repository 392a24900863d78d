//! The reason-act loop.
//!
//! One turn: append the user message, then iterate - build the
//! conversation window, run the middleware onion around a streaming
//! provider call, accumulate chunks into an assistant message, schedule
//! any requested tool calls through the authorization pipeline and the
//! tool runtime, inject results in emission order, and repeat until a
//! terminal condition.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use super::state::AgentState;
use super::{AgentCore, TurnResult, TurnStopReason};
use crate::control::CancelToken;
use crate::error::{Error, Result};
use crate::event::EventPayload;
use crate::message::{ContentBlock, Message};
use crate::middleware::{ModelTerminal, ToolInvocation, ToolTerminal};
use crate::permission::{Authorization, DenialSource};
use crate::provider::{
    ChatRequest, ChunkAggregator, Completion, ProviderError, StreamChunk, with_retry,
};
use crate::sandbox::ViolationAction;
use crate::session::SessionEvent;
use crate::tool::{CallState, ToolCall, ToolCaller, ToolError};
use crate::usage::TokenUsage;

/// A tool-use block lifted out of an assistant message.
struct PendingUse {
    id: String,
    name: String,
    input: Value,
    caller: ToolCaller,
}

/// Run one user turn to completion.
#[instrument(skip_all, fields(agent = %core.agent_id))]
pub(super) async fn run_turn(core: &Arc<AgentCore>, input: String) -> Result<TurnResult> {
    let _guard = core.run_lock.lock().await;

    match core.state.current() {
        AgentState::Created => {
            core.set_state(AgentState::Initializing).await?;
            core.ensure_session().await?;
            core.set_state(AgentState::Ready).await?;
        }
        AgentState::Ready => {
            core.ensure_session().await?;
        }
        other => return Err(Error::invalid_state("chat", other.as_str())),
    }

    // Fresh interrupt scope for this run.
    let interrupt = CancelToken::new();
    *core
        .run_interrupt
        .lock()
        .expect("interrupt lock poisoned") = interrupt.clone();
    core.step_count.store(0, Ordering::SeqCst);

    core.push_message(Message::user(&input)).await?;
    info!("turn started");

    match run_loop(core, &interrupt).await {
        Ok(turn) => {
            let _ = core.state.transition_idempotent(AgentState::Ready);
            info!(
                steps = turn.steps,
                stop_reason = ?turn.stop_reason,
                input_tokens = turn.usage.input_tokens,
                output_tokens = turn.usage.output_tokens,
                "turn completed",
            );
            Ok(turn)
        }
        Err(e) if e.is_fatal() => {
            error!(error = %e, "fatal error; agent failed");
            let _ = core.set_state(AgentState::Failed).await;
            core.publish(&EventPayload::Error {
                message: e.to_string(),
                fatal: true,
            })
            .await;
            core.bus.close().await;
            Err(e)
        }
        Err(e) => {
            warn!(error = %e, "turn failed");
            core.publish(&EventPayload::Error {
                message: e.to_string(),
                fatal: false,
            })
            .await;
            let _ = core.state.transition_idempotent(AgentState::Ready);
            Err(e)
        }
    }
}

fn cancelled_turn(usage: TokenUsage, steps: usize) -> TurnResult {
    TurnResult {
        text: String::new(),
        stop_reason: TurnStopReason::Cancelled,
        usage,
        steps,
    }
}

async fn run_loop(core: &Arc<AgentCore>, interrupt: &CancelToken) -> Result<TurnResult> {
    let mut usage = TokenUsage::zero();
    let mut steps = 0usize;
    let mut gate = core.pause_gate.clone();

    loop {
        // Suspension point: pause gate, then cancellation checks.
        gate.wait_ready().await;
        if core.cancel.is_cancelled() || interrupt.is_cancelled() {
            return Ok(cancelled_turn(usage, steps));
        }
        if steps >= core.config.step_limit {
            debug!(steps, "step budget exhausted");
            return Ok(TurnResult {
                text: String::new(),
                stop_reason: TurnStopReason::StepLimit,
                usage,
                steps,
            });
        }

        core.set_state(AgentState::Thinking).await?;
        steps += 1;
        core.step_count.store(steps, Ordering::SeqCst);

        let request = build_request(core).await;
        let completion = tokio::select! {
            result = model_call(core, request) => result?,
            () = core.cancel.cancelled() => return Ok(cancelled_turn(usage, steps)),
            () = interrupt.cancelled() => return Ok(cancelled_turn(usage, steps)),
        };

        if let Some(step_usage) = completion.usage {
            usage += step_usage;
            core.publish(&EventPayload::TokenUsage { usage: step_usage }).await;
        }

        let uses: Vec<PendingUse> = completion
            .message
            .tool_uses()
            .filter_map(|block| match block {
                ContentBlock::ToolUse {
                    id,
                    name,
                    input,
                    caller,
                } => Some(PendingUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                    caller: *caller,
                }),
                _ => None,
            })
            .collect();

        core.push_message(completion.message.clone()).await?;

        if uses.is_empty() {
            let text = completion.text();
            core.set_state(AgentState::Ready).await?;
            let stop_reason = if text.is_empty() {
                TurnStopReason::Empty
            } else {
                TurnStopReason::Done
            };
            return Ok(TurnResult {
                text,
                stop_reason,
                usage,
                steps,
            });
        }

        core.set_state(AgentState::ExecutingTool).await?;
        let result_blocks = execute_tool_uses(core, uses).await?;
        core.push_message(Message::tool_results(result_blocks)).await?;
    }
}

/// Build the provider request from the agent-visible conversation
/// window.
async fn build_request(core: &Arc<AgentCore>) -> ChatRequest {
    let conversation = core.conversation.lock().await;
    let messages: Vec<Message> = conversation
        .iter()
        .filter(|m| m.is_agent_visible())
        .cloned()
        .collect();
    drop(conversation);

    let mut request = ChatRequest::with_messages(messages).tools(core.registry.specs());
    request.system = core.config.system_prompt.clone();
    request.timeout = core.config.provider_timeout;
    request
}

/// Run the middleware onion around the provider call.
async fn model_call(core: &Arc<AgentCore>, request: ChatRequest) -> Result<Completion> {
    let terminal: ModelTerminal<'_> = &|req| Box::pin(provider_call(core, req));
    core.chain.model_call(request, terminal).await
}

/// Innermost model call: streams chunks (emitting progress events) with
/// transient-failure retry.
async fn provider_call(core: &Arc<AgentCore>, request: ChatRequest) -> Result<Completion> {
    let attempts = core.config.retry.max_retries + 1;
    let outcome = with_retry(core.config.retry, || async {
        let attempt = async {
            if core.provider.capabilities().streaming {
                let mut reader = core.provider.stream(&request).await?;
                let mut aggregator = ChunkAggregator::new();
                while let Some(item) = reader.next().await {
                    match item {
                        Ok(chunk) => {
                            match &chunk {
                                StreamChunk::TextDelta { text } => {
                                    core.publish(&EventPayload::TextChunk { text: text.clone() })
                                        .await;
                                }
                                StreamChunk::ThinkingDelta { text } => {
                                    core.publish(&EventPayload::ThinkingChunk {
                                        text: text.clone(),
                                    })
                                    .await;
                                }
                                _ => {}
                            }
                            aggregator.apply(&chunk);
                        }
                        Err(stream_err) if stream_err.fatal => {
                            return Err(ProviderError::Transient(stream_err.message));
                        }
                        Err(stream_err) => {
                            debug!(error = %stream_err, "skipping per-item stream error");
                        }
                    }
                }
                aggregator.into_completion()
            } else {
                core.provider.complete(&request).await
            }
        };
        match core.config.provider_timeout {
            Some(deadline) => tokio::time::timeout(deadline, attempt)
                .await
                .map_err(|_| ProviderError::Transient("provider call timed out".into()))?,
            None => attempt.await,
        }
    })
    .await;

    outcome.map_err(|e| match e {
        ProviderError::Transient(message) => Error::Transient { message, attempts },
        ProviderError::Permanent(message) => Error::Provider(message),
        ProviderError::TruncatedStream(message) => {
            Error::Provider(format!("stream truncated mid tool-use: {message}"))
        }
    })
}

/// Execute the turn's tool-use blocks concurrently (bounded by the
/// runtime semaphore) and return tool-result blocks in emission order.
async fn execute_tool_uses(
    core: &Arc<AgentCore>,
    uses: Vec<PendingUse>,
) -> Result<Vec<ContentBlock>> {
    let pending: Vec<_> = uses.into_iter().map(|p| run_one_tool(core, p)).collect();
    // join_all preserves input order: results are injected in the order
    // the model emitted the tool-use blocks, regardless of completion
    // order.
    let outcomes = futures::future::join_all(pending).await;
    outcomes.into_iter().collect()
}

async fn run_one_tool(core: &Arc<AgentCore>, pending: PendingUse) -> Result<ContentBlock> {
    let auth = core
        .permissions
        .authorize(
            &core.registry,
            core.sandbox_policy.as_ref(),
            &core.bus,
            &core.agent_id,
            &pending.id,
            &pending.name,
            pending.input.clone(),
            pending.caller,
        )
        .await;

    let (output, is_error) = match auth {
        Authorization::Denied {
            reason,
            record_only,
            source,
        } => {
            if source == DenialSource::Sandbox
                && core.config.violation_action == ViolationAction::DenyAndStop
            {
                return Err(Error::fatal(format!("sandbox policy violation: {reason}")));
            }
            if record_only {
                // Plan mode records the intended call.
                let entry_flags = core
                    .registry
                    .get(&pending.name)
                    .map(|entry| entry.tool.flags())
                    .unwrap_or_default();
                core.append_session(SessionEvent::ToolCalled {
                    call: ToolCall::new(
                        &pending.id,
                        &pending.name,
                        pending.input.clone(),
                        pending.caller,
                        entry_flags,
                    ),
                })
                .await?;
            }
            (Value::String(reason), true)
        }
        Authorization::Approved { input } => {
            let entry_flags = core
                .registry
                .get(&pending.name)
                .map(|entry| entry.tool.flags())
                .unwrap_or_default();
            core.append_session(SessionEvent::ToolCalled {
                call: ToolCall::new(
                    &pending.id,
                    &pending.name,
                    input.clone(),
                    pending.caller,
                    entry_flags,
                ),
            })
            .await?;

            let invocation = ToolInvocation {
                call_id: pending.id.clone(),
                name: pending.name.clone(),
                input,
                caller: pending.caller,
            };
            let terminal: ToolTerminal<'_> = &|inv| {
                let core = Arc::clone(core);
                Box::pin(async move { dispatch_tool(&core, inv).await })
            };
            let outcome = core.chain.tool_call(invocation, terminal).await?;
            (outcome.output, outcome.is_error)
        }
    };

    core.append_session(SessionEvent::ToolResultRecorded {
        call_id: pending.id.clone(),
        output: output.clone(),
        is_error,
    })
    .await?;

    Ok(ContentBlock::tool_result(pending.id, output, is_error))
}

/// Innermost tool call: schedule through the runtime, await the
/// terminal state, and fold failures into tool-result data.
async fn dispatch_tool(
    core: &Arc<AgentCore>,
    invocation: ToolInvocation,
) -> Result<crate::middleware::ToolOutcome> {
    use crate::middleware::ToolOutcome;

    let scheduled = core.runtime.schedule(
        Some(invocation.call_id.clone()),
        &invocation.name,
        invocation.input,
        invocation.caller,
        &core.cancel,
    );
    let call_id = match scheduled {
        Ok(call_id) => call_id,
        Err(e) => {
            return Ok(ToolOutcome {
                output: Value::String(e.to_string()),
                is_error: true,
            });
        }
    };

    match core.runtime.wait_result(&call_id).await {
        Ok(call) => {
            core.runtime.reap(&call_id);
            match call.state {
                CallState::Succeeded => Ok(ToolOutcome {
                    output: call.result.unwrap_or(Value::Null),
                    is_error: false,
                }),
                _ => Ok(ToolOutcome {
                    output: Value::String(
                        call.error.unwrap_or_else(|| "tool failed".into()),
                    ),
                    is_error: true,
                }),
            }
        }
        Err(e) => Ok(ToolOutcome {
            output: Value::String(e.to_string()),
            is_error: true,
        }),
    }
}

/// Direct (out-of-loop) tool execution with full authorization.
pub(super) async fn call_tool_direct(
    core: &Arc<AgentCore>,
    name: &str,
    input: Value,
    caller: ToolCaller,
) -> Result<Value> {
    let call_id = format!("call_{}", uuid::Uuid::new_v4().simple());
    let auth = core
        .permissions
        .authorize(
            &core.registry,
            core.sandbox_policy.as_ref(),
            &core.bus,
            &core.agent_id,
            &call_id,
            name,
            input,
            caller,
        )
        .await;

    match auth {
        Authorization::Denied { reason, .. } => Err(Error::denied(name, reason)),
        Authorization::Approved { input } => core
            .runtime
            .execute(name, input, caller, &core.cancel)
            .await
            .map_err(|e| match e {
                ToolError::Cancelled => Error::tool_execution(name, "cancelled"),
                other => Error::tool_execution(name, other.to_string()),
            }),
    }
}
