//! One turn, end to end: stream events in, approvals and automation in
//! the middle, terminal outputs out.
//!
//! The loop is a single logical stream of cooperative suspension
//! points: decoding, the throttle gap, the settle poll, and approval
//! resolution all yield rather than block, and session state is only
//! ever mutated between suspension points.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{SessionClient, ToolOutputItem, TurnRequest};
use crate::approval::{ApprovalGate, ApprovalRequest, Decision};
use crate::automation::{
    AutomationController, AutomationError, ComputerAction, Phase, RenderSurface,
};
use crate::events::{SessionEvent, SessionEventTx};
use crate::observe::{SessionObserver, TurnRecord};
use crate::session::{Dispatcher, TerminalOutput, TurnPhase};
use drover_protocol::TokenUsage;

/// Executes non-automation tool calls on behalf of the turn loop.
pub trait ToolExecutor: Send {
    fn execute(
        &mut self,
        call_id: &str,
        tool: &str,
        arguments: &Value,
    ) -> impl Future<Output = Result<Value>> + Send;
}

/// Executor for clients that expose no tools beyond automation. Every
/// call fails with a terminal output, never a dangling call.
pub struct NoToolExecutor;

impl ToolExecutor for NoToolExecutor {
    async fn execute(&mut self, _call_id: &str, tool: &str, _arguments: &Value) -> Result<Value> {
        anyhow::bail!("no executor registered for tool {tool}")
    }
}

/// How the turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Failed { code: String, message: String },
    Cancelled,
}

/// Everything the caller needs to render the turn and send the next
/// request.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// Continuation token for the next request, when the server issued
    /// one (this turn or a prior one).
    pub continuation: Option<String>,
    pub final_text: String,
    pub usage: TokenUsage,
    /// One terminal output per initiated call: results, denials, and
    /// synthesized cancellations. [`TurnRequest::next`] carries these.
    pub outputs: Vec<ToolOutputItem>,
    pub activity: Vec<String>,
}

enum Flow {
    Continue,
    Cancelled,
    Fatal { code: String, message: String },
}

/// Runs one turn against the server.
///
/// Returns `Err` only when the request itself cannot be sent; once the
/// stream is open, failures (protocol violations, wire errors,
/// automation failures) come back as [`TurnStatus::Failed`] with the
/// accumulated outputs preserved, so the server-side
/// one-output-per-call contract survives the failure.
pub async fn run_turn<S, E>(
    client: &SessionClient,
    request: TurnRequest,
    gate: &ApprovalGate,
    controller: &mut AutomationController<S>,
    executor: &mut E,
    events: &SessionEventTx,
    observers: &[Box<dyn SessionObserver>],
    cancel: &CancellationToken,
) -> Result<TurnOutcome>
where
    S: RenderSurface,
    E: ToolExecutor,
{
    let mut dispatcher = Dispatcher::new(
        request.continuation.clone(),
        client.config().automation_tool.clone(),
    );
    let mut stream = client.send_turn(&request).await?;
    emit(events, SessionEvent::TurnStarted).await;
    info!("turn stream opened");

    let mut failure: Option<(String, String)> = None;

    'stream: loop {
        let next = tokio::select! {
            () = cancel.cancelled() => {
                return Ok(finish_cancelled(&mut dispatcher, gate, events, observers).await);
            }
            next = stream.next() => next,
        };
        let Some(item) = next else { break };

        let event = match item {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "stream terminated with protocol error");
                failure = Some((err.kind().to_string(), err.message().to_string()));
                break;
            }
        };

        let result = match dispatcher.apply(event) {
            Ok(result) => result,
            Err(err) => {
                failure = Some((err.kind().to_string(), err.message().to_string()));
                break;
            }
        };

        for notice in result.notices {
            match &notice {
                SessionEvent::Activity { line } => {
                    for observer in observers {
                        observer.on_activity(line);
                    }
                }
                SessionEvent::UsageUpdated { usage } => {
                    for observer in observers {
                        observer.on_usage(usage);
                    }
                }
                SessionEvent::TurnFailed { code, message } => {
                    failure = Some((code.clone(), message.clone()));
                }
                _ => {}
            }

            match notice {
                // Delta-grade notices are best-effort: a slow
                // subscriber must not stall the stream.
                SessionEvent::TextUpdated { .. } | SessionEvent::ReasoningUpdated { .. } => {
                    emit_best_effort(events, notice);
                }
                SessionEvent::ApprovalRequired { request } => {
                    // Register before announcing, so a subscriber that
                    // answers immediately finds the gate armed.
                    let rx = gate.register(&request);
                    if let Some(session) = dispatcher.automation_session_mut(&request.call_id) {
                        if session.phase() == Phase::Completed {
                            let _ = session.advance(Phase::Idle);
                        }
                        if session.phase() == Phase::Idle {
                            let _ = session.advance(Phase::AwaitingApproval);
                        }
                    }
                    emit(
                        events,
                        SessionEvent::ApprovalRequired {
                            request: request.clone(),
                        },
                    )
                    .await;
                    match resolve_and_execute(
                        &request,
                        rx,
                        &mut dispatcher,
                        controller,
                        executor,
                        events,
                        cancel,
                    )
                    .await
                    {
                        Flow::Continue => {}
                        Flow::Cancelled => {
                            return Ok(
                                finish_cancelled(&mut dispatcher, gate, events, observers).await
                            );
                        }
                        Flow::Fatal { code, message } => {
                            failure = Some((code, message));
                            break 'stream;
                        }
                    }
                }
                SessionEvent::ToolCallReady {
                    call_id,
                    tool,
                    arguments,
                } => {
                    emit(
                        events,
                        SessionEvent::ToolCallReady {
                            call_id: call_id.clone(),
                            tool: tool.clone(),
                            arguments: arguments.clone(),
                        },
                    )
                    .await;
                    match execute_call(
                        &call_id,
                        &tool,
                        &arguments,
                        &mut dispatcher,
                        controller,
                        executor,
                        events,
                    )
                    .await
                    {
                        Flow::Continue => {}
                        Flow::Cancelled => {
                            return Ok(
                                finish_cancelled(&mut dispatcher, gate, events, observers).await
                            );
                        }
                        Flow::Fatal { code, message } => {
                            failure = Some((code, message));
                            break 'stream;
                        }
                    }
                }
                other => emit(events, other).await,
            }
        }
    }

    let status = if let Some((code, message)) = failure {
        abandon_in_flight(&mut dispatcher, gate, events).await;
        TurnStatus::Failed { code, message }
    } else {
        match dispatcher.state().phase() {
            TurnPhase::Completed => TurnStatus::Completed,
            // The decoder surfaces closure-without-terminal as an
            // error, so these arms only matter if it ever regresses.
            TurnPhase::Streaming | TurnPhase::Failed => TurnStatus::Failed {
                code: "incomplete_turn".to_string(),
                message: "stream ended without a terminal event".to_string(),
            },
        }
    };

    Ok(build_outcome(status, &dispatcher, observers))
}

/// Awaits the approval decision for one call, then executes or
/// finalizes it.
async fn resolve_and_execute<S, E>(
    request: &ApprovalRequest,
    rx: oneshot::Receiver<Decision>,
    dispatcher: &mut Dispatcher,
    controller: &mut AutomationController<S>,
    executor: &mut E,
    events: &SessionEventTx,
    cancel: &CancellationToken,
) -> Flow
where
    S: RenderSurface,
    E: ToolExecutor,
{
    let decision = tokio::select! {
        () = cancel.cancelled() => return Flow::Cancelled,
        decision = rx => decision,
    };

    match decision {
        Ok(Decision::Approved) => {
            let Some((tool, arguments)) = dispatcher
                .state()
                .call(&request.call_id)
                .map(|c| (c.tool.clone(), c.arguments.clone().unwrap_or(Value::Null)))
            else {
                warn!(call_id = %request.call_id, "approved call is unknown");
                return Flow::Continue;
            };
            execute_call(
                &request.call_id,
                &tool,
                &arguments,
                dispatcher,
                controller,
                executor,
                events,
            )
            .await
        }
        Ok(Decision::Denied) => {
            info!(call_id = %request.call_id, "approval denied by user");
            // A denied approval is terminal for the automation session
            // and a valid terminal outcome for the call.
            let _ = dispatcher.take_automation(&request.call_id);
            finish_call(
                dispatcher,
                events,
                &request.call_id,
                TerminalOutput::Denied {
                    reason: "user declined the action".to_string(),
                },
            )
            .await;
            Flow::Continue
        }
        // The sender was dropped: the request was abandoned.
        Err(_) => Flow::Cancelled,
    }
}

/// Executes one ready call to its terminal output.
async fn execute_call<S, E>(
    call_id: &str,
    tool: &str,
    arguments: &Value,
    dispatcher: &mut Dispatcher,
    controller: &mut AutomationController<S>,
    executor: &mut E,
    events: &SessionEventTx,
) -> Flow
where
    S: RenderSurface,
    E: ToolExecutor,
{
    let is_automation = dispatcher
        .state()
        .call(call_id)
        .is_some_and(|c| c.is_automation);

    if !is_automation {
        let output = match executor.execute(call_id, tool, arguments).await {
            Ok(data) => TerminalOutput::Success {
                data,
                capture: None,
            },
            Err(err) => TerminalOutput::Failure {
                code: "tool_error".to_string(),
                message: err.to_string(),
            },
        };
        finish_call(dispatcher, events, call_id, output).await;
        return Flow::Continue;
    }

    let action: ComputerAction = match serde_json::from_value(arguments.clone()) {
        Ok(action) => action,
        Err(err) => {
            finish_call(
                dispatcher,
                events,
                call_id,
                TerminalOutput::Failure {
                    code: "invalid_action".to_string(),
                    message: format!("unparseable computer action: {err}"),
                },
            )
            .await;
            return Flow::Continue;
        }
    };

    match run_automation(call_id, &action, dispatcher, controller).await {
        Ok(output) => {
            let _ = dispatcher.take_automation(call_id);
            finish_call(dispatcher, events, call_id, output).await;
            Flow::Continue
        }
        Err(err) => {
            // The failure still produces a terminal output for the
            // call before it surfaces.
            let _ = dispatcher.take_automation(call_id);
            finish_call(
                dispatcher,
                events,
                call_id,
                TerminalOutput::Failure {
                    code: err.kind().to_string(),
                    message: err.message().to_string(),
                },
            )
            .await;
            Flow::Fatal {
                code: "automation_failure".to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Drives one computer action, then captures the resulting surface so
/// the model sees what it acted on.
async fn run_automation<S: RenderSurface>(
    call_id: &str,
    action: &ComputerAction,
    dispatcher: &mut Dispatcher,
    controller: &mut AutomationController<S>,
) -> Result<TerminalOutput, AutomationError> {
    let Some(session) = dispatcher.automation_session_mut(call_id) else {
        return Err(AutomationError::abandoned());
    };

    let mut result = controller.execute(action, session).await?;
    if result.capture.is_none() && !matches!(action, ComputerAction::Wait { .. }) {
        result = controller.execute(&ComputerAction::Screenshot, session).await?;
    }

    let capture = result
        .capture
        .as_ref()
        .map(|bytes| format!("capture://{}?bytes={}", Uuid::new_v4(), bytes.len()));
    Ok(TerminalOutput::Success {
        data: json!({ "action": action.to_string() }),
        capture,
    })
}

/// Records a call's terminal output and tells subscribers about it.
async fn finish_call(
    dispatcher: &mut Dispatcher,
    events: &SessionEventTx,
    call_id: &str,
    output: TerminalOutput,
) {
    if !dispatcher.record_output(call_id, output.clone()) {
        warn!(call_id = %call_id, "output for unknown or already-finished call");
        return;
    }
    emit(
        events,
        SessionEvent::ToolCallFinished {
            call_id: call_id.to_string(),
            output,
        },
    )
    .await;
}

/// Marks in-flight work abandoned and synthesizes outputs so no call
/// dangles.
async fn abandon_in_flight(
    dispatcher: &mut Dispatcher,
    gate: &ApprovalGate,
    events: &SessionEventTx,
) {
    gate.abandon_all();
    dispatcher.fail_automation_sessions();
    for call_id in dispatcher.cancel_dangling_calls() {
        emit(
            events,
            SessionEvent::ToolCallFinished {
                call_id,
                output: TerminalOutput::Cancelled,
            },
        )
        .await;
    }
}

async fn finish_cancelled(
    dispatcher: &mut Dispatcher,
    gate: &ApprovalGate,
    events: &SessionEventTx,
    observers: &[Box<dyn SessionObserver>],
) -> TurnOutcome {
    info!("turn cancelled by caller");
    abandon_in_flight(dispatcher, gate, events).await;
    emit(events, SessionEvent::Cancelled).await;
    build_outcome(TurnStatus::Cancelled, dispatcher, observers)
}

fn build_outcome(
    status: TurnStatus,
    dispatcher: &Dispatcher,
    observers: &[Box<dyn SessionObserver>],
) -> TurnOutcome {
    let state = dispatcher.state();
    let outputs = state
        .calls()
        .iter()
        .filter_map(|call| {
            call.output.clone().map(|output| ToolOutputItem {
                call_id: call.call_id.clone(),
                output,
            })
        })
        .collect();

    let outcome = TurnOutcome {
        status,
        continuation: state.continuation().map(str::to_string),
        final_text: state.final_text(),
        usage: state.usage(),
        outputs,
        activity: state.activity().iter().map(str::to_string).collect(),
    };

    let record = TurnRecord {
        continuation: outcome.continuation.clone(),
        final_text: outcome.final_text.clone(),
        usage: outcome.usage,
        completed_at: Utc::now(),
    };
    for observer in observers {
        observer.on_turn_record(&record);
    }

    outcome
}

async fn emit(events: &SessionEventTx, event: SessionEvent) {
    // A dropped receiver is fine: subscribers are optional.
    let _ = events.send(Arc::new(event)).await;
}

fn emit_best_effort(events: &SessionEventTx, event: SessionEvent) {
    let _ = events.try_send(Arc::new(event));
}
