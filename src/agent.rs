//! Multi-turn agent loop: model turn → (review) → tool execution → model turn,
//! until the model stops calling tools, the iteration cap is hit, or the
//! caller cancels.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::approval::{
    blocking_reason, introduced_findings, project_batch, ApprovalDecision, ApprovalRequest, Approver,
    AutoApprove,
};
use crate::audit::{AuditLog, AuditRecord};
use crate::chat::{
    ChatEmitter, ChatMessage, ContentBlock, Conversation, ModelResponse, NoopChatEmitter, ToolCall,
};
use crate::error::BridgeError;
use crate::llm::{ModelClient, ModelRequest};
use crate::registry::{HandlerKind, Registry, ToolContext};
use crate::security;

const BASE_PROMPT: &str = "You are a scene-editing assistant connected to a live rendering engine. \
Use the provided tools to inspect and change the scene. Entity ids look like \"e12\"; look them up \
with get_scene_graph or find_entities before editing. Every edit is undoable. Call help for \
details about a command. Keep replies short and say what you changed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts-bindings", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts-bindings", ts(export))]
pub enum AgentState {
    Idle,
    AwaitingModel,
    ExecutingTools,
    AwaitingApproval,
    Done,
    Cancelled,
    Errored,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Errored)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultRecord {
    pub tool_use_id: String,
    pub command: String,
    pub content: String,
    pub is_error: bool,
}

/// One model turn and the tool calls it produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTurn {
    pub model_output: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResultRecord>,
}

/// How a `send_message` run ended.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutcome {
    pub state: AgentState,
    pub turns: Vec<AgentTurn>,
    /// Text of the final model turn.
    pub reply: String,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeError>,
}

/// Why tool execution stopped before the batch finished.
enum Interrupt {
    Cancelled,
    Fatal(BridgeError),
}

pub struct AgentLoop {
    registry: Arc<Registry>,
    ctx: ToolContext,
    model: Arc<dyn ModelClient>,
    approver: Arc<dyn Approver>,
    emitter: Arc<dyn ChatEmitter>,
    audit: AuditLog,
    conversation: Conversation,
    state: AgentState,
    system_prompt: String,
}

impl AgentLoop {
    pub fn new(registry: Arc<Registry>, ctx: ToolContext, model: Arc<dyn ModelClient>) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            registry,
            ctx,
            model,
            approver: Arc::new(AutoApprove),
            emitter: Arc::new(NoopChatEmitter),
            audit: AuditLog::disabled(),
            conversation: Conversation::new(format!("conv-{millis}")),
            state: AgentState::Idle,
            system_prompt: BASE_PROMPT.to_string(),
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn ChatEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn clear(&mut self) {
        self.conversation.clear();
        self.set_state(AgentState::Idle);
    }

    fn set_state(&mut self, state: AgentState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "agent state");
            self.state = state;
            self.emitter.emit_state(state);
        }
    }

    fn prompt(&self) -> String {
        let (entities, scripts) = self
            .ctx
            .store()
            .with_state(|s| (s.scene.nodes.len(), s.scripts.len()));
        format!(
            "{}\n\nCurrent scene: {entities} entities, {scripts} scripts.",
            self.system_prompt
        )
    }

    /// Run one user message to completion. Never panics on model, engine or
    /// reviewer failures; the terminal state says how it ended.
    pub async fn send_message(&mut self, text: &str, cancel: CancellationToken) -> AgentOutcome {
        self.conversation.push(ChatMessage::user(text));
        let ctx = self.ctx.with_cancel(cancel.clone());
        let tools = self.registry.catalog().to_llm_tools();
        let max_iterations = self.ctx.settings().agent.max_iterations;
        let mut turns: Vec<AgentTurn> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return self.finish(AgentState::Cancelled, turns, false, None);
            }
            if turns.len() >= max_iterations {
                let notice = format!(
                    "Stopped after {max_iterations} tool round(s) without finishing. \
                     Ask me to continue if more work is needed."
                );
                self.conversation
                    .push(ChatMessage::assistant(vec![ContentBlock::Text { text: notice.clone() }]));
                self.emitter.emit_token(&notice);
                tracing::info!(max_iterations, "agent loop truncated");
                return self.finish(AgentState::Done, turns, true, None);
            }

            self.set_state(AgentState::AwaitingModel);
            let prompt = self.prompt();
            let response: Result<ModelResponse, BridgeError> = {
                let request = ModelRequest {
                    system: &prompt,
                    messages: self.conversation.messages(),
                    tools: &tools,
                };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(BridgeError::Cancelled),
                    r = self.model.complete(request) => r,
                }
            };
            let response = match response {
                Ok(r) => r,
                Err(BridgeError::Cancelled) => {
                    return self.finish(AgentState::Cancelled, turns, false, None);
                }
                Err(e) => {
                    self.emitter.emit_error(&e.to_string());
                    return self.finish(AgentState::Errored, turns, false, Some(e));
                }
            };

            let model_output = response.text();
            if !model_output.is_empty() {
                self.emitter.emit_token(&model_output);
            }
            let calls = response.tool_calls();
            self.conversation.push(ChatMessage::assistant(response.blocks));

            if calls.is_empty() {
                turns.push(AgentTurn {
                    model_output,
                    tool_calls: Vec::new(),
                    tool_results: Vec::new(),
                });
                return self.finish(AgentState::Done, turns, false, None);
            }

            let turn_no = turns.len() + 1;
            let (mut results, interrupt) = self.execute_batch(&ctx, &calls, turn_no, &cancel).await;

            // Every tool_use needs a tool_result, even when the batch stopped early.
            let filler = match &interrupt {
                Some(Interrupt::Cancelled) => "Cancelled before this call ran".to_string(),
                Some(Interrupt::Fatal(e)) => format!("Not run: {e}"),
                None => String::new(),
            };
            for call in calls.iter().skip(results.len()) {
                results.push(ToolResultRecord {
                    tool_use_id: call.id.clone(),
                    command: call.name.clone(),
                    content: filler.clone(),
                    is_error: true,
                });
            }
            self.conversation.push(ChatMessage::tool_results(
                results
                    .iter()
                    .map(|r| ContentBlock::ToolResult {
                        tool_use_id: r.tool_use_id.clone(),
                        content: r.content.clone(),
                        is_error: r.is_error,
                    })
                    .collect(),
            ));
            turns.push(AgentTurn {
                model_output,
                tool_calls: calls,
                tool_results: results,
            });

            match interrupt {
                None => {}
                Some(Interrupt::Cancelled) => {
                    return self.finish(AgentState::Cancelled, turns, false, None);
                }
                Some(Interrupt::Fatal(e)) => {
                    self.emitter.emit_error(&e.to_string());
                    return self.finish(AgentState::Errored, turns, false, Some(e));
                }
            }
        }
    }

    fn finish(
        &mut self,
        state: AgentState,
        turns: Vec<AgentTurn>,
        truncated: bool,
        error: Option<BridgeError>,
    ) -> AgentOutcome {
        self.set_state(state);
        if state == AgentState::Done {
            self.emitter.emit_complete(truncated);
        }
        let reply = turns.last().map(|t| t.model_output.clone()).unwrap_or_default();
        tracing::info!(state = ?state, turns = turns.len(), truncated, "agent run finished");
        AgentOutcome {
            state,
            turns,
            reply,
            truncated,
            error,
        }
    }

    /// Review (when required) and run one batch of tool calls in order.
    async fn execute_batch(
        &mut self,
        ctx: &ToolContext,
        calls: &[ToolCall],
        turn: usize,
        cancel: &CancellationToken,
    ) -> (Vec<ToolResultRecord>, Option<Interrupt>) {
        self.set_state(AgentState::ExecutingTools);

        let needs_review = self.ctx.settings().agent.approval_mode
            && calls
                .iter()
                .any(|c| self.registry.kind_of(&c.name) != Some(HandlerKind::Query));
        if needs_review {
            self.set_state(AgentState::AwaitingApproval);
            let rules = &self.ctx.settings().security;
            let current = self.ctx.store().with_state(Clone::clone);
            let report = security::validate(&current.scene, &current.scripts, rules);
            // Only findings the batch would add can block it, so a batch that
            // cleans up an existing problem still goes through.
            let projected = project_batch(&current, calls);
            let after = security::validate(&projected.scene, &projected.scripts, rules);
            let blocked = blocking_reason(&introduced_findings(&report, &after), rules);
            let request = ApprovalRequest {
                conversation_id: self.conversation.id.clone(),
                turn,
                calls: calls.to_vec(),
                report,
            };
            self.emitter.emit_approval(&request);

            let decision = match blocked {
                Some(reason) => ApprovalDecision::Reject { reason },
                None => tokio::select! {
                    biased;
                    () = cancel.cancelled() => return (Vec::new(), Some(Interrupt::Cancelled)),
                    d = self.approver.review(request) => d,
                },
            };
            if let ApprovalDecision::Reject { reason } = decision {
                tracing::info!(turn, %reason, "tool batch rejected");
                let results = calls
                    .iter()
                    .map(|call| {
                        let content = format!("Rejected: {reason}. Nothing was changed.");
                        self.record(call, turn, Err(&content), Instant::now());
                        ToolResultRecord {
                            tool_use_id: call.id.clone(),
                            command: call.name.clone(),
                            content,
                            is_error: true,
                        }
                    })
                    .collect();
                self.set_state(AgentState::ExecutingTools);
                return (results, None);
            }
            self.set_state(AgentState::ExecutingTools);
        }

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if cancel.is_cancelled() {
                return (results, Some(Interrupt::Cancelled));
            }
            self.emitter.emit_tool_call(&call.name, &call.input);
            let started = Instant::now();
            // Not raced here: `ctx` carries the token, and dropping a commit
            // midway would skip its local revert.
            let outcome = match self.registry.invoke(&call.name, call.input.clone(), ctx).await {
                Ok(o) => o,
                Err(e) => {
                    let message = e.to_string();
                    self.record(call, turn, Err(&message), started);
                    return (results, Some(Interrupt::Fatal(e)));
                }
            };
            if matches!(outcome.error, Some(BridgeError::Cancelled)) {
                return (results, Some(Interrupt::Cancelled));
            }

            let (content, is_error) = outcome.render_for_model();
            let result = if is_error { Err(content.as_str()) } else { Ok(content.as_str()) };
            self.record(call, turn, result, started);
            self.emitter.emit_tool_result(&call.name, &content, is_error);
            results.push(ToolResultRecord {
                tool_use_id: call.id.clone(),
                command: call.name.clone(),
                content,
                is_error,
            });
        }
        (results, None)
    }

    fn record(&self, call: &ToolCall, turn: usize, result: Result<&str, &str>, started: Instant) {
        self.audit.record(&AuditRecord {
            conversation_id: Some(&self.conversation.id),
            turn,
            tool: &call.name,
            input: &call.input,
            result,
            duration: started.elapsed(),
        });
    }
}
