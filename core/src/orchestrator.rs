// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! The turn loop: a step-bounded ReAct driver between the provider and the
//! tool registry.
//!
//! One user turn is a sequence of provider calls and tool executions with
//! strict ordering. Every proposed tool call runs through the layered
//! pipeline: active-agent gate → permission policy → tool-level approval
//! request → human approval callback → execution. Denied and errored calls
//! still materialize as `tool` messages so the strict call/result pairing
//! the provider demands is never broken; only cancellation unwinds the turn
//! without appending.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::agent::AgentProfile;
use crate::agent::mode;
use crate::client_common::CompletedResponse;
use crate::client_common::Prompt;
use crate::client_common::Provider;
use crate::client_common::StreamEvent;
use crate::client_common::provider_retry_delay;
use crate::compact::CompactionStrategy;
use crate::compact::FallbackStrategy;
use crate::compact::LlmStrategy;
use crate::compact::compact;
use crate::config::Config;
use crate::context::ContextAssembler;
use crate::error::CoderErr;
use crate::error::Result;
use crate::models::Message;
use crate::models::ToolCall;
use crate::permissions::PermissionPolicy;
use crate::permissions::PermissionRule;
use crate::session::Session;
use crate::session::SessionMeta;
use crate::store::PermissionLogEntry;
use crate::store::Store;
use crate::tag_recovery::recover_tool_calls;
use crate::todo::TodoItem;
use crate::todo::TodoStore;
use crate::todo::bootstrap_todos;
use crate::todo::is_complex_input;
use crate::tokens::HeuristicCounter;
use crate::tokens::TokenCounter;
use crate::tools::ApprovalRequest;
use crate::tools::MUTATING_TOOLS;
use crate::tools::ToolContext;
use crate::tools::ToolRegistry;
use crate::transcript::TranscriptFile;
use crate::undo::TurnRecorder;
use crate::undo::UndoStack;
use crate::verify::is_environment_failure;
use crate::verify::needs_verification;
use crate::verify::select_verify_command;
use crate::workspace::Workspace;

/// Provider turn retries (on top of HTTP-level retries in the client).
const PROVIDER_TURN_RETRIES: u64 = 3;

/// Events a renderer can subscribe to while a turn runs.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    Started {
        call_id: String,
        name: String,
        args_summary: String,
    },
    Finished {
        call_id: String,
        name: String,
        ok: bool,
    },
    Denied {
        call_id: String,
        name: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ContextStats {
    pub messages: usize,
    pub estimated_tokens: usize,
    pub token_limit: usize,
}

/// Renderer callbacks. All methods default to no-ops so a front end only
/// implements what it renders.
pub trait TurnSink: Send {
    fn on_answer_delta(&mut self, _text: &str) {}
    fn on_reasoning_delta(&mut self, _text: &str) {}
    fn on_tool_event(&mut self, _event: &ToolEvent) {}
    fn on_todo_update(&mut self, _todos: &[TodoItem]) {}
    fn on_context_update(&mut self, _stats: &ContextStats) {}
    /// Out-of-band blocks such as `[COMMAND]` in bang mode.
    fn on_notice(&mut self, _text: &str) {}
}

/// Sink that renders nothing.
pub struct NullSink;
impl TurnSink for NullSink {}

/// Human decision point. Called at most once per tool call; never
/// concurrently within one turn.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn on_approval(
        &self,
        request: &ApprovalRequest,
        cancel: &CancellationToken,
    ) -> Result<bool>;
}

/// Rejects everything; the headless default.
pub struct DenyAllApprovals;

#[async_trait]
impl ApprovalHandler for DenyAllApprovals {
    async fn on_approval(
        &self,
        _request: &ApprovalRequest,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(false)
    }
}

pub struct Orchestrator {
    pub(crate) config: Config,
    workspace: Arc<Workspace>,
    registry: ToolRegistry,
    policy: PermissionPolicy,
    provider: Arc<dyn Provider>,
    approval: Arc<dyn ApprovalHandler>,
    store: Option<Arc<dyn Store>>,
    transcript: TranscriptFile,
    assembler: ContextAssembler,
    counter: Arc<dyn TokenCounter>,
    compaction_strategy: Arc<dyn CompactionStrategy>,
    pub(crate) session: Session,
    todos: Arc<Mutex<TodoStore>>,
    pub(crate) undo_stack: UndoStack,
    pub(crate) agent: AgentProfile,
    pub(crate) mode_name: String,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        provider: Arc<dyn Provider>,
        approval: Arc<dyn ApprovalHandler>,
    ) -> Result<Self> {
        let workspace = Arc::new(Workspace::new(&config.cwd)?);
        let mode = match mode(&config.mode) {
            Some(mode) => mode,
            None => {
                warn!("unknown mode `{}`, falling back to build", config.mode);
                crate::agent::Mode {
                    name: "build",
                    agent: AgentProfile::build(),
                    permission_preset: "build",
                }
            }
        };
        let mut policy = PermissionPolicy::default();
        policy.apply_preset(mode.permission_preset);

        let session = Session::new(SessionMeta {
            agent: mode.agent.name.clone(),
            model: config.model.clone(),
            cwd: workspace.root().to_path_buf(),
            title: None,
        });
        let transcript = TranscriptFile::new(workspace.root(), &session.id);
        let assembler = ContextAssembler::new(&config, &workspace);
        let compaction_strategy: Arc<dyn CompactionStrategy> = Arc::new(FallbackStrategy::new(
            LlmStrategy::new(Arc::clone(&provider), config.model.clone()),
        ));

        Ok(Self {
            workspace,
            registry: ToolRegistry::builtin(),
            policy,
            provider,
            approval,
            store: None,
            transcript,
            assembler,
            counter: Arc::new(HeuristicCounter),
            compaction_strategy,
            session,
            todos: Arc::new(Mutex::new(TodoStore::default())),
            undo_stack: UndoStack::default(),
            agent: mode.agent,
            mode_name: mode.name.to_string(),
            config,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_compaction_strategy(mut self, strategy: Arc<dyn CompactionStrategy>) -> Self {
        self.compaction_strategy = strategy;
        self
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutable config access for between-turn adjustments (model switch,
    /// workflow knobs). Never call while a turn is running.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn current_todos(&self) -> Vec<TodoItem> {
        self.todos.lock().unwrap().list(&self.session.id)
    }

    /// Switch mode between turns: agent profile and permission preset move
    /// together.
    pub fn set_mode(&mut self, name: &str) -> bool {
        let Some(mode) = mode(name) else {
            return false;
        };
        self.policy.apply_preset(mode.permission_preset);
        self.agent = mode.agent;
        self.mode_name = mode.name.to_string();
        self.session.meta.agent = self.mode_name.clone();
        true
    }

    pub fn apply_permission_preset(&mut self, name: &str) -> bool {
        self.policy.apply_preset(name)
    }

    pub fn policy_preset_name(&self) -> String {
        self.policy.preset().to_string()
    }

    /// Dispatch one line of user input: slash command, bang command, or a
    /// full model turn.
    pub async fn run_input(
        &mut self,
        input: &str,
        sink: &mut dyn TurnSink,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let trimmed = input.trim();
        if let Some(rest) = trimmed.strip_prefix('/') {
            return self.handle_slash(rest).await;
        }
        if let Some(rest) = trimmed.strip_prefix('!') {
            return self.run_bang(rest.trim(), sink, cancel).await;
        }
        self.run_turn(trimmed, sink, cancel).await
    }

    /// Bang mode: the command goes through the same policy and approval
    /// pipeline as a model-issued bash call.
    async fn run_bang(
        &mut self,
        command: &str,
        sink: &mut dyn TurnSink,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.session.append_message(Message::user(format!("!{command}")));

        if !self.agent.allows("bash") {
            let text = CoderErr::CommandModeDenied {
                agent: self.agent.name.clone(),
            }
            .to_string();
            self.session.append_message(Message::assistant(text.clone()));
            self.flush();
            return Ok(text);
        }

        sink.on_notice(&format!("[COMMAND] $ {command}"));
        let call = ToolCall::function(
            format!("bang-{}", uuid::Uuid::new_v4()),
            "bash",
            json!({"command": command}).to_string(),
        );
        self.session
            .append_message(Message::assistant_with_calls("", None, vec![call.clone()]));

        let mut recorder = TurnRecorder::default();
        let mut edited = Vec::new();
        let outcome = self
            .handle_tool_call(&call, sink, cancel, &mut recorder, &mut edited)
            .await;
        self.flush();
        outcome?;

        let text = self
            .session
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(text)
    }

    /// One full ReAct turn.
    pub async fn run_turn(
        &mut self,
        user_input: &str,
        sink: &mut dyn TurnSink,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // On cancellation the whole turn unwinds: everything after the user
        // message is rolled back so no half-resolved tool call survives.
        let baseline = self.session.messages.len() + 1;
        let mut recorder = TurnRecorder::default();
        let result = self
            .turn_loop(user_input, sink, cancel, &mut recorder)
            .await;
        if matches!(result, Err(CoderErr::Interrupted)) {
            self.session.truncate_messages(baseline);
            self.flush();
        }
        // Deferred commit: snapshots are pushed whether the turn finished,
        // failed, or was cancelled, so /undo always covers what ran.
        if !recorder.is_empty() {
            self.undo_stack.push(recorder.into_snapshots());
        }
        result
    }

    async fn turn_loop(
        &mut self,
        user_input: &str,
        sink: &mut dyn TurnSink,
        cancel: &CancellationToken,
        recorder: &mut TurnRecorder,
    ) -> Result<String> {
        self.session.append_message(Message::user(user_input));
        self.flush();
        self.emit_context_update(sink);
        self.refresh_todos(sink);

        self.maybe_bootstrap_todos(user_input, sink).await;

        let mut edited: Vec<PathBuf> = Vec::new();
        let mut verify_attempts = 0usize;
        let mut last_content = String::new();

        for step in 0..self.agent.max_steps {
            if cancel.is_cancelled() {
                return Err(CoderErr::Interrupted);
            }

            self.maybe_compact(sink).await;

            let prompt = Prompt {
                model: self.config.model.clone(),
                messages: self.provider_messages(),
                tools: if step == 0 && is_chatty_greeting(user_input) {
                    Vec::new()
                } else {
                    self.tool_definitions()
                },
            };

            let response = self.call_provider(&prompt, sink, cancel).await?;

            let mut content = response.content;
            let mut tool_calls = response.tool_calls;

            // Recovery: some models emit tagged calls inside content instead
            // of structured tool_calls.
            if tool_calls.is_empty() {
                if let Some(recovered) = recover_tool_calls(&content, &self.enabled_tool_names())
                {
                    debug!("recovered {} tagged tool calls", recovered.calls.len());
                    content = recovered.cleaned_content;
                    tool_calls = recovered.calls;
                }
            }

            self.session.append_message(Message::assistant_with_calls(
                content.clone(),
                response.reasoning,
                tool_calls.clone(),
            ));
            self.flush();
            last_content = content.clone();

            if tool_calls.is_empty() {
                if verify_attempts < self.config.workflow.max_verify_attempts {
                    verify_attempts += 1;
                    let verdict = self.auto_verify(&edited, sink, cancel).await?;
                    if let VerifyOutcome::Retry(hint) = verdict {
                        self.session.append_message(Message::user(hint));
                        self.flush();
                        continue;
                    }
                }
                self.refresh_todos(sink);
                return Ok(content);
            }

            for call in &tool_calls {
                if cancel.is_cancelled() {
                    return Err(CoderErr::Interrupted);
                }
                self.handle_tool_call(call, sink, cancel, recorder, &mut edited)
                    .await?;
            }
        }

        if cancel.is_cancelled() {
            return Err(CoderErr::Interrupted);
        }
        Err(CoderErr::StepLimitReached {
            steps: self.agent.max_steps,
            last_content,
        })
    }

    /// Streamed provider call with turn-level retries.
    async fn call_provider(
        &self,
        prompt: &Prompt,
        sink: &mut dyn TurnSink,
        cancel: &CancellationToken,
    ) -> Result<CompletedResponse> {
        let mut attempt: u64 = 0;
        loop {
            match self.try_call_provider(prompt, sink, cancel).await {
                Ok(response) => return Ok(response),
                Err(CoderErr::Interrupted) => return Err(CoderErr::Interrupted),
                Err(e @ CoderErr::EnvVar { .. }) => return Err(e),
                Err(e) => {
                    if attempt >= PROVIDER_TURN_RETRIES {
                        return Err(e);
                    }
                    warn!(
                        "provider call failed (attempt {}): {e}; retrying",
                        attempt + 1
                    );
                    tokio::time::sleep(provider_retry_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_call_provider(
        &self,
        prompt: &Prompt,
        sink: &mut dyn TurnSink,
        cancel: &CancellationToken,
    ) -> Result<CompletedResponse> {
        let mut stream = self.provider.stream(prompt).await?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoderErr::Interrupted),
                event = stream.next() => match event {
                    Some(Ok(StreamEvent::TextDelta(text))) => sink.on_answer_delta(&text),
                    Some(Ok(StreamEvent::ReasoningDelta(text))) => sink.on_reasoning_delta(&text),
                    Some(Ok(StreamEvent::Completed(response))) => return Ok(response),
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(CoderErr::Stream(
                            "stream ended without completion".to_string(),
                            None,
                        ));
                    }
                }
            }
        }
    }

    /// The layered pipeline for one tool call. Appends exactly one `tool`
    /// message unless the turn is cancelled mid-execution.
    async fn handle_tool_call(
        &mut self,
        call: &ToolCall,
        sink: &mut dyn TurnSink,
        cancel: &CancellationToken,
        recorder: &mut TurnRecorder,
        edited: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let name = call.function.name.clone();
        sink.on_tool_event(&ToolEvent::Started {
            call_id: call.id.clone(),
            name: name.clone(),
            args_summary: summarize_args(&call.function.arguments),
        });

        // Arguments must at least be JSON before anything else runs.
        let args: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(args) => args,
            Err(e) => {
                self.append_tool_result(
                    call,
                    json!({"ok": false, "error": format!("invalid arguments: {e}")}).to_string(),
                    sink,
                );
                return Ok(());
            }
        };

        // Active-agent gate.
        if !self.agent.allows(&name) {
            self.append_denied(call, &format!("tool `{name}` is disabled for this agent"), sink);
            return Ok(());
        }

        if !self.registry.has(&name) {
            self.append_tool_result(
                call,
                json!({"ok": false, "error": format!("unsupported call: {name}")}).to_string(),
                sink,
            );
            return Ok(());
        }

        // Permission policy.
        let decision = self.policy.decide(&name, Some(&args));
        self.log_permission(&name, &decision);
        if decision.rule == PermissionRule::Deny {
            let reason = decision
                .reason
                .unwrap_or_else(|| "denied by policy".to_string());
            self.append_denied(call, &reason, sink);
            return Ok(());
        }

        // Tool-level approval demand, joined with the policy's `ask`.
        let ctx = self.tool_context(cancel);
        let tool_request = self.registry.approval_request(&ctx, &name, &args);
        if decision.rule == PermissionRule::Ask || tool_request.is_some() {
            let mut reasons: Vec<String> = Vec::new();
            if decision.rule == PermissionRule::Ask {
                reasons.push(
                    decision
                        .reason
                        .clone()
                        .unwrap_or_else(|| "policy requires confirmation".to_string()),
                );
            }
            if let Some(request) = &tool_request {
                if !reasons.contains(&request.reason) {
                    reasons.push(request.reason.clone());
                }
            }
            let request = ApprovalRequest {
                tool: name.clone(),
                reason: reasons.join("; "),
                raw_args: args.clone(),
            };
            let approved = self.approval.on_approval(&request, cancel).await;
            match approved {
                Ok(true) => {}
                Ok(false) => {
                    self.append_denied(call, "rejected by user", sink);
                    return Ok(());
                }
                Err(_) if cancel.is_cancelled() => return Err(CoderErr::Interrupted),
                Err(e) => {
                    self.append_denied(call, &format!("approval unavailable: {e}"), sink);
                    return Ok(());
                }
            }
        }

        // Undo snapshots before any byte changes.
        let affected = if MUTATING_TOOLS.contains(&name.as_str()) {
            let affected = self.registry.affected_paths(&ctx, &name, &args);
            for path in &affected {
                recorder.capture(path);
            }
            affected
        } else {
            Vec::new()
        };

        let executed = self.registry.execute(&ctx, &name, args).await;
        match executed {
            Ok(result) => {
                self.append_tool_result(call, result, sink);
                if !affected.is_empty() {
                    edited.extend(affected);
                }
                if name == "todowrite" || name == "todoread" {
                    self.refresh_todos(sink);
                    self.persist_todos();
                }
            }
            Err(_) if cancel.is_cancelled() => {
                // Cancellation never materializes a tool message; the whole
                // turn unwinds and the pairing invariant holds because the
                // assistant call is unwound with it.
                return Err(CoderErr::Interrupted);
            }
            Err(e) => {
                self.append_tool_result(
                    call,
                    json!({"ok": false, "error": e.to_string()}).to_string(),
                    sink,
                );
            }
        }
        Ok(())
    }

    /// Run the verification command after an edited turn; decide whether the
    /// failure warrants another model round.
    async fn auto_verify(
        &mut self,
        edited: &[PathBuf],
        sink: &mut dyn TurnSink,
        cancel: &CancellationToken,
    ) -> Result<VerifyOutcome> {
        if edited.is_empty() || !needs_verification(edited, self.workspace.root()) {
            return Ok(VerifyOutcome::Done);
        }
        let Some(command) = select_verify_command(&self.config.workflow, self.workspace.root())
        else {
            return Ok(VerifyOutcome::Done);
        };

        info!("auto-verify: {command}");
        let call = ToolCall::function(
            format!("verify-{}", uuid::Uuid::new_v4()),
            "bash",
            json!({"command": command}).to_string(),
        );
        // The verify call is orchestrator-issued and trusted: it bypasses
        // policy/approval but still lands in history as a normal pair so
        // the model sees the evidence.
        self.session
            .append_message(Message::assistant_with_calls("", None, vec![call.clone()]));
        let ctx = self.tool_context(cancel);
        let executed = self
            .registry
            .execute(&ctx, "bash", json!({"command": command}))
            .await;
        let result = match executed {
            Ok(result) => result,
            Err(_) if cancel.is_cancelled() => return Err(CoderErr::Interrupted),
            Err(e) => json!({"ok": false, "error": e.to_string()}).to_string(),
        };
        self.append_tool_result(&call, result.clone(), sink);
        self.flush();

        let parsed: Value = serde_json::from_str(&result).unwrap_or_default();
        let exit_code = parsed.get("exit_code").and_then(|v| v.as_i64()).unwrap_or(-1);
        if exit_code == 0 {
            return Ok(VerifyOutcome::Done);
        }
        let stdout = parsed.get("stdout").and_then(|v| v.as_str()).unwrap_or("");
        let stderr = parsed.get("stderr").and_then(|v| v.as_str()).unwrap_or("");
        // 127 is the shell's "command not found": the toolchain itself is
        // missing, so another model round cannot help.
        if exit_code == 127 || is_environment_failure(stdout, stderr) {
            info!("auto-verify failed due to environment breakage; not retrying");
            return Ok(VerifyOutcome::Done);
        }
        Ok(VerifyOutcome::Retry(format!(
            "`{command}` failed (exit {exit_code}). Fix the failure and keep the change minimal.\n\
             stdout:\n{stdout}\nstderr:\n{stderr}"
        )))
    }

    /// Synthesize a starter todo list for complex inputs when the list is
    /// empty or fully completed.
    async fn maybe_bootstrap_todos(&mut self, user_input: &str, sink: &mut dyn TurnSink) {
        if !self.config.workflow.require_todo_for_complex
            || !self.agent.allows("todowrite")
            || !is_complex_input(user_input)
        {
            return;
        }
        {
            let todos = self.todos.lock().unwrap();
            if !todos.all_completed(&self.session.id) {
                return;
            }
        }

        let items = bootstrap_todos(user_input);
        let args = json!({ "todos": items });
        let call = ToolCall::function(
            format!("todo-{}", uuid::Uuid::new_v4()),
            "todowrite",
            args.to_string(),
        );
        self.session
            .append_message(Message::assistant_with_calls("", None, vec![call.clone()]));
        let ctx = self.tool_context(&CancellationToken::new());
        let result = self
            .registry
            .execute(&ctx, "todowrite", args)
            .await
            .unwrap_or_else(|e| json!({"ok": false, "error": e.to_string()}).to_string());
        self.append_tool_result(&call, result, sink);
        self.refresh_todos(sink);
        self.persist_todos();
        self.flush();
    }

    async fn maybe_compact(&mut self, sink: &mut dyn TurnSink) {
        let compaction = self.config.compaction.clone().normalized();
        if !compaction.auto {
            return;
        }
        let estimated = self.estimated_tokens();
        let threshold = compaction.threshold * self.config.context_token_limit as f64;
        if (estimated as f64) <= threshold {
            return;
        }
        debug!("compacting: estimated {estimated} tokens over threshold {threshold}");
        let outcome = compact(
            &self.session.messages,
            compaction.recent_messages,
            compaction.prune_tool_outputs,
            self.compaction_strategy.as_ref(),
        )
        .await;
        if outcome.changed {
            self.session
                .replace_with_compacted(outcome.messages, compaction.recent_messages);
            self.flush();
            self.emit_context_update(sink);
        }
    }

    /// Manual `/compact`.
    pub async fn compact_now(&mut self) -> Result<bool> {
        let compaction = self.config.compaction.clone().normalized();
        let outcome = compact(
            &self.session.messages,
            compaction.recent_messages,
            compaction.prune_tool_outputs,
            self.compaction_strategy.as_ref(),
        )
        .await;
        if outcome.changed {
            self.session
                .replace_with_compacted(outcome.messages, compaction.recent_messages);
            self.flush();
        }
        Ok(outcome.changed)
    }

    pub fn undo_last_turn(&mut self) -> Result<Vec<PathBuf>> {
        self.undo_stack.undo_last()
    }

    /// Reset to a fresh session, keeping configuration and mode.
    pub fn new_session(&mut self) {
        self.session = Session::new(SessionMeta {
            agent: self.agent.name.clone(),
            model: self.config.model.clone(),
            cwd: self.workspace.root().to_path_buf(),
            title: None,
        });
        self.transcript = TranscriptFile::new(self.workspace.root(), &self.session.id);
        self.undo_stack = UndoStack::default();
    }

    /// Resume a stored session (the newest one when `id` is `None`).
    pub fn resume_session(&mut self, id: Option<&str>) -> Result<String> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| CoderErr::SessionNotFound("no store configured".to_string()))?;
        let id = match id {
            Some(id) => id.to_string(),
            None => store
                .list_sessions()?
                .first()
                .map(|s| s.id.clone())
                .ok_or_else(|| CoderErr::SessionNotFound("no stored sessions".to_string()))?,
        };
        let session = store.load_session(&id)?;
        let todo_items = store.list_todos(&id).unwrap_or_default();
        {
            let mut todos = self.todos.lock().unwrap();
            todos.replace(&id, todo_items);
        }
        self.transcript = TranscriptFile::new(self.workspace.root(), &session.id);
        self.session = session;
        self.undo_stack = UndoStack::default();
        Ok(id)
    }

    // ----- helpers -------------------------------------------------------

    fn provider_messages(&self) -> Vec<Message> {
        let mut messages = self.assembler.static_messages();
        messages.push(
            self.assembler
                .environment_context(&self.mode_name, self.policy.preset()),
        );
        // Reasoning stays local; it is never sent back to the provider.
        messages.extend(self.session.messages.iter().map(|m| {
            let mut m = m.clone();
            m.reasoning = None;
            m
        }));
        messages
    }

    fn tool_definitions(&self) -> Vec<crate::models::ToolDef> {
        self.registry
            .definitions_filtered(&self.agent.tool_enabled)
            .into_iter()
            .filter(|def| {
                // Tools the policy denies outright are not advertised. Bash
                // is the exception: its decision depends on runtime args.
                let name = &def.function.name;
                name == "bash" || self.policy.decide(name, None).rule != PermissionRule::Deny
            })
            .collect()
    }

    fn enabled_tool_names(&self) -> BTreeSet<String> {
        self.registry
            .names()
            .into_iter()
            .filter(|name| self.agent.allows(name))
            .collect()
    }

    fn tool_context(&self, cancel: &CancellationToken) -> ToolContext {
        ToolContext {
            workspace: Arc::clone(&self.workspace),
            cancel: cancel.clone(),
            session_id: self.session.id.clone(),
            todos: Arc::clone(&self.todos),
        }
    }

    fn append_tool_result(&mut self, call: &ToolCall, result: String, sink: &mut dyn TurnSink) {
        let ok = serde_json::from_str::<Value>(&result)
            .ok()
            .and_then(|v| v.get("ok").and_then(|b| b.as_bool()))
            .unwrap_or(false);
        sink.on_tool_event(&ToolEvent::Finished {
            call_id: call.id.clone(),
            name: call.function.name.clone(),
            ok,
        });
        self.session.append_message(Message::tool(
            call.id.clone(),
            call.function.name.clone(),
            result,
        ));
        self.flush();
    }

    fn append_denied(&mut self, call: &ToolCall, reason: &str, sink: &mut dyn TurnSink) {
        sink.on_tool_event(&ToolEvent::Denied {
            call_id: call.id.clone(),
            name: call.function.name.clone(),
            reason: reason.to_string(),
        });
        self.session.append_message(Message::tool(
            call.id.clone(),
            call.function.name.clone(),
            json!({"ok": false, "denied": true, "reason": reason}).to_string(),
        ));
        self.flush();
    }

    fn estimated_tokens(&self) -> usize {
        let static_cost = self.counter.count_messages(&self.assembler.static_messages());
        static_cost + self.counter.count_messages(&self.session.messages)
    }

    fn emit_context_update(&self, sink: &mut dyn TurnSink) {
        sink.on_context_update(&ContextStats {
            messages: self.session.messages.len(),
            estimated_tokens: self.estimated_tokens(),
            token_limit: self.config.context_token_limit,
        });
    }

    fn refresh_todos(&self, sink: &mut dyn TurnSink) {
        sink.on_todo_update(&self.current_todos());
    }

    fn persist_todos(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.replace_todos(&self.session.id, &self.current_todos()) {
            warn!("failed to persist todos: {e}");
        }
    }

    fn log_permission(&self, tool: &str, decision: &crate::permissions::PermissionDecision) {
        let Some(store) = &self.store else {
            return;
        };
        let rule = match decision.rule {
            PermissionRule::Allow => "allow",
            PermissionRule::Ask => "ask",
            PermissionRule::Deny => "deny",
        };
        let entry =
            PermissionLogEntry::new(&self.session.id, tool, rule, decision.reason.clone());
        if let Err(e) = store.log_permission(&entry) {
            warn!("failed to log permission decision: {e}");
        }
    }

    /// Best-effort persistence after every state change; never aborts a
    /// turn.
    fn flush(&self) {
        if let Err(e) = self
            .transcript
            .flush(&self.session, &self.assembler.static_messages())
        {
            warn!("transcript flush failed: {e}");
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.save_session(&self.session) {
                warn!("session store write failed: {e}");
            }
        }
    }
}

enum VerifyOutcome {
    Done,
    Retry(String),
}

/// Short salutations with no task verbs get no tools on step 0, which keeps
/// the model from tool-calling its way through "hello".
fn is_chatty_greeting(input: &str) -> bool {
    const GREETINGS: &[&str] = &[
        "hi", "hello", "hey", "yo", "thanks", "thank", "morning", "evening", "afternoon",
        "你好", "谢谢",
    ];
    const TASK_MARKERS: &[&str] = &[
        "fix", "add", "write", "create", "run", "update", "implement", "delete", "refactor",
        "build", "test", "explain", "why", "how", "what", "where", "show", "find", "help",
    ];
    let lower = input.trim().to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && !('\u{4e00}'..='\u{9fff}').contains(&c))
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() || words.len() > 4 {
        return false;
    }
    if words.iter().any(|w| TASK_MARKERS.contains(w)) {
        return false;
    }
    words.iter().any(|w| GREETINGS.contains(w))
}

fn summarize_args(arguments: &str) -> String {
    const MAX: usize = 120;
    let flat: String = arguments.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX {
        flat
    } else {
        let mut cut: String = flat.chars().take(MAX).collect();
        cut.push('…');
        cut
    }
}
