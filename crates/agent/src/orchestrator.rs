//! The orchestrator: one state machine per user turn.
//!
//! A turn moves `Preparing → Streaming → ToolDispatching → Streaming → …`
//! until the model answers without tool calls (`Done`), the user cancels
//! (`Cancelled`), or something fails (`Failed`). Every turn owns a
//! cancellation token derived from the orchestrator's root token; tool runs
//! and sub-agents derive theirs from the turn's.
//!
//! Failures are always written onto an assistant message as a finish so
//! they survive a restart, and are published as [`AgentEvent::TurnFailed`].

use codeloom_config::AppConfig;
use codeloom_core::error::{AgentError, ToolError};
use codeloom_core::event::Broker;
use codeloom_core::message::{ContentPart, Finish, FinishReason, Message, Role, ToolCallPart};
use codeloom_core::session::Session;
use codeloom_core::store::Store;
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolRegistry, ToolResponse};
use codeloom_providers::ProviderAdapter;
use codeloom_security::permission::{PermissionAsk, PermissionGate};
use codeloom_tools::TASK_TOOLS;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent_tool::AgentTool;
use crate::assembler::{MessageAssembler, StreamEnd};
use crate::budget;
use crate::event::{AgentEvent, TurnState};
use crate::prompt::{self, AgentRole, Environment};
use crate::session::SessionManager;
use crate::subagent::{Summarizer, TitleGenerator};

/// Tool-result body when the user refuses a permission prompt.
pub const USER_DENIED: &str = "user denied";

/// Tunables for the orchestrator, usually taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub coder_model: String,
    pub task_model: String,
    pub title_model: String,
    pub summarizer_model: String,
    /// Provider calls allowed per turn
    pub max_iterations: u32,
    /// Tool calls of one assistant message run at most this many at a time
    pub tool_parallelism: usize,
    pub compaction_threshold: f64,
    pub flush_interval: Duration,
    pub shutdown_grace: Duration,
    pub workspace: PathBuf,
    pub context_paths: Vec<String>,
}

impl From<&AppConfig> for OrchestratorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            coder_model: config.agents.coder.clone(),
            task_model: config.agents.task.clone(),
            title_model: config.agents.title.clone(),
            summarizer_model: config.agents.summarizer.clone(),
            max_iterations: config.runtime.max_iterations,
            tool_parallelism: config.runtime.tool_parallelism.max(1),
            compaction_threshold: config.runtime.compaction_threshold,
            flush_interval: Duration::from_millis(config.runtime.flush_interval_ms),
            shutdown_grace: Duration::from_millis(config.runtime.shutdown_grace_ms),
            workspace: config.workspace_root(),
            context_paths: config.agents.context_paths.clone(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// What the user sent: text plus optional image or file parts.
#[derive(Debug, Clone, Default)]
pub struct UserInput {
    pub text: String,
    pub attachments: Vec<ContentPart>,
}

impl UserInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, part: ContentPart) -> Self {
        self.attachments.push(part);
        self
    }

    fn into_message(self, session_id: &str) -> Message {
        let mut parts = vec![ContentPart::text(self.text)];
        parts.extend(self.attachments);
        Message::new(session_id, Role::User, parts)
    }
}

impl From<&str> for UserInput {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for UserInput {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// How a turn that did not fail ended.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_id: String,
    /// `Done` or `Cancelled`
    pub state: TurnState,
    /// The last assistant message of the turn, when one was started
    pub message: Option<Message>,
    /// Provider calls made
    pub iterations: u32,
}

impl TurnOutcome {
    /// Text of the final assistant message.
    pub fn text(&self) -> String {
        self.message.as_ref().map(Message::text).unwrap_or_default()
    }
}

struct Inner {
    sessions: SessionManager,
    adapter: Arc<ProviderAdapter>,
    gate: Arc<PermissionGate>,
    coder_tools: ToolRegistry,
    task_tools: ToolRegistry,
    events: Broker<AgentEvent>,
    config: OrchestratorConfig,
    environment: OnceCell<Environment>,
    /// Cancellation token of each session's running turn
    active: Mutex<HashMap<String, CancellationToken>>,
    /// Per-session model choice for the coder role
    models: Mutex<HashMap<String, String>>,
    root: CancellationToken,
    idle: Notify,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn models(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs turns for any number of sessions. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// A non-owning handle, held by the `agent` tool.
#[derive(Clone)]
pub struct WeakOrchestrator(Weak<Inner>);

impl WeakOrchestrator {
    pub fn upgrade(&self) -> Option<Orchestrator> {
        self.0.upgrade().map(|inner| Orchestrator { inner })
    }
}

/// Removes the session from the active set when the turn ends, however it ends.
struct TurnGuard {
    inner: Arc<Inner>,
    session_id: String,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.inner.active().remove(&self.session_id);
        self.inner.idle.notify_waiters();
    }
}

/// Per-turn bookkeeping.
struct Turn {
    session_id: String,
    role: AgentRole,
    model: String,
    cancel: CancellationToken,
    iterations: u32,
    /// A finish describing the failure is already on a message
    recorded: bool,
}

impl Orchestrator {
    /// Build an orchestrator over `tools`. The coder role gets every tool
    /// plus `agent`; delegated sub-agents get the read-only subset.
    pub fn new(
        store: Arc<dyn Store>,
        adapter: Arc<ProviderAdapter>,
        gate: Arc<PermissionGate>,
        tools: ToolRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let sessions = SessionManager::new(store, Arc::clone(adapter.catalog()));
        let inner = Arc::new_cyclic(|weak| {
            let task_tools = tools.subset(TASK_TOOLS);
            let coder_tools =
                tools.with(Arc::new(AgentTool::new(WeakOrchestrator(Weak::clone(weak)))));
            Inner {
                sessions,
                adapter,
                gate,
                coder_tools,
                task_tools,
                events: Broker::new(),
                config,
                environment: OnceCell::new(),
                active: Mutex::new(HashMap::new()),
                models: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
                idle: Notify::new(),
            }
        });
        Self { inner }
    }

    /// Broker carrying [`AgentEvent`]s.
    pub fn events(&self) -> &Broker<AgentEvent> {
        &self.inner.events
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.inner.gate
    }

    pub fn adapter(&self) -> &Arc<ProviderAdapter> {
        &self.inner.adapter
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Tools offered to `role`.
    pub fn tools(&self, role: AgentRole) -> &ToolRegistry {
        match role {
            AgentRole::Coder => &self.inner.coder_tools,
            AgentRole::Task => &self.inner.task_tools,
        }
    }

    /// Run one user turn to completion.
    ///
    /// Returns [`AgentError::Busy`] immediately when the session already has
    /// a running turn. Cancellation is not an error: the outcome's state is
    /// `Cancelled`.
    pub async fn run(
        &self,
        session_id: &str,
        input: impl Into<UserInput>,
    ) -> Result<TurnOutcome, AgentError> {
        let (guard, cancel) = self.begin(session_id, None)?;
        self.drive(guard, cancel, input.into(), AgentRole::Coder).await
    }

    /// Like [`run`](Self::run) but on a spawned task. The busy check happens
    /// before this returns.
    pub fn start(
        &self,
        session_id: &str,
        input: impl Into<UserInput>,
    ) -> Result<JoinHandle<Result<TurnOutcome, AgentError>>, AgentError> {
        let (guard, cancel) = self.begin(session_id, None)?;
        let this = self.clone();
        let input = input.into();
        Ok(tokio::spawn(async move {
            this.drive(guard, cancel, input, AgentRole::Coder).await
        }))
    }

    /// Run a sub-agent turn whose cancellation follows `parent`.
    pub(crate) async fn run_delegated(
        &self,
        session_id: &str,
        input: impl Into<UserInput>,
        parent: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let (guard, cancel) = self.begin(session_id, Some(parent))?;
        self.drive(guard, cancel, input.into(), AgentRole::Task).await
    }

    /// Cancel the session's running turn. Returns whether one was running.
    pub fn cancel(&self, session_id: &str) -> bool {
        let token = self.inner.active().get(session_id).cloned();
        match token {
            Some(token) => {
                info!(session_id = %session_id, "Cancelling turn");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.inner.active().contains_key(session_id)
    }

    /// Use `model_id` for the session's subsequent coder turns.
    pub fn choose_model(&self, session_id: &str, model_id: &str) -> Result<(), AgentError> {
        if self.inner.adapter.model(model_id).is_none() {
            return Err(AgentError::UnknownModel(model_id.to_string()));
        }
        info!(session_id = %session_id, model = %model_id, "Model chosen");
        self.inner
            .models()
            .insert(session_id.to_string(), model_id.to_string());
        Ok(())
    }

    pub fn model_for(&self, session_id: &str, role: AgentRole) -> String {
        match role {
            AgentRole::Coder => self
                .inner
                .models()
                .get(session_id)
                .cloned()
                .unwrap_or_else(|| self.inner.config.coder_model.clone()),
            AgentRole::Task => self.inner.config.task_model.clone(),
        }
    }

    /// Cancel any running turn, forget permission grants, and delete the
    /// session with its children.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), AgentError> {
        self.cancel(session_id);
        self.inner.gate.clear_session(session_id);
        self.inner.models().remove(session_id);
        self.inner.sessions.delete(session_id).await?;
        Ok(())
    }

    /// Cancel every running turn and wait up to the grace period for them
    /// to wind down. Returns `false` if some were still running.
    pub async fn shutdown(&self) -> bool {
        info!(active = self.inner.active().len(), "Shutting down orchestrator");
        self.inner.root.cancel();
        let drained = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.inner.active().is_empty() {
                    return;
                }
                notified.await;
            }
        };
        let clean = tokio::time::timeout(self.inner.config.shutdown_grace, drained)
            .await
            .is_ok();
        if !clean {
            warn!(remaining = self.inner.active().len(), "Turns still running after shutdown grace period");
        }
        clean
    }

    fn begin(
        &self,
        session_id: &str,
        parent: Option<&CancellationToken>,
    ) -> Result<(TurnGuard, CancellationToken), AgentError> {
        if self.inner.root.is_cancelled() {
            return Err(AgentError::ShuttingDown);
        }
        let mut active = self.inner.active();
        if active.contains_key(session_id) {
            return Err(AgentError::Busy(session_id.to_string()));
        }
        let cancel = parent.unwrap_or(&self.inner.root).child_token();
        active.insert(session_id.to_string(), cancel.clone());
        let guard = TurnGuard {
            inner: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
        };
        Ok((guard, cancel))
    }

    async fn drive(
        &self,
        guard: TurnGuard,
        cancel: CancellationToken,
        input: UserInput,
        role: AgentRole,
    ) -> Result<TurnOutcome, AgentError> {
        let mut turn = Turn {
            session_id: guard.session_id.clone(),
            role,
            model: self.model_for(&guard.session_id, role),
            cancel,
            iterations: 0,
            recorded: false,
        };
        info!(session_id = %turn.session_id, role = role.as_str(), model = %turn.model, "Turn started");

        let result = match self.execute(&mut turn, input).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                self.fail(&turn, &error).await;
                Err(error)
            }
        };
        drop(guard);
        result
    }

    async fn execute(&self, turn: &mut Turn, input: UserInput) -> Result<TurnOutcome, AgentError> {
        self.set_state(turn, TurnState::Preparing);
        let model = self
            .inner
            .adapter
            .model(&turn.model)
            .ok_or_else(|| AgentError::UnknownModel(turn.model.clone()))?;
        let system = turn.role.system_prompt(self.environment().await);
        let tools = self.tools(turn.role).clone();
        let definitions = tools.definitions();
        let store = Arc::clone(self.inner.sessions.store());

        let session = self.inner.sessions.get(&turn.session_id).await?;
        let mut history = self.effective_history(&session).await?;

        let estimated = budget::estimate_prompt(&system, &history, &input.text);
        let mut compacted = false;
        if budget::needs_compaction(estimated, model.context_window, self.inner.config.compaction_threshold) {
            info!(
                session_id = %turn.session_id,
                estimated,
                window = model.context_window,
                "Context near the window, compacting"
            );
            compacted = true;
            match self.compact(turn, &history).await? {
                Some(compacted_history) => history = compacted_history,
                None => return Ok(self.cancelled(turn, None)),
            }
        }

        let user = store.create_message(input.into_message(&turn.session_id)).await?;
        history.push(user.clone());

        for iteration in 1..=self.inner.config.max_iterations {
            turn.iterations = iteration;
            if turn.cancel.is_cancelled() {
                return Ok(self.cancelled(turn, None));
            }
            debug!(session_id = %turn.session_id, iteration, "Turn iteration");
            self.set_state(turn, TurnState::Streaming);

            let assembler = MessageAssembler::begin(
                &self.inner.sessions,
                &turn.session_id,
                &turn.model,
                self.inner.config.flush_interval,
            )
            .await?;
            let events = self
                .inner
                .adapter
                .stream(&turn.cancel, &turn.model, system.clone(), history.clone(), definitions.clone())
                .await;
            let streamed = assembler.consume(events, &turn.cancel).await?;
            let message = streamed.message;

            match streamed.end {
                StreamEnd::Cancelled => return Ok(self.cancelled(turn, Some(message))),
                StreamEnd::Failed(error) => {
                    turn.recorded = true;
                    return Err(error.into());
                }
                StreamEnd::Finished { reason: FinishReason::Length, .. } => {
                    if compacted {
                        return Err(AgentError::OutputTruncated);
                    }
                    warn!(session_id = %turn.session_id, "Output hit the token limit, compacting and retrying");
                    compacted = true;
                    history.push(message);
                    match self.compact(turn, &history).await? {
                        Some(compacted_history) => {
                            history = compacted_history;
                            history.push(user.clone());
                        }
                        None => return Ok(self.cancelled(turn, None)),
                    }
                    continue;
                }
                StreamEnd::Finished { .. } => {}
            }

            let calls = message.tool_calls();
            history.push(message.clone());
            if calls.is_empty() {
                return Ok(self.done(turn, &session, message));
            }

            self.set_state(turn, TurnState::ToolDispatching);
            let Some(responses) = self.dispatch(turn, &tools, &message.id, &calls).await else {
                return Ok(self.cancelled(turn, Some(message)));
            };

            let mut stop = false;
            for (call, response) in calls.iter().zip(responses) {
                stop |= response.stop;
                let result = Message::tool_result(
                    &turn.session_id,
                    &call.id,
                    &call.name,
                    response.content,
                    response.success,
                    response.metadata,
                );
                history.push(store.create_message(result).await?);
            }
            if stop {
                debug!(session_id = %turn.session_id, "Tool requested the turn to stop");
                return Ok(self.done(turn, &session, message));
            }
        }

        Err(AgentError::LoopLimit(self.inner.config.max_iterations))
    }

    /// History as the provider sees it: from the summary anchor on, with the
    /// summary itself replayed as a user message.
    async fn effective_history(&self, session: &Session) -> Result<Vec<Message>, AgentError> {
        let messages = self.inner.sessions.messages(&session.id).await?;
        let Some(anchor) = &session.summary_message_id else {
            return Ok(messages);
        };
        match messages.iter().position(|m| &m.id == anchor) {
            Some(at) => {
                let mut history = vec![summary_as_user(&messages[at])];
                history.extend(messages[at + 1..].iter().cloned());
                Ok(history)
            }
            None => {
                warn!(session_id = %session.id, anchor = %anchor, "Summary anchor not found, using full history");
                Ok(messages)
            }
        }
    }

    /// Summarize `history` and return the replacement history, or `None`
    /// when the turn was cancelled meanwhile.
    async fn compact(
        &self,
        turn: &mut Turn,
        history: &[Message],
    ) -> Result<Option<Vec<Message>>, AgentError> {
        let summarizer = Summarizer::new(
            Arc::clone(&self.inner.adapter),
            self.inner.sessions.clone(),
            self.inner.config.summarizer_model.clone(),
            self.inner.config.flush_interval,
        );
        let streamed = summarizer.summarize(&turn.cancel, &turn.session_id, history).await?;
        match streamed.end {
            StreamEnd::Finished { .. } => {
                info!(session_id = %turn.session_id, summary_id = %streamed.message.id, "Session compacted");
                self.emit(AgentEvent::Compacted {
                    session_id: turn.session_id.clone(),
                    summary_message_id: streamed.message.id.clone(),
                });
                Ok(Some(vec![summary_as_user(&streamed.message)]))
            }
            StreamEnd::Cancelled => Ok(None),
            StreamEnd::Failed(error) => {
                turn.recorded = true;
                Err(error.into())
            }
        }
    }

    /// Run every call of one assistant message, at most `tool_parallelism`
    /// at a time, and return the responses in call order. `None` means the
    /// turn was cancelled and the results are discarded.
    async fn dispatch(
        &self,
        turn: &Turn,
        tools: &ToolRegistry,
        message_id: &str,
        calls: &[ToolCallPart],
    ) -> Option<Vec<ToolResponse>> {
        let semaphore = Arc::new(Semaphore::new(self.inner.config.tool_parallelism.max(1)));
        let dispatch_cancel = turn.cancel.child_token();
        let _cancel_on_drop = dispatch_cancel.clone().drop_guard();

        let handles: Vec<_> = calls
            .iter()
            .map(|call| {
                let this = self.clone();
                let tool = tools.get(&call.name);
                let call = call.clone();
                let semaphore = Arc::clone(&semaphore);
                let ctx = ToolContext::new(&turn.session_id, message_id, dispatch_cancel.child_token());
                tokio::spawn(async move { this.invoke(ctx, tool, call, semaphore).await })
            })
            .collect();
        let joined = futures::future::join_all(handles).await;

        if turn.cancel.is_cancelled() {
            debug!(session_id = %turn.session_id, "Discarding tool results of a cancelled turn");
            return None;
        }
        let responses = joined
            .into_iter()
            .map(|result| match result {
                Ok(Some(response)) => response,
                Ok(None) => ToolResponse::error("Tool call was not started"),
                Err(e) => ToolResponse::error(format!("Tool call panicked: {e}")),
            })
            .collect();
        Some(responses)
    }

    /// One tool call: argument checks, permission, execution. `None` when
    /// cancelled before the tool started.
    async fn invoke(
        &self,
        ctx: ToolContext,
        tool: Option<Arc<dyn Tool>>,
        call: ToolCallPart,
        semaphore: Arc<Semaphore>,
    ) -> Option<ToolResponse> {
        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit.ok()?,
            _ = ctx.cancel.cancelled() => return None,
        };
        if ctx.cancel.is_cancelled() {
            return None;
        }

        let Some(tool) = tool else {
            warn!(tool = %call.name, "Model called an unknown tool");
            return Some(ToolResponse::error(format!("Tool not found: {}", call.name)));
        };

        let raw = if call.input.trim().is_empty() { "{}" } else { call.input.as_str() };
        let input = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) if value.is_object() => value,
            Ok(_) => {
                return Some(ToolResponse::error(
                    "Invalid tool arguments: expected a JSON object",
                ));
            }
            Err(e) => {
                debug!(tool = %call.name, error = %e, "Malformed tool arguments");
                return Some(ToolResponse::error(format!("Invalid tool arguments: {e}")));
            }
        };

        if tool.requires_permission(&input) {
            let ask = PermissionAsk {
                session_id: ctx.session_id.clone(),
                tool_name: call.name.clone(),
                description: tool.permission_description(&input),
                path: tool.permission_path(&input),
                params: input,
            };
            if !self.inner.gate.request(&ctx.cancel, ask).await {
                if ctx.cancel.is_cancelled() {
                    return None;
                }
                info!(session_id = %ctx.session_id, tool = %call.name, "Tool call denied");
                return Some(ToolResponse::error(USER_DENIED));
            }
        }

        self.emit(AgentEvent::ToolStarted {
            session_id: ctx.session_id.clone(),
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
        });
        let started = Instant::now();
        let response = match tool.run(&ctx, &ToolCall::new(&call.id, &call.name, &call.input)).await {
            Ok(response) => response,
            Err(ToolError::Cancelled) => ToolResponse::error("Tool call was cancelled"),
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                ToolResponse::error(e.to_string())
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(tool = %call.name, success = response.success, duration_ms, "Tool finished");
        self.emit(AgentEvent::ToolFinished {
            session_id: ctx.session_id.clone(),
            tool_call_id: call.id,
            name: call.name,
            success: response.success,
            duration_ms,
        });
        Some(response)
    }

    fn done(&self, turn: &Turn, session: &Session, message: Message) -> TurnOutcome {
        info!(session_id = %turn.session_id, iterations = turn.iterations, "Turn completed");
        self.set_state(turn, TurnState::Done);
        self.emit(AgentEvent::TurnCompleted {
            session_id: turn.session_id.clone(),
            message_id: message.id.clone(),
            iterations: turn.iterations,
        });
        if turn.role == AgentRole::Coder && session.parent_id.is_none() && !session.has_title() {
            self.spawn_title(turn.session_id.clone());
        }
        TurnOutcome {
            session_id: turn.session_id.clone(),
            state: TurnState::Done,
            message: Some(message),
            iterations: turn.iterations,
        }
    }

    fn cancelled(&self, turn: &Turn, message: Option<Message>) -> TurnOutcome {
        info!(session_id = %turn.session_id, iterations = turn.iterations, "Turn cancelled");
        self.set_state(turn, TurnState::Cancelled);
        TurnOutcome {
            session_id: turn.session_id.clone(),
            state: TurnState::Cancelled,
            message,
            iterations: turn.iterations,
        }
    }

    async fn fail(&self, turn: &Turn, error: &AgentError) {
        warn!(session_id = %turn.session_id, error = %error, "Turn failed");
        if !turn.recorded {
            let reason = match error {
                AgentError::ContextOverflow { .. } => FinishReason::ContextOverflow,
                AgentError::LoopLimit(_) => FinishReason::LoopLimit,
                _ => FinishReason::Error,
            };
            let mut message = Message::assistant(&turn.session_id, &turn.model);
            message.finish = Some(Finish::with_detail(reason, error.to_string()));
            if let Err(e) = self.inner.sessions.store().create_message(message).await {
                warn!(session_id = %turn.session_id, error = %e, "Could not record turn failure");
            }
        }
        self.set_state(turn, TurnState::Failed);
        self.emit(AgentEvent::TurnFailed {
            session_id: turn.session_id.clone(),
            error: error.to_string(),
        });
    }

    /// Generate a title from the session's first user message in the background.
    fn spawn_title(&self, session_id: String) {
        let this = self.clone();
        let cancel = self.inner.root.child_token();
        tokio::spawn(async move {
            let sessions = &this.inner.sessions;
            let first = match sessions.messages(&session_id).await {
                Ok(messages) => messages.into_iter().find(|m| m.role == Role::User).map(|m| m.text()),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Could not load messages for title");
                    return;
                }
            };
            let Some(first) = first.filter(|t| !t.trim().is_empty()) else {
                return;
            };

            let generator = TitleGenerator::new(
                Arc::clone(&this.inner.adapter),
                this.inner.config.title_model.clone(),
            );
            let (title, usage) = match generator.generate(&cancel, &session_id, &first).await {
                Ok(generated) => generated,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Title generation failed");
                    return;
                }
            };
            if title.is_empty() {
                return;
            }

            let cost = sessions.catalog().cost(generator.model(), usage);
            let result = async {
                // A title the user set meanwhile wins.
                if sessions.get(&session_id).await?.has_title() {
                    return Ok(false);
                }
                sessions.rename(&session_id, title.clone()).await?;
                sessions.add_cost(&session_id, cost).await?;
                Ok::<_, codeloom_core::error::StoreError>(true)
            }
            .await;
            match result {
                Ok(true) => {
                    info!(session_id = %session_id, title = %title, "Session titled");
                    this.emit(AgentEvent::TitleGenerated { session_id, title });
                }
                Ok(false) => {}
                Err(e) => warn!(session_id = %session_id, error = %e, "Could not store title"),
            }
        });
    }

    async fn environment(&self) -> &Environment {
        self.inner
            .environment
            .get_or_init(|| Environment::detect(&self.inner.config.workspace, &self.inner.config.context_paths))
            .await
    }

    fn set_state(&self, turn: &Turn, state: TurnState) {
        debug!(session_id = %turn.session_id, state = ?state, "Turn state");
        self.emit(AgentEvent::StateChanged {
            session_id: turn.session_id.clone(),
            state,
        });
    }

    fn emit(&self, event: AgentEvent) {
        self.inner.events.publish(event.kind(), event);
    }
}

fn summary_as_user(summary: &Message) -> Message {
    Message::user(&summary.session_id, format!("{}{}", prompt::SUMMARY_PREFIX, summary.text()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_input_carries_attachments() {
        let input = UserInput::new("what is this?").with_attachment(ContentPart::ImageUrl {
            url: "https://example.com/a.png".into(),
            mime_type: "image/png".into(),
        });
        let message = input.into_message("s1");
        assert_eq!(message.role, Role::User);
        assert_eq!(message.parts.len(), 2);
        assert_eq!(message.text(), "what is this?");
        assert!(message.validate().is_ok());
    }

    #[test]
    fn summary_is_replayed_as_user_text() {
        let mut summary = Message::assistant("s1", "m");
        summary.parts.push(ContentPart::text("We fixed the parser."));
        let replay = summary_as_user(&summary);
        assert_eq!(replay.role, Role::User);
        assert_eq!(replay.session_id, "s1");
        assert!(replay.text().starts_with(prompt::SUMMARY_PREFIX));
        assert!(replay.text().ends_with("We fixed the parser."));
    }

    #[test]
    fn config_follows_app_config() {
        let mut app = AppConfig::default();
        app.runtime.tool_parallelism = 0;
        app.agents.title = "small".into();
        let config = OrchestratorConfig::from(&app);
        assert_eq!(config.tool_parallelism, 1);
        assert_eq!(config.title_model, "small");
        assert_eq!(config.max_iterations, 25);
        assert_eq!(config.flush_interval, Duration::from_millis(100));
    }
}
