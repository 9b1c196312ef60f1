//! End-to-end turns against a scripted provider and an in-memory store.

use async_trait::async_trait;
use codeloom_agent::prompt::{SUMMARIZER, SUMMARY_PREFIX};
use codeloom_agent::{AgentEvent, Orchestrator, OrchestratorConfig, TurnState};
use codeloom_core::error::{AgentError, ProviderError, ToolError};
use codeloom_core::event::{Broker, EventType};
use codeloom_core::message::{ContentPart, Finish, FinishReason, Message, Role};
use codeloom_core::model::{ModelCatalog, ModelInfo};
use codeloom_core::provider::{Provider, ProviderEvent, ProviderRequest, Usage};
use codeloom_core::store::Store;
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolRegistry, ToolResponse};
use codeloom_providers::{ProviderAdapter, RetryPolicy};
use codeloom_security::permission::{PermissionDecision, PermissionGate};
use codeloom_store::InMemoryStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

const MODEL: &str = "scripted-model";

// --- Scripted provider ---

enum Step {
    /// Send these events and close the stream.
    Reply(Vec<ProviderEvent>),
    /// Send these events, signal, then hold the stream open until cancelled.
    Stall(Vec<ProviderEvent>, Arc<Notify>),
}

/// Answers each stream call with the next scripted step and records the
/// requests it saw.
struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn remaining(&self) -> usize {
        self.steps.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let step = self.steps.lock().unwrap().pop_front();
        let (tx, rx) = mpsc::channel(64);
        match step {
            Some(Step::Reply(events)) => {
                for event in events {
                    tx.send(event).await.unwrap();
                }
            }
            Some(Step::Stall(events, reached)) => {
                for event in events {
                    tx.send(event).await.unwrap();
                }
                tokio::spawn(async move {
                    reached.notify_one();
                    cancel.cancelled().await;
                    drop(tx);
                });
            }
            None => {
                return Err(ProviderError::InvalidResponse(
                    "no scripted response left".into(),
                ));
            }
        }
        Ok(rx)
    }
}

fn text_reply(text: &str, input: u64, output: u64) -> Step {
    Step::Reply(vec![
        ProviderEvent::ContentDelta(text.into()),
        ProviderEvent::Finish {
            reason: FinishReason::Stop,
            usage: Usage::new(input, output),
        },
    ])
}

fn tool_reply(calls: &[(&str, &str, &str)], input: u64, output: u64) -> Step {
    let mut events = Vec::new();
    for (id, name, args) in calls {
        events.push(ProviderEvent::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
        });
        events.push(ProviderEvent::ToolCallArgDelta {
            id: id.to_string(),
            fragment: args.to_string(),
        });
        events.push(ProviderEvent::ToolCallEnd { id: id.to_string() });
    }
    events.push(ProviderEvent::Finish {
        reason: FinishReason::ToolUse,
        usage: Usage::new(input, output),
    });
    Step::Reply(events)
}

// --- Fake tools ---

/// Returns a fixed body and counts its runs.
struct FixedTool {
    name: &'static str,
    body: &'static str,
    read_only: bool,
    runs: Arc<AtomicUsize>,
}

impl FixedTool {
    fn new(name: &'static str, body: &'static str, read_only: bool) -> Self {
        Self {
            name,
            body,
            read_only,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Tool for FixedTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "test tool"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn side_effect_free(&self) -> bool {
        self.read_only
    }

    async fn run(&self, _ctx: &ToolContext, _call: &ToolCall) -> Result<ToolResponse, ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(ToolResponse::text(self.body))
    }
}

/// Echoes the file path back after a delay, tracking how many runs overlap.
struct SlowView {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for SlowView {
    fn name(&self) -> &str {
        "view"
    }

    fn description(&self) -> &str {
        "slow view"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    async fn run(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let input: serde_json::Value = call.parse_input()?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolResponse::text(format!(
            "contents of {}",
            input["file_path"].as_str().unwrap_or_default()
        )))
    }
}

/// Ends the turn once the current round of calls is done.
struct FinishTool;

#[async_trait]
impl Tool for FinishTool {
    fn name(&self) -> &str {
        "finish"
    }

    fn description(&self) -> &str {
        "end the turn"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    async fn run(&self, _ctx: &ToolContext, _call: &ToolCall) -> Result<ToolResponse, ToolError> {
        Ok(ToolResponse::text("task complete").with_stop())
    }
}

/// Signals when it starts, then waits for its cancellation token.
struct WaitTool {
    started: Arc<Notify>,
    saw_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl Tool for WaitTool {
    fn name(&self) -> &str {
        "wait"
    }

    fn description(&self) -> &str {
        "blocks until cancelled"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &ToolContext, _call: &ToolCall) -> Result<ToolResponse, ToolError> {
        self.started.notify_one();
        ctx.cancel.cancelled().await;
        self.saw_cancel.store(true, Ordering::SeqCst);
        Err(ToolError::Cancelled)
    }
}

// --- Harness ---

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<InMemoryStore>,
    provider: Arc<ScriptedProvider>,
    gate: Arc<PermissionGate>,
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        coder_model: MODEL.into(),
        task_model: MODEL.into(),
        title_model: MODEL.into(),
        summarizer_model: MODEL.into(),
        max_iterations: 25,
        tool_parallelism: 4,
        compaction_threshold: 0.85,
        flush_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(1),
        workspace: std::env::temp_dir(),
        context_paths: Vec::new(),
    }
}

fn harness(steps: Vec<Step>, tools: ToolRegistry) -> Harness {
    harness_with(steps, tools, 200_000, config())
}

fn harness_with(steps: Vec<Step>, tools: ToolRegistry, window: u64, config: OrchestratorConfig) -> Harness {
    let catalog = ModelCatalog::empty();
    catalog.register(ModelInfo::new(MODEL, "scripted", window).with_costs(3.0, 15.0));
    let provider = Arc::new(ScriptedProvider::new(steps));
    let mut adapter = ProviderAdapter::new(Arc::new(catalog)).with_retry(RetryPolicy::none());
    adapter.register("scripted", Arc::clone(&provider) as Arc<dyn Provider>);

    let store = Arc::new(InMemoryStore::default());
    let gate = Arc::new(PermissionGate::new(Broker::new()));
    let orchestrator = Orchestrator::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(adapter),
        Arc::clone(&gate),
        tools,
        config,
    );
    Harness {
        orchestrator,
        store,
        provider,
        gate,
    }
}

fn tool_result(message: &Message) -> (String, bool) {
    message
        .parts
        .iter()
        .find_map(|p| match p {
            ContentPart::ToolResult { content, success, .. } => Some((content.clone(), *success)),
            _ => None,
        })
        .expect("tool message carries a result")
}

fn roles(messages: &[Message]) -> Vec<Role> {
    messages.iter().map(|m| m.role).collect()
}

/// Answer every permission prompt with `decision`.
fn answer_prompts(gate: &Arc<PermissionGate>, decision: PermissionDecision) {
    let mut prompts = gate.events().subscribe(CancellationToken::new());
    let gate = Arc::clone(gate);
    tokio::spawn(async move {
        while let Some(event) = prompts.recv().await {
            if event.kind == EventType::Created {
                gate.respond(&event.payload.id, decision);
            }
        }
    });
}

// --- Scenarios ---

#[tokio::test]
async fn simple_text_turn() {
    let h = harness(vec![text_reply("hi", 10, 5)], ToolRegistry::new());
    let session = h.orchestrator.sessions().create("Greeting").await.unwrap();

    let outcome = h.orchestrator.run(&session.id, "hello").await.unwrap();
    assert_eq!(outcome.state, TurnState::Done);
    assert_eq!(outcome.text(), "hi");
    assert_eq!(outcome.iterations, 1);

    let messages = h.store.list_messages(&session.id).await.unwrap();
    assert_eq!(roles(&messages), vec![Role::User, Role::Assistant]);
    assert_eq!(messages[0].text(), "hello");
    assert_eq!(messages[1].text(), "hi");
    assert_eq!(messages[1].finish_reason(), Some(FinishReason::Stop));

    let session = h.store.get_session(&session.id).await.unwrap();
    assert_eq!(session.input_tokens, 10);
    assert_eq!(session.output_tokens, 5);
    assert!(session.cost > 0.0);
    assert!(!h.orchestrator.is_active(&session.id));
}

#[tokio::test]
async fn single_tool_call_round_trip() {
    let ls = Arc::new(FixedTool::new("ls", "a\nb\n", false));
    let runs = Arc::clone(&ls.runs);
    let h = harness(
        vec![
            tool_reply(&[("c1", "ls", r#"{"path":"/tmp"}"#)], 40, 12),
            text_reply("two files", 60, 4),
        ],
        ToolRegistry::new().with(ls),
    );
    let session = h.orchestrator.sessions().create("Listing").await.unwrap();
    h.gate.grant(&session.id, "ls");

    let outcome = h.orchestrator.run(&session.id, "list /tmp").await.unwrap();
    assert_eq!(outcome.text(), "two files");
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let messages = h.store.list_messages(&session.id).await.unwrap();
    assert_eq!(
        roles(&messages),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    let calls = messages[1].tool_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "c1");
    assert_eq!(calls[0].input, r#"{"path":"/tmp"}"#);
    assert!(calls[0].finished);
    assert_eq!(messages[2].tool_result_id(), Some("c1"));
    assert_eq!(tool_result(&messages[2]), ("a\nb\n".to_string(), true));
    assert_eq!(messages[3].text(), "two files");

    // The second call saw the tool result.
    let requests = h.provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 3);
    assert_eq!(requests[1].messages[2].role, Role::Tool);

    let session = h.store.get_session(&session.id).await.unwrap();
    assert_eq!(session.input_tokens, 100);
    assert_eq!(session.output_tokens, 16);
}

#[tokio::test]
async fn tool_calls_run_concurrently_and_keep_order() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let view = SlowView {
        in_flight: Arc::clone(&in_flight),
        peak: Arc::clone(&peak),
    };
    let h = harness(
        vec![
            tool_reply(
                &[
                    ("v1", "view", r#"{"file_path":"/a.rs"}"#),
                    ("v2", "view", r#"{"file_path":"/b.rs"}"#),
                    ("v3", "view", r#"{"file_path":"/c.rs"}"#),
                ],
                30,
                10,
            ),
            text_reply("read all three", 50, 5),
        ],
        ToolRegistry::new().with(Arc::new(view)),
    );
    let session = h.orchestrator.sessions().create("Reading").await.unwrap();

    h.orchestrator.run(&session.id, "read a, b and c").await.unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(h.provider.requests().len(), 2);

    let messages = h.store.list_messages(&session.id).await.unwrap();
    let results: Vec<_> = messages.iter().filter(|m| m.role == Role::Tool).collect();
    let ids: Vec<_> = results.iter().filter_map(|m| m.tool_result_id()).collect();
    assert_eq!(ids, vec!["v1", "v2", "v3"]);
    assert_eq!(tool_result(results[1]).0, "contents of /b.rs");
}

#[tokio::test]
async fn parallelism_limit_is_respected() {
    let peak = Arc::new(AtomicUsize::new(0));
    let view = SlowView {
        in_flight: Arc::new(AtomicUsize::new(0)),
        peak: Arc::clone(&peak),
    };
    let mut limited = config();
    limited.tool_parallelism = 2;
    let h = harness_with(
        vec![
            tool_reply(
                &[
                    ("v1", "view", r#"{"file_path":"/a"}"#),
                    ("v2", "view", r#"{"file_path":"/b"}"#),
                    ("v3", "view", r#"{"file_path":"/c"}"#),
                ],
                30,
                10,
            ),
            text_reply("ok", 50, 5),
        ],
        ToolRegistry::new().with(Arc::new(view)),
        200_000,
        limited,
    );
    let session = h.orchestrator.sessions().create("Reading").await.unwrap();

    h.orchestrator.run(&session.id, "read").await.unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn permission_denial_becomes_error_result() {
    let bash = Arc::new(FixedTool::new("bash", "removed", false));
    let runs = Arc::clone(&bash.runs);
    let h = harness(
        vec![
            tool_reply(&[("b1", "bash", r#"{"command":"rm -rf build"}"#)], 20, 8),
            text_reply("Sorry, I will not run that.", 30, 6),
        ],
        ToolRegistry::new().with(bash),
    );
    answer_prompts(&h.gate, PermissionDecision::Deny);
    let session = h.orchestrator.sessions().create("Cleanup").await.unwrap();

    let outcome = h.orchestrator.run(&session.id, "clean the build").await.unwrap();
    assert_eq!(outcome.state, TurnState::Done);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.provider.requests().len(), 2);

    let messages = h.store.list_messages(&session.id).await.unwrap();
    assert_eq!(tool_result(&messages[2]), ("user denied".to_string(), false));
}

#[tokio::test]
async fn allow_for_session_skips_later_prompts() {
    let bash = Arc::new(FixedTool::new("bash", "ok", false));
    let runs = Arc::clone(&bash.runs);
    let h = harness(
        vec![
            tool_reply(&[("b1", "bash", r#"{"command":"make"}"#)], 20, 8),
            tool_reply(&[("b2", "bash", r#"{"command":"make test"}"#)], 20, 8),
            text_reply("built and tested", 30, 6),
        ],
        ToolRegistry::new().with(bash),
    );
    let mut prompts = h.gate.events().subscribe(CancellationToken::new());
    let gate = Arc::clone(&h.gate);
    let answered = tokio::spawn(async move {
        let mut asked = 0;
        while let Some(event) = prompts.recv().await {
            if event.kind == EventType::Created {
                asked += 1;
                gate.respond(&event.payload.id, PermissionDecision::AllowForSession);
            }
            if asked == 1 && event.kind == EventType::Deleted {
                break;
            }
        }
        asked
    });
    let session = h.orchestrator.sessions().create("Build").await.unwrap();

    h.orchestrator.run(&session.id, "build and test").await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(answered.await.unwrap(), 1);
}

#[tokio::test]
async fn cancellation_mid_stream_keeps_partial_text() {
    let reached = Arc::new(Notify::new());
    let h = harness(
        vec![Step::Stall(
            vec![
                ProviderEvent::ContentDelta("Let me ".into()),
                ProviderEvent::ContentDelta("think".into()),
            ],
            Arc::clone(&reached),
        )],
        ToolRegistry::new(),
    );
    let session = h.orchestrator.sessions().create("Thinking").await.unwrap();
    let mut events = h.orchestrator.events().subscribe(CancellationToken::new());

    let turn = h.orchestrator.start(&session.id, "think hard").unwrap();
    reached.notified().await;
    assert!(h.orchestrator.cancel(&session.id));
    let outcome = turn.await.unwrap().unwrap();

    assert_eq!(outcome.state, TurnState::Cancelled);
    let message = outcome.message.expect("assistant message was started");
    assert_eq!(message.text(), "Let me think");
    assert_eq!(message.finish_reason(), Some(FinishReason::Cancelled));

    let stored = h.store.get_message(&message.id).await.unwrap();
    assert_eq!(stored.text(), "Let me think");
    assert!(stored.is_finished());

    let mut last = None;
    while let Some(event) = events.try_recv() {
        last = Some(event.payload);
    }
    assert_eq!(
        last,
        Some(AgentEvent::StateChanged {
            session_id: session.id.clone(),
            state: TurnState::Cancelled,
        })
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_none());
    assert!(!h.orchestrator.cancel(&session.id));
}

#[tokio::test]
async fn cancellation_during_tool_execution_discards_results() {
    let started = Arc::new(Notify::new());
    let saw_cancel = Arc::new(AtomicBool::new(false));
    let wait = WaitTool {
        started: Arc::clone(&started),
        saw_cancel: Arc::clone(&saw_cancel),
    };
    let ls = Arc::new(FixedTool::new("ls", "a\n", true));
    let h = harness(
        vec![
            tool_reply(&[("w1", "wait", "{}"), ("l1", "ls", "{}")], 20, 8),
            text_reply("never requested", 10, 2),
        ],
        ToolRegistry::new().with(Arc::new(wait)).with(ls),
    );
    let session = h.orchestrator.sessions().create("Waiting").await.unwrap();

    let turn = h.orchestrator.start(&session.id, "wait for it").unwrap();
    started.notified().await;
    assert!(h.orchestrator.cancel(&session.id));
    let outcome = turn.await.unwrap().unwrap();

    assert_eq!(outcome.state, TurnState::Cancelled);
    assert!(saw_cancel.load(Ordering::SeqCst));
    assert_eq!(h.provider.requests().len(), 1);

    // The tool-call message stays; no result of the round is persisted, so
    // the next request pairs both calls with a cancelled result.
    let messages = h.store.list_messages(&session.id).await.unwrap();
    assert_eq!(roles(&messages), vec![Role::User, Role::Assistant]);
    let calls = messages[1].tool_calls();
    let ids: Vec<_> = calls.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["w1", "l1"]);
    assert!(calls.iter().all(|c| c.finished));
    assert_eq!(messages[1].finish_reason(), Some(FinishReason::ToolUse));
    assert_eq!(outcome.message.map(|m| m.id), Some(messages[1].id.clone()));
    assert!(!h.orchestrator.is_active(&session.id));
}

#[tokio::test]
async fn stop_flag_ends_the_turn_after_siblings() {
    let ls = Arc::new(FixedTool::new("ls", "src\n", true));
    let runs = Arc::clone(&ls.runs);
    let h = harness(
        vec![
            tool_reply(&[("f1", "finish", "{}"), ("l1", "ls", "{}")], 20, 8),
            text_reply("never requested", 10, 2),
        ],
        ToolRegistry::new().with(Arc::new(FinishTool)).with(ls),
    );
    let session = h.orchestrator.sessions().create("Stopping").await.unwrap();

    let outcome = h.orchestrator.run(&session.id, "wrap up").await.unwrap();
    assert_eq!(outcome.state, TurnState::Done);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.provider.requests().len(), 1);
    assert_eq!(h.provider.remaining(), 1);

    let messages = h.store.list_messages(&session.id).await.unwrap();
    assert_eq!(
        roles(&messages),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Tool]
    );
    assert_eq!(messages[2].tool_result_id(), Some("f1"));
    assert_eq!(tool_result(&messages[2]), ("task complete".to_string(), true));
    assert_eq!(messages[3].tool_result_id(), Some("l1"));
    assert_eq!(tool_result(&messages[3]), ("src\n".to_string(), true));
}

#[tokio::test]
async fn compaction_runs_before_the_turn() {
    let h = harness_with(
        vec![
            text_reply("We refactored the parser.", 100, 20),
            text_reply("Continuing from the summary.", 50, 10),
        ],
        ToolRegistry::new(),
        4_000,
        config(),
    );
    let session = h.orchestrator.sessions().create("Long session").await.unwrap();
    for i in 0..10 {
        h.store
            .create_message(Message::user(&session.id, format!("{i}").repeat(700)))
            .await
            .unwrap();
        let mut reply = Message::assistant(&session.id, MODEL);
        reply.parts.push(ContentPart::text("r".repeat(700)));
        reply.finish = Some(Finish::new(FinishReason::Stop));
        h.store.create_message(reply).await.unwrap();
    }
    let mut events = h.orchestrator.events().subscribe(CancellationToken::new());

    let outcome = h.orchestrator.run(&session.id, "what next?").await.unwrap();
    assert_eq!(outcome.text(), "Continuing from the summary.");

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].system, SUMMARIZER);
    assert!(requests[0].tools.is_empty());
    assert_eq!(requests[1].messages.len(), 2);
    assert!(requests[1].messages[0].text().starts_with(SUMMARY_PREFIX));
    assert!(requests[1].messages[0].text().ends_with("We refactored the parser."));
    assert_eq!(requests[1].messages[1].text(), "what next?");

    // Nothing was deleted; the summary sits between old and new.
    let messages = h.store.list_messages(&session.id).await.unwrap();
    assert_eq!(messages.len(), 23);
    let summary = &messages[20];
    assert_eq!(summary.text(), "We refactored the parser.");
    let session = h.store.get_session(&session.id).await.unwrap();
    assert_eq!(session.summary_message_id.as_deref(), Some(summary.id.as_str()));

    let mut compacted = false;
    while let Some(event) = events.try_recv() {
        if let AgentEvent::Compacted { summary_message_id, .. } = event.payload {
            assert_eq!(summary_message_id, summary.id);
            compacted = true;
        }
    }
    assert!(compacted);
}

#[tokio::test]
async fn history_resumes_from_summary_anchor() {
    let h = harness(vec![text_reply("sure", 10, 2)], ToolRegistry::new());
    let session = h.orchestrator.sessions().create("Anchored").await.unwrap();
    h.store
        .create_message(Message::user(&session.id, "forgotten"))
        .await
        .unwrap();
    let mut summary = Message::assistant(&session.id, MODEL);
    summary.parts.push(ContentPart::text("the gist"));
    summary.finish = Some(Finish::new(FinishReason::Stop));
    let summary = h.store.create_message(summary).await.unwrap();
    h.orchestrator
        .sessions()
        .set_summary_anchor(&session.id, &summary.id)
        .await
        .unwrap();

    h.orchestrator.run(&session.id, "go on").await.unwrap();
    let sent = &h.provider.requests()[0].messages;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].text(), format!("{SUMMARY_PREFIX}the gist"));
    assert_eq!(sent[1].text(), "go on");
}

#[tokio::test]
async fn truncated_output_compacts_and_retries_once() {
    let h = harness(
        vec![
            Step::Reply(vec![
                ProviderEvent::ContentDelta("half an ans".into()),
                ProviderEvent::Finish {
                    reason: FinishReason::Length,
                    usage: Usage::new(10, 4096),
                },
            ]),
            text_reply("summary", 20, 5),
            text_reply("the whole answer", 10, 8),
        ],
        ToolRegistry::new(),
    );
    let session = h.orchestrator.sessions().create("Long answer").await.unwrap();

    let outcome = h.orchestrator.run(&session.id, "explain everything").await.unwrap();
    assert_eq!(outcome.state, TurnState::Done);
    assert_eq!(outcome.text(), "the whole answer");

    let retry = &h.provider.requests()[2];
    assert!(retry.messages[0].text().starts_with(SUMMARY_PREFIX));
    assert_eq!(retry.messages.last().unwrap().text(), "explain everything");
}

#[tokio::test]
async fn second_truncation_fails_the_turn() {
    let length = || {
        Step::Reply(vec![
            ProviderEvent::ContentDelta("cut".into()),
            ProviderEvent::Finish {
                reason: FinishReason::Length,
                usage: Usage::new(10, 4096),
            },
        ])
    };
    let h = harness(
        vec![length(), text_reply("summary", 20, 5), length()],
        ToolRegistry::new(),
    );
    let session = h.orchestrator.sessions().create("Too long").await.unwrap();

    let err = h.orchestrator.run(&session.id, "explain").await.unwrap_err();
    assert!(matches!(err, AgentError::OutputTruncated));
    let messages = h.store.list_messages(&session.id).await.unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.finish_reason(), Some(FinishReason::Error));
}

#[tokio::test]
async fn oversized_history_fails_with_context_overflow() {
    let h = harness_with(vec![], ToolRegistry::new(), 1_000, config());
    let session = h.orchestrator.sessions().create("Huge").await.unwrap();
    h.store
        .create_message(Message::user(&session.id, "x".repeat(5_000)))
        .await
        .unwrap();
    let mut events = h.orchestrator.events().subscribe(CancellationToken::new());

    let err = h.orchestrator.run(&session.id, "and now?").await.unwrap_err();
    assert!(matches!(err, AgentError::ContextOverflow { .. }));
    assert!(h.provider.requests().is_empty());

    let messages = h.store.list_messages(&session.id).await.unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.finish_reason(), Some(FinishReason::ContextOverflow));

    let mut failed = false;
    while let Some(event) = events.try_recv() {
        failed |= matches!(event.payload, AgentEvent::TurnFailed { .. });
    }
    assert!(failed);
}

#[tokio::test]
async fn loop_limit_stops_the_turn() {
    let mut limited = config();
    limited.max_iterations = 2;
    let h = harness_with(
        vec![
            tool_reply(&[("l1", "ls", "{}")], 10, 2),
            tool_reply(&[("l2", "ls", "{}")], 10, 2),
        ],
        ToolRegistry::new().with(Arc::new(FixedTool::new("ls", "src/", true))),
        200_000,
        limited,
    );
    let session = h.orchestrator.sessions().create("Looping").await.unwrap();

    let err = h.orchestrator.run(&session.id, "look around").await.unwrap_err();
    assert!(matches!(err, AgentError::LoopLimit(2)));
    assert_eq!(h.provider.requests().len(), 2);

    let messages = h.store.list_messages(&session.id).await.unwrap();
    assert_eq!(
        messages.last().unwrap().finish_reason(),
        Some(FinishReason::LoopLimit)
    );
}

#[tokio::test]
async fn invalid_arguments_and_unknown_tools_are_reported_to_the_model() {
    let ls = Arc::new(FixedTool::new("ls", "src/", true));
    let runs = Arc::clone(&ls.runs);
    let h = harness(
        vec![
            tool_reply(&[("c1", "ls", "{not json"), ("c2", "teleport", "{}")], 10, 4),
            text_reply("my mistake", 10, 2),
        ],
        ToolRegistry::new().with(ls),
    );
    let session = h.orchestrator.sessions().create("Mistakes").await.unwrap();

    h.orchestrator.run(&session.id, "do it").await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let messages = h.store.list_messages(&session.id).await.unwrap();
    let (bad_args, ok) = tool_result(&messages[2]);
    assert!(!ok);
    assert!(bad_args.starts_with("Invalid tool arguments"));
    assert_eq!(
        tool_result(&messages[3]),
        ("Tool not found: teleport".to_string(), false)
    );
}

#[tokio::test]
async fn second_turn_on_a_busy_session_is_rejected() {
    let reached = Arc::new(Notify::new());
    let h = harness(
        vec![Step::Stall(vec![], Arc::clone(&reached))],
        ToolRegistry::new(),
    );
    let session = h.orchestrator.sessions().create("Busy").await.unwrap();

    let turn = h.orchestrator.start(&session.id, "first").unwrap();
    reached.notified().await;
    assert!(h.orchestrator.is_active(&session.id));

    let err = h.orchestrator.run(&session.id, "second").await.unwrap_err();
    assert!(matches!(err, AgentError::Busy(_)));

    h.orchestrator.cancel(&session.id);
    let outcome = turn.await.unwrap().unwrap();
    assert_eq!(outcome.state, TurnState::Cancelled);
    // The rejected input was never stored.
    let messages = h.store.list_messages(&session.id).await.unwrap();
    assert_eq!(messages.iter().filter(|m| m.role == Role::User).count(), 1);
}

#[tokio::test]
async fn unknown_model_choice_is_rejected() {
    let h = harness(vec![], ToolRegistry::new());
    let session = h.orchestrator.sessions().create("Models").await.unwrap();
    let err = h.orchestrator.choose_model(&session.id, "gpt-nonexistent").unwrap_err();
    assert!(matches!(err, AgentError::UnknownModel(_)));
    h.orchestrator.choose_model(&session.id, MODEL).unwrap();
}

#[tokio::test]
async fn first_turn_generates_a_title() {
    let h = harness(
        vec![
            text_reply("hi there", 10, 3),
            text_reply("\"Greeting: the assistant\"\n", 8, 4),
        ],
        ToolRegistry::new(),
    );
    let session = h.orchestrator.sessions().create("").await.unwrap();
    let mut events = h.orchestrator.events().subscribe(CancellationToken::new());

    h.orchestrator.run(&session.id, "hello").await.unwrap();

    let title = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let AgentEvent::TitleGenerated { title, .. } = event.payload {
                return Some(title);
            }
        }
        None
    })
    .await
    .unwrap();
    assert_eq!(title.as_deref(), Some("Greeting the assistant"));

    let requests = h.provider.requests();
    assert_eq!(requests[1].max_tokens, 80);
    assert!(requests[1].tools.is_empty());

    let stored = h.store.get_session(&session.id).await.unwrap();
    assert_eq!(stored.title, "Greeting the assistant");
    // Title spend counts as cost, not as session tokens.
    assert_eq!(stored.input_tokens, 10);
    assert_eq!(stored.output_tokens, 3);
    let turn_cost = (10.0 * 3.0 + 3.0 * 15.0) / 1_000_000.0;
    assert!(stored.cost > turn_cost);
}

#[tokio::test]
async fn agent_tool_delegates_to_a_child_session() {
    let h = harness(
        vec![
            tool_reply(&[("a1", "agent", r#"{"prompt":"Where is main defined?"}"#)], 20, 6),
            text_reply("/repo/src/main.rs:1", 15, 5),
            text_reply("main is in src/main.rs", 30, 6),
        ],
        ToolRegistry::new()
            .with(Arc::new(FixedTool::new("ls", "src/", true)))
            .with(Arc::new(FixedTool::new("bash", "", false))),
    );
    let session = h.orchestrator.sessions().create("Delegation").await.unwrap();

    let outcome = h.orchestrator.run(&session.id, "find main").await.unwrap();
    assert_eq!(outcome.text(), "main is in src/main.rs");

    let requests = h.provider.requests();
    let coder_tools: Vec<_> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(coder_tools, vec!["ls", "bash", "agent"]);
    let task_tools: Vec<_> = requests[1].tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(task_tools, vec!["ls"]);
    assert!(requests[1].system.starts_with("You are a sub-agent"));

    let child = h.store.get_session("a1").await.unwrap();
    assert_eq!(child.parent_id.as_deref(), Some(session.id.as_str()));
    assert_eq!(child.input_tokens, 15);

    let messages = h.store.list_messages(&session.id).await.unwrap();
    let (answer, ok) = tool_result(&messages[2]);
    assert!(ok);
    assert_eq!(answer, "/repo/src/main.rs:1");

    let parent = h.store.get_session(&session.id).await.unwrap();
    assert!(parent.cost >= child.cost);
    assert_eq!(parent.input_tokens, 50);
    assert_eq!(h.provider.remaining(), 0);
}

#[tokio::test]
async fn shutdown_cancels_running_turns() {
    let reached = Arc::new(Notify::new());
    let h = harness(
        vec![Step::Stall(vec![ProviderEvent::ContentDelta("wor".into())], Arc::clone(&reached))],
        ToolRegistry::new(),
    );
    let session = h.orchestrator.sessions().create("Shutdown").await.unwrap();

    let turn = h.orchestrator.start(&session.id, "work").unwrap();
    reached.notified().await;
    assert!(h.orchestrator.shutdown().await);

    let outcome = turn.await.unwrap().unwrap();
    assert_eq!(outcome.state, TurnState::Cancelled);
    let err = h.orchestrator.run(&session.id, "more").await.unwrap_err();
    assert!(matches!(err, AgentError::ShuttingDown));
}
