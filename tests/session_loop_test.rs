//! 主循环集成测试：脚本化适配器 + 临时目录，不访问网络

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use bee_code::core::recovery::REPAIR_PROMPT;
use bee_code::core::{exit_codes, AgentError, LoopState, Outcome, ProviderError, Session, ToolError};
use bee_code::extensions::ExtensionPipeline;
use bee_code::llm::{CanonicalResponse, ModelAdapter, ScriptedAdapter};
use bee_code::memory::{
    MemoryStore, PersistedSession, Role, SessionStore, ToolCall, TrajectoryDocument, TurnStatus,
};
use bee_code::react::guard::{CONTINUE_MESSAGE, INTENT_NUDGE};
use bee_code::react::{load_session, IntentGuard, LoopEvent, LoopSettings, Orchestrator};
use bee_code::tools::{
    BashTool, CommandPolicy, CommandValidator, OutputLimits, PolicyDecision, Tool, ToolExecutor,
    ToolRegistry, UpdateTaskProgressTool, UPDATE_TASK_PROGRESS,
};

fn call(id: &str, name: &str, args: Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        arguments: args,
    }
}

fn bash(id: &str, command: &str) -> ToolCall {
    call(id, "bash", json!({ "command": command }))
}

struct Harness {
    _dir: tempfile::TempDir,
    workdir: std::path::PathBuf,
    store: SessionStore,
    spawns: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("repo");
        std::fs::create_dir_all(&workdir).unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        Self {
            _dir: dir,
            workdir,
            store,
            spawns: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn registry(&mut self, extra: Vec<Arc<dyn Tool>>) -> ToolRegistry {
        let validator = CommandValidator::new(&CommandPolicy::default()).unwrap();
        let bash = BashTool::new(validator, &self.workdir, 30, OutputLimits::default());
        self.spawns = bash.spawn_counter();
        let mut registry = ToolRegistry::new();
        registry.register(bash);
        for tool in extra {
            registry.register_arc(tool);
        }
        registry
    }

    fn orchestrator(
        &mut self,
        adapter: Arc<dyn ModelAdapter>,
        extensions: ExtensionPipeline,
        extra: Vec<Arc<dyn Tool>>,
    ) -> Orchestrator {
        let registry = self.registry(extra);
        Orchestrator::new(
            Session::new(&self.workdir),
            MemoryStore::new(),
            self.store.clone(),
            adapter,
            ToolExecutor::new(registry, 30),
            extensions,
            LoopSettings::new("claude-test"),
        )
        .unwrap()
    }

    fn trajectory(&self, path: &std::path::Path) -> TrajectoryDocument {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }
}

fn guard(enabled: bool) -> ExtensionPipeline {
    ExtensionPipeline::new().with(IntentGuard::new(enabled, 1))
}

/// 执行时触发取消的工具
struct CancelTool {
    token: CancellationToken,
}

#[async_trait]
impl Tool for CancelTool {
    fn name(&self) -> &str {
        "stop_here"
    }

    fn description(&self) -> &str {
        "cancels the session"
    }

    async fn execute(&self, _args: Value) -> Result<String, ToolError> {
        self.token.cancel();
        Ok("stopping".into())
    }
}

#[tokio::test]
async fn test_tool_results_follow_calls_in_order() {
    let mut h = Harness::new();
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        Ok(CanonicalResponse::with_tool_calls(
            "Listing first.",
            vec![bash("c1", "echo a"), bash("c2", "echo b")],
        )),
        Ok(CanonicalResponse::text_only("both printed")),
    ]));
    let mut orch = h.orchestrator(adapter.clone(), guard(false), vec![]);
    let report = orch.run("print a then b").await.unwrap();

    assert_eq!(
        report.outcome,
        Outcome::Done {
            answer: "both printed".into()
        }
    );
    assert_eq!(report.turns, 2);
    assert_eq!(adapter.calls(), 2);

    let messages = orch.memory().messages();
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
    );
    assert_eq!(messages[1].tool_calls.len(), 2);
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(messages[2].content, "a\n");
    assert_eq!(messages[3].tool_call_id.as_deref(), Some("c2"));
    assert_eq!(messages[3].content, "b\n");
    assert_eq!(h.spawns.load(Ordering::SeqCst), 2);

    // 第二次请求看到的是第一轮完整的调用与结果
    let second = &adapter.requests()[1];
    assert_eq!(second.messages.len(), 4);
    assert_eq!(second.tools[0].name, "bash");

    let doc = h.trajectory(&report.trajectory_path);
    assert_eq!(doc.turns.len(), 2);
    assert_eq!(doc.turns[0].tool_calls.len(), 2);
    assert!(doc.turns.iter().all(|t| t.status == TurnStatus::Complete));

    let persisted: PersistedSession = h.store.load(&report.session_id).unwrap();
    assert_eq!(persisted.messages, messages.to_vec());
    assert_eq!(persisted.turns, 2);
}

#[tokio::test]
async fn test_denied_command_never_spawns() {
    let mut h = Harness::new();
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        Ok(CanonicalResponse::with_tool_calls(
            "",
            vec![bash("c1", "rm -rf build")],
        )),
        Ok(CanonicalResponse::text_only("could not clean")),
    ]));
    let mut orch = h.orchestrator(adapter, guard(false), vec![]);
    let report = orch.run("clean the build dir").await.unwrap();

    assert_eq!(h.spawns.load(Ordering::SeqCst), 0);
    let result = &orch.memory().messages()[2];
    assert_eq!(result.role, Role::Tool);
    assert!(result.is_error);

    let doc = h.trajectory(&report.trajectory_path);
    let record = &doc.turns[0].tool_calls[0];
    assert!(matches!(record.decision, PolicyDecision::Denied { .. }));
    assert!(matches!(
        record.result.as_ref().and_then(|r| r.error()),
        Some(ToolError::AllowlistViolation { .. })
    ));
}

#[tokio::test]
async fn test_substitutions_in_arithmetic_and_heredoc_never_spawn() {
    let mut h = Harness::new();
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        Ok(CanonicalResponse::with_tool_calls(
            "",
            vec![
                bash("c1", "echo $(( $(id -u) + 0 ))"),
                bash("c2", "cat <<EOF\n$(whoami)\nEOF"),
            ],
        )),
        Ok(CanonicalResponse::text_only("blocked")),
    ]));
    let mut orch = h.orchestrator(adapter, guard(false), vec![]);
    let report = orch.run("who am I").await.unwrap();

    assert_eq!(h.spawns.load(Ordering::SeqCst), 0);
    let doc = h.trajectory(&report.trajectory_path);
    assert!(doc.turns[0]
        .tool_calls
        .iter()
        .all(|r| matches!(r.decision, PolicyDecision::Denied { .. })));
}

#[tokio::test]
async fn test_partial_progress_asks_model_to_continue() {
    let mut h = Harness::new();
    let progress = |id: &str, pct: u8| {
        call(
            id,
            UPDATE_TASK_PROGRESS,
            json!({"progress": pct, "title": "parser", "description": "found the bug"}),
        )
    };
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        Ok(CanonicalResponse::with_tool_calls("", vec![progress("p1", 40)])),
        Ok(CanonicalResponse::with_tool_calls("", vec![bash("c1", "true")])),
        Ok(CanonicalResponse::with_tool_calls("", vec![progress("p2", 100)])),
        Ok(CanonicalResponse::text_only("done")),
    ]));
    let mut orch = h.orchestrator(adapter.clone(), guard(true), vec![Arc::new(UpdateTaskProgressTool)]);
    let report = orch.run("fix the bug in the parser file").await.unwrap();

    assert_eq!(report.outcome, Outcome::Done { answer: "done".into() });
    let with_continue: Vec<bool> = adapter
        .requests()
        .iter()
        .map(|r| r.system.contains(CONTINUE_MESSAGE))
        .collect();
    assert_eq!(with_continue, vec![false, true, false, false]);
}

#[tokio::test]
async fn test_cancel_during_tools_records_partial_turn() {
    let mut h = Harness::new();
    let token = CancellationToken::new();
    let adapter = Arc::new(ScriptedAdapter::new(vec![Ok(CanonicalResponse::with_tool_calls(
        "working",
        vec![call("c1", "stop_here", json!({})), bash("c2", "echo never")],
    ))]));
    let stop: Arc<dyn Tool> = Arc::new(CancelTool {
        token: token.clone(),
    });
    let mut orch = h
        .orchestrator(adapter.clone(), guard(true), vec![stop])
        .with_cancel(token);
    let report = orch.run("do the work").await.unwrap();

    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(report.outcome.exit_code(), exit_codes::CANCELLED);
    assert_eq!(orch.state(), LoopState::Cancelled);
    assert_eq!(adapter.calls(), 1);
    assert_eq!(h.spawns.load(Ordering::SeqCst), 0);

    let messages = orch.memory().messages();
    let interruptions = messages
        .iter()
        .filter(|m| m.content.starts_with("[interrupted]"))
        .count();
    assert_eq!(interruptions, 1);
    // 跳过的调用也有对应的结果
    let skipped = messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("c2"))
        .unwrap();
    assert!(skipped.is_error);

    let doc = h.trajectory(&report.trajectory_path);
    assert_eq!(doc.turns.len(), 1);
    assert_eq!(doc.turns[0].status, TurnStatus::Interrupted);
    assert_eq!(doc.turns[0].tool_calls.len(), 2);
    assert!(doc.turns[0].tool_calls[1].result.is_none());
}

#[tokio::test]
async fn test_resume_after_cancel() {
    let mut h = Harness::new();
    let token = CancellationToken::new();
    token.cancel();
    let first = Arc::new(ScriptedAdapter::new(vec![]));
    let mut orch = h.orchestrator(first.clone(), guard(false), vec![]).with_cancel(token);
    let report = orch.run("fix the failing test").await.unwrap();
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(first.calls(), 0);

    let (session, memory) = load_session(&h.store, &report.session_id).unwrap();
    assert_eq!(session.id(), report.session_id);
    assert_eq!(memory.len(), 2);

    let second = Arc::new(ScriptedAdapter::new(vec![Ok(CanonicalResponse::text_only(
        "fixed",
    ))]));
    let registry = h.registry(vec![]);
    let mut resumed = Orchestrator::new(
        session,
        memory,
        h.store.clone(),
        second.clone(),
        ToolExecutor::new(registry, 30),
        guard(false),
        LoopSettings::new("claude-test"),
    )
    .unwrap();
    let report = resumed.resume(Some("carry on")).await.unwrap();

    assert_eq!(report.outcome, Outcome::Done { answer: "fixed".into() });
    let sent = &second.requests()[0].messages;
    assert_eq!(sent.len(), 3);
    assert!(sent[1].content.starts_with("[interrupted]"));
    assert_eq!(sent[2].content, "carry on");
}

#[tokio::test]
async fn test_guard_off_text_only_is_final() {
    let mut h = Harness::new();
    let adapter = Arc::new(ScriptedAdapter::new(vec![Ok(CanonicalResponse::text_only(
        "I'll check the repository structure.",
    ))]));
    let mut orch = h.orchestrator(adapter.clone(), guard(false), vec![]);
    let report = orch.run("fix the bug in the parser file").await.unwrap();

    assert!(matches!(report.outcome, Outcome::Done { .. }));
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test]
async fn test_guard_on_nudges_then_stops() {
    let mut h = Harness::new();
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        Ok(CanonicalResponse::text_only("I'll check the repository structure.")),
        Ok(CanonicalResponse::text_only("Let me look at the files.")),
        Ok(CanonicalResponse::text_only("unreachable")),
    ]));
    let mut orch = h.orchestrator(adapter.clone(), guard(true), vec![]);
    let report = orch.run("fix the bug in the parser file").await.unwrap();

    assert!(matches!(report.outcome, Outcome::GuardStopped(_)));
    assert_eq!(report.outcome.exit_code(), exit_codes::GUARD_STOPPED);
    assert_eq!(adapter.calls(), 2);
    let nudges = orch
        .memory()
        .messages()
        .iter()
        .filter(|m| m.content == INTENT_NUDGE)
        .count();
    assert_eq!(nudges, 1);
    assert!(adapter.requests()[0].system.contains("SOLO MODE"));
}

#[tokio::test]
async fn test_iteration_cap_stops_tool_loops() {
    let mut h = Harness::new();
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        Ok(CanonicalResponse::with_tool_calls("", vec![bash("c1", "true")])),
        Ok(CanonicalResponse::with_tool_calls("", vec![bash("c2", "true")])),
        Ok(CanonicalResponse::with_tool_calls("", vec![bash("c3", "true")])),
    ]));
    let registry = h.registry(vec![]);
    let mut settings = LoopSettings::new("claude-test");
    settings.max_iterations = 2;
    let mut orch = Orchestrator::new(
        Session::new(&h.workdir),
        MemoryStore::new(),
        h.store.clone(),
        adapter.clone(),
        ToolExecutor::new(registry, 30),
        guard(false),
        settings,
    )
    .unwrap();
    let report = orch.run("loop forever").await.unwrap();

    match report.outcome {
        Outcome::GuardStopped(g) => assert!(g.diagnostic.contains("2 model calls")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(adapter.calls(), 2);
}

#[tokio::test]
async fn test_malformed_response_is_repaired_once() {
    let mut h = Harness::new();
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        Err(ProviderError::malformed("scripted", "no content")),
        Ok(CanonicalResponse::text_only("done")),
    ]));
    let mut orch = h.orchestrator(adapter.clone(), guard(false), vec![]);
    let report = orch.run("summarise").await.unwrap();

    assert_eq!(report.outcome, Outcome::Done { answer: "done".into() });
    assert!(orch
        .memory()
        .messages()
        .iter()
        .any(|m| m.role == Role::User && m.content == REPAIR_PROMPT));
    let doc = h.trajectory(&report.trajectory_path);
    let statuses: Vec<TurnStatus> = doc.turns.iter().map(|t| t.status).collect();
    assert_eq!(statuses, vec![TurnStatus::Failed, TurnStatus::Complete]);
}

#[tokio::test]
async fn test_second_malformed_response_is_terminal() {
    let mut h = Harness::new();
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        Err(ProviderError::malformed("scripted", "bad")),
        Err(ProviderError::malformed("scripted", "still bad")),
    ]));
    let mut orch = h.orchestrator(adapter.clone(), guard(false), vec![]);
    let err = orch.run("summarise").await.unwrap_err();

    assert!(matches!(
        err,
        AgentError::Provider(ProviderError::MalformedResponse { .. })
    ));
    assert_eq!(err.exit_code(), exit_codes::FAILURE);
    assert_eq!(adapter.calls(), 2);
}

#[tokio::test]
async fn test_auth_error_aborts_without_retry() {
    let mut h = Harness::new();
    let adapter = Arc::new(ScriptedAdapter::new(vec![Err(ProviderError::from_status(
        "scripted",
        401,
        "bad key",
        None,
    ))]));
    let mut orch = h.orchestrator(adapter.clone(), guard(false), vec![]);
    let err = orch.run("summarise").await.unwrap_err();

    assert_eq!(err.exit_code(), exit_codes::AUTH);
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test]
async fn test_events_report_state_transitions() {
    let mut h = Harness::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let adapter = Arc::new(ScriptedAdapter::new(vec![Ok(CanonicalResponse::text_only("hi"))]));
    let mut orch = h
        .orchestrator(adapter, guard(false), vec![])
        .with_events(tx);
    orch.run("say hi").await.unwrap();
    drop(orch);

    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    assert!(matches!(
        events.first(),
        Some(LoopEvent::StateChanged {
            state: LoopState::BuildingPrompt
        })
    ));
    assert!(matches!(
        events.last(),
        Some(LoopEvent::Finished {
            state: LoopState::Done
        })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, LoopEvent::AssistantText { text } if text == "hi")));
}

#[tokio::test]
async fn test_unknown_session_id() {
    let h = Harness::new();
    let err = load_session(&h.store, "does-not-exist").unwrap_err();
    assert!(matches!(err, AgentError::SessionNotFound(_)));
}
