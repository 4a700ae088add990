//! 主循环
//!
//! BUILDING_PROMPT -> CALLING_MODEL -> PROCESSING_RESPONSE -> EXECUTING_TOOLS -> APPLYING_GUARD，
//! 直到 DONE / CANCELLED / GUARD_STOPPED 或分类后的错误。每轮结束持久化对话并写入轨迹记录；
//! 任何终态都会导出轨迹文档。取消在模型调用期间立即生效，在工具执行期间于两个工具之间生效。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{
    AgentError, GuardExceeded, LoopState, Outcome, ProviderError, RecoveryAction, RecoveryEngine,
    Session,
};
use crate::extensions::{ExtensionPipeline, HookFlow, PromptContext};
use crate::llm::{ModelAdapter, ModelRequest};
use crate::memory::{
    Message, MemoryStore, PersistedSession, PromptSnapshot, SessionStore, ToolCallRecord,
    TrajectoryRecorder, TurnRecord, TurnStatus,
};
use crate::react::{parse_output, LoopEvent, ParsedOutput};
use crate::tools::{PolicyDecision, ToolExecutor};

/// 默认系统提示
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Bee Code, a software engineering agent working \
inside the user's repository. Use the available tools to inspect and change files and to run \
commands. When the task is finished, reply with a short plain-text summary and no tool calls.";

/// 工具结果事件预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 循环参数
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub model: String,
    pub system_prompt: String,
    pub stream: bool,
    /// 单次 run / resume 内模型调用次数上限
    pub max_iterations: usize,
}

impl LoopSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            stream: false,
            max_iterations: 1000,
        }
    }
}

/// 会话结束报告
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub outcome: Outcome,
    /// 会话累计轮次
    pub turns: usize,
    pub trajectory_path: PathBuf,
}

/// 从持久化存储恢复会话与对话
pub fn load_session(store: &SessionStore, session_id: &str) -> Result<(Session, MemoryStore), AgentError> {
    if !store.exists(session_id) {
        return Err(AgentError::SessionNotFound(session_id.to_string()));
    }
    let persisted = store.load(session_id).map_err(persistence)?;
    let session = Session::restore(persisted.session_id, persisted.workdir, persisted.turns)?;
    Ok((session, MemoryStore::from_messages(persisted.messages)))
}

fn persistence(e: anyhow::Error) -> AgentError {
    AgentError::Persistence(format!("{e:#}"))
}

fn send_event(tx: &Option<UnboundedSender<LoopEvent>>, ev: LoopEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() <= RESULT_PREVIEW_CHARS {
        s.to_string()
    } else {
        let head: String = s.chars().take(RESULT_PREVIEW_CHARS).collect();
        format!("{head}...")
    }
}

/// 单个会话的编排器：独占该会话的对话、轨迹与工具执行器
pub struct Orchestrator {
    session: Session,
    memory: MemoryStore,
    store: SessionStore,
    trajectory: TrajectoryRecorder,
    adapter: Arc<dyn ModelAdapter>,
    executor: ToolExecutor,
    extensions: ExtensionPipeline,
    recovery: RecoveryEngine,
    settings: LoopSettings,
    cancel: CancellationToken,
    event_tx: Option<UnboundedSender<LoopEvent>>,
    state: LoopState,
}

impl Orchestrator {
    pub fn new(
        session: Session,
        memory: MemoryStore,
        store: SessionStore,
        adapter: Arc<dyn ModelAdapter>,
        executor: ToolExecutor,
        extensions: ExtensionPipeline,
        settings: LoopSettings,
    ) -> Result<Self, AgentError> {
        let trajectory = TrajectoryRecorder::open(&store, session.id()).map_err(persistence)?;
        Ok(Self {
            session,
            memory,
            store,
            trajectory,
            adapter,
            executor,
            extensions,
            recovery: RecoveryEngine::new(),
            settings,
            cancel: CancellationToken::new(),
            event_tx: None,
            state: LoopState::AwaitingInput,
        })
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 以任务描述作为首条 user 消息启动会话
    pub async fn run(&mut self, task: &str) -> Result<SessionReport, AgentError> {
        if task.trim().is_empty() {
            return Err(AgentError::Input("task is empty".into()));
        }
        tracing::info!(session = self.session.id(), model = %self.settings.model, "session started");
        self.memory.append(Message::user(task));
        self.persist()?;
        self.drive().await
    }

    /// 恢复已加载的会话；可附带一条后续指令
    pub async fn resume(&mut self, follow_up: Option<&str>) -> Result<SessionReport, AgentError> {
        tracing::info!(
            session = self.session.id(),
            turns = self.session.turns(),
            messages = self.memory.len(),
            "session resumed"
        );
        if let Some(text) = follow_up.map(str::trim).filter(|t| !t.is_empty()) {
            self.memory.append(Message::user(text));
        }
        if self.memory.is_empty() {
            return Err(AgentError::Input("resumed session has no conversation".into()));
        }
        self.persist()?;
        self.drive().await
    }

    async fn drive(&mut self) -> Result<SessionReport, AgentError> {
        let mut repair_attempted = false;
        let mut iterations = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return self.interrupt(None, "cancelled before the next model call");
            }
            if iterations >= self.settings.max_iterations {
                return self.finish(Outcome::GuardStopped(GuardExceeded {
                    diagnostic: format!(
                        "reached the limit of {} model calls",
                        self.settings.max_iterations
                    ),
                }));
            }
            iterations += 1;

            self.set_state(LoopState::BuildingPrompt);
            let mut ctx = PromptContext {
                system: self.settings.system_prompt.clone(),
                messages: self.memory.snapshot(),
                tools: self.executor.definitions(),
            };
            if let HookFlow::Halt(diagnostic) = self.extensions.pre_call(&mut ctx) {
                return self.finish(Outcome::GuardStopped(GuardExceeded { diagnostic }));
            }

            let index = self.session.next_turn();
            let mut record = TurnRecord::begin(
                self.session.id(),
                index,
                PromptSnapshot {
                    model: self.settings.model.clone(),
                    system: ctx.system.clone(),
                    messages: ctx.messages.clone(),
                    tools: ctx.tools.iter().map(|t| t.name.clone()).collect(),
                },
            );
            let request = ModelRequest {
                model: self.settings.model.clone(),
                system: ctx.system,
                messages: ctx.messages,
                tools: ctx.tools,
                stream: self.settings.stream,
            };

            self.set_state(LoopState::CallingModel);
            send_event(
                &self.event_tx,
                LoopEvent::ModelCall {
                    turn: index,
                    model: self.settings.model.clone(),
                },
            );
            let adapter = self.adapter.clone();
            let cancel = self.cancel.clone();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = adapter.complete(&request) => Some(r),
            };
            let Some(result) = result else {
                return self.interrupt(Some(record), &format!("model call for turn {index} was cancelled"));
            };

            let parsed = match result {
                Ok(mut response) => {
                    if let Some(usage) = &response.usage {
                        tracing::info!(
                            turn = index,
                            input_tokens = usage.input_tokens,
                            output_tokens = usage.output_tokens,
                            "model usage"
                        );
                    }
                    let flow = self.extensions.post_call(&mut response);
                    record.raw_response = response.raw.clone();
                    if let HookFlow::Halt(diagnostic) = flow {
                        return self.halt_turn(record, diagnostic);
                    }
                    parse_output(adapter.backend(), &response)
                }
                Err(e) => Err(e),
            };

            let parsed = match parsed {
                Ok(p) => p,
                Err(e) => match self.recovery.handle(&e, repair_attempted) {
                    RecoveryAction::RetryWithPrompt(prompt) => {
                        tracing::warn!(turn = index, error = %e, "malformed response, re-prompting once");
                        repair_attempted = true;
                        self.record_failed(record, &e)?;
                        self.memory.append(Message::user(prompt.clone()));
                        send_event(&self.event_tx, LoopEvent::Nudge { text: prompt });
                        self.persist()?;
                        continue;
                    }
                    RecoveryAction::Abort => {
                        tracing::error!(turn = index, category = e.category(), error = %e, "model call failed");
                        self.record_failed(record, &e)?;
                        self.persist()?;
                        if let Err(err) = self.trajectory.export() {
                            tracing::warn!(error = %err, "trajectory export failed");
                        }
                        return Err(AgentError::Provider(e));
                    }
                },
            };
            repair_attempted = false;

            self.set_state(LoopState::ProcessingResponse);
            if !parsed.text.is_empty() {
                send_event(
                    &self.event_tx,
                    LoopEvent::AssistantText {
                        text: parsed.text.clone(),
                    },
                );
            }
            let output_flow = self.extensions.post_output(&parsed);
            self.memory.append(Message::assistant_with_tools(
                parsed.text.clone(),
                parsed.tool_calls.clone(),
            ));
            if let HookFlow::Halt(diagnostic) = output_flow {
                return self.halt_turn(record, diagnostic);
            }

            if parsed.has_tool_calls() {
                self.set_state(LoopState::ExecutingTools);
                if let Some(detail) = self.execute_tools(&parsed, &mut record).await {
                    return self.interrupt(Some(record), &detail);
                }
            }

            self.set_state(LoopState::ApplyingGuard);
            record.finish(TurnStatus::Complete);
            self.trajectory.append(&record).map_err(persistence)?;
            let flow = self.extensions.post_turn(&parsed, &record);

            match flow {
                HookFlow::Halt(diagnostic) => {
                    self.persist()?;
                    return self.finish(Outcome::GuardStopped(GuardExceeded { diagnostic }));
                }
                HookFlow::Nudge(text) => {
                    self.memory.append(Message::user(text.clone()));
                    send_event(&self.event_tx, LoopEvent::Nudge { text });
                    self.persist()?;
                }
                HookFlow::Proceed if parsed.has_tool_calls() => self.persist()?,
                HookFlow::Proceed => {
                    self.persist()?;
                    return self.finish(Outcome::Done {
                        answer: parsed.text,
                    });
                }
            }
        }
    }

    /// 按顺序执行本轮工具调用；被取消时返回中断说明，未执行的调用记为跳过
    async fn execute_tools(&mut self, parsed: &ParsedOutput, record: &mut TurnRecord) -> Option<String> {
        let total = parsed.tool_calls.len();
        for (i, call) in parsed.tool_calls.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.skip_remaining(parsed, i, record);
                return Some(format!(
                    "cancelled before tool call '{}' ({}/{total})",
                    call.name,
                    i + 1
                ));
            }

            send_event(
                &self.event_tx,
                LoopEvent::ToolCall {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    args: call.arguments.clone(),
                },
            );
            let dispatch = self.executor.dispatch(call).await;
            if let PolicyDecision::Denied { reason } = &dispatch.decision {
                send_event(
                    &self.event_tx,
                    LoopEvent::PolicyDenied {
                        tool: call.name.clone(),
                        reason: reason.clone(),
                    },
                );
            }
            self.memory.append(dispatch.result.to_message());
            send_event(
                &self.event_tx,
                LoopEvent::ToolResult {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    ok: dispatch.result.is_success(),
                    preview: preview(&dispatch.result.content()),
                },
            );
            record.tool_calls.push(ToolCallRecord {
                call: call.clone(),
                decision: dispatch.decision,
                result: Some(dispatch.result),
            });

            if self.cancel.is_cancelled() {
                self.skip_remaining(parsed, i + 1, record);
                return Some(format!(
                    "cancelled after tool call '{}' ({}/{total})",
                    call.name,
                    i + 1
                ));
            }
        }
        None
    }

    fn skip_remaining(&mut self, parsed: &ParsedOutput, from: usize, record: &mut TurnRecord) {
        for call in &parsed.tool_calls[from..] {
            let reason = "skipped: session cancelled".to_string();
            self.memory
                .append(Message::tool_result(call.id.clone(), reason.clone(), true));
            record.tool_calls.push(ToolCallRecord {
                call: call.clone(),
                decision: PolicyDecision::Denied { reason },
                result: None,
            });
        }
    }

    /// 追加唯一一条中断消息，写入部分轮次记录后以 CANCELLED 结束
    fn interrupt(&mut self, record: Option<TurnRecord>, detail: &str) -> Result<SessionReport, AgentError> {
        tracing::warn!(session = self.session.id(), detail, "session interrupted");
        self.memory.append(Message::user(format!(
            "[interrupted] {detail}. The previous run was stopped before this work finished."
        )));
        if let Some(mut record) = record {
            record.note = Some(detail.to_string());
            record.finish(TurnStatus::Interrupted);
            self.trajectory.append(&record).map_err(persistence)?;
        }
        self.persist()?;
        send_event(
            &self.event_tx,
            LoopEvent::Interrupted {
                detail: detail.to_string(),
            },
        );
        self.finish(Outcome::Cancelled)
    }

    fn halt_turn(&mut self, mut record: TurnRecord, diagnostic: String) -> Result<SessionReport, AgentError> {
        record.note = Some(diagnostic.clone());
        record.finish(TurnStatus::Complete);
        self.trajectory.append(&record).map_err(persistence)?;
        self.persist()?;
        self.finish(Outcome::GuardStopped(GuardExceeded { diagnostic }))
    }

    fn record_failed(&mut self, mut record: TurnRecord, err: &ProviderError) -> Result<(), AgentError> {
        record.note = Some(format!("{}: {err}", err.category()));
        record.finish(TurnStatus::Failed);
        self.trajectory.append(&record).map_err(persistence)
    }

    fn finish(&mut self, outcome: Outcome) -> Result<SessionReport, AgentError> {
        self.set_state(outcome.state());
        let trajectory_path = self.trajectory.export().map_err(persistence)?;
        tracing::info!(
            session = self.session.id(),
            state = %outcome.state(),
            turns = self.session.turns(),
            trajectory = %trajectory_path.display(),
            "session finished"
        );
        send_event(
            &self.event_tx,
            LoopEvent::Finished {
                state: outcome.state(),
            },
        );
        Ok(SessionReport {
            session_id: self.session.id().to_string(),
            outcome,
            turns: self.session.turns(),
            trajectory_path,
        })
    }

    fn persist(&self) -> Result<(), AgentError> {
        self.store
            .persist(&PersistedSession {
                session_id: self.session.id().to_string(),
                workdir: self.session.workdir().to_path_buf(),
                turns: self.session.turns(),
                updated_at: chrono::Utc::now(),
                messages: self.memory.snapshot(),
            })
            .map_err(persistence)
    }

    fn set_state(&mut self, state: LoopState) {
        self.state = state;
        tracing::debug!(session = self.session.id(), %state, "state");
        send_event(&self.event_tx, LoopEvent::StateChanged { state });
    }
}

