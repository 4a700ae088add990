//! 工具执行器
//!
//! dispatch(call)：查找工具 → 记录策略结论（拒绝则不执行）→ 在超时内执行 → 得到 ToolResult；
//! 策略结论在执行前就写一条审计日志（进程中途崩溃也不会丢），执行结束后再写一条结果审计。
//! 两条日志都是结构化 JSON。工具层错误一律成为结构化结果，不向上抛。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::core::ToolError;
use crate::llm::ToolDefinition;
use crate::memory::{Message, ToolCall};
use crate::tools::{PolicyDecision, Tool, ToolRegistry};

/// 工具调用的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { output: String },
    Error { error: ToolError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    pub fn error(&self) -> Option<&ToolError> {
        match &self.outcome {
            ToolOutcome::Error { error } => Some(error),
            ToolOutcome::Success { .. } => None,
        }
    }

    /// 回写给模型的文本
    pub fn content(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success { output } => output.clone(),
            ToolOutcome::Error { error } => error.to_string(),
        }
    }

    /// 追加到 MemoryStore 的 tool 消息
    pub fn to_message(&self) -> Message {
        Message::tool_result(self.call_id.clone(), self.content(), !self.is_success())
    }
}

/// 一次调度：策略结论 + 结果
#[derive(Debug, Clone)]
pub struct ToolDispatch {
    pub decision: PolicyDecision,
    pub result: ToolResult,
}

/// 工具执行器：对每次调用施加超时
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub async fn dispatch(&self, call: &ToolCall) -> ToolDispatch {
        let start = Instant::now();
        let (decision, outcome) = match self.registry.get(&call.name) {
            None => (
                PolicyDecision::Denied {
                    reason: format!("unknown tool '{}'", call.name),
                },
                Err(ToolError::UnknownTool {
                    name: call.name.clone(),
                }),
            ),
            Some(tool) => {
                let decision = tool.check(&call.arguments);
                tracing::info!(audit = %decision_audit(call, &decision).to_string(), "tool decision");
                let outcome = match &decision {
                    PolicyDecision::Denied { reason } => Err(ToolError::AllowlistViolation {
                        reason: reason.clone(),
                    }),
                    PolicyDecision::Allowed => self.run(tool, call).await,
                };
                (decision, outcome)
            }
        };

        let outcome_label = match &outcome {
            Ok(_) => "ok",
            Err(ToolError::AllowlistViolation { .. }) => "denied",
            Err(ToolError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "ok": outcome.is_ok(),
            "outcome": outcome_label,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        ToolDispatch {
            decision,
            result: ToolResult {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                outcome: match outcome {
                    Ok(output) => ToolOutcome::Success { output },
                    Err(error) => ToolOutcome::Error { error },
                },
            },
        }
    }

    async fn run(&self, tool: Arc<dyn Tool>, call: &ToolCall) -> Result<String, ToolError> {
        match timeout(self.timeout, tool.execute(call.arguments.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

/// 执行前的策略结论审计
fn decision_audit(call: &ToolCall, decision: &PolicyDecision) -> serde_json::Value {
    let mut audit = serde_json::json!({
        "event": "tool_decision",
        "tool": call.name,
        "call_id": call.id,
        "args_preview": args_preview(&call.arguments),
    });
    if let (Some(map), Ok(serde_json::Value::Object(fields))) =
        (audit.as_object_mut(), serde_json::to_value(decision))
    {
        map.extend(fields);
    }
    audit
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
