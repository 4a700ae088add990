//! 主循环过程事件：供 CLI 或其它前端观察状态迁移、模型调用、工具调用与结果

use serde::Serialize;

use crate::core::LoopState;

/// 单步事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    StateChanged { state: LoopState },
    /// 第 turn 轮开始调用模型
    ModelCall { turn: usize, model: String },
    AssistantText { text: String },
    ToolCall {
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    ToolResult {
        call_id: String,
        tool: String,
        ok: bool,
        preview: String,
    },
    PolicyDenied { tool: String, reason: String },
    /// 守卫或修复提示追加的续跑消息
    Nudge { text: String },
    Interrupted { detail: String },
    Finished { state: LoopState },
}
