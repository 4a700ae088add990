//! 规范请求 / 响应结构
//!
//! 所有适配器把 ModelRequest 序列化为各自后端的线上格式，并把后端响应解析回 CanonicalResponse：
//! 有序的 {文本片段 | 工具调用} 列表。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::{Message, Role, ToolCall};

/// 未执行工具调用的占位结果
pub const MISSING_RESULT: &str = "no result: the call was interrupted before it ran";

/// 发给后端的工具定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// 参数 JSON Schema
    pub parameters: Value,
}

/// 一次模型调用的规范请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    ToolCall(ToolCall),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// 规范响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub segments: Vec<Segment>,
    /// 后端原始响应（流式时为拼装后的摘要），写入轨迹
    #[serde(default)]
    pub raw: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CanonicalResponse {
    pub fn new(segments: Vec<Segment>, raw: Value) -> Self {
        Self {
            segments,
            raw,
            usage: None,
        }
    }

    /// 只有文本
    pub fn text_only(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(
            vec![Segment::Text { text: text.clone() }],
            serde_json::json!({ "text": text }),
        )
    }

    /// 文本（可为空）加工具调用
    pub fn with_tool_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        let mut segments = Vec::new();
        if !text.is_empty() {
            segments.push(Segment::Text { text });
        }
        segments.extend(calls.into_iter().map(Segment::ToolCall));
        let raw = serde_json::to_value(&segments).unwrap_or(Value::Null);
        Self::new(segments, raw)
    }

    /// 全部文本片段按顺序拼接
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Text { text } => Some(text.as_str()),
                Segment::ToolCall(_) => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::ToolCall(call) => Some(call.clone()),
                Segment::Text { .. } => None,
            })
            .collect()
    }
}

/// 为没有结果的工具调用补占位 tool 消息
///
/// 会话中断时 assistant 的工具调用可能没有对应结果；各后端都要求调用与结果成对出现。
/// 占位结果紧跟在该 assistant 消息已有的结果之后，其余消息顺序不变。
pub fn close_dangling_calls(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut pending: Vec<String> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::Tool => {
                if let Some(id) = &msg.tool_call_id {
                    pending.retain(|p| p != id);
                }
            }
            _ => flush_pending(&mut pending, &mut out),
        }
        out.push(msg.clone());
        if msg.role == Role::Assistant {
            pending = msg.tool_calls.iter().map(|c| c.id.clone()).collect();
        }
    }
    flush_pending(&mut pending, &mut out);
    out
}

fn flush_pending(pending: &mut Vec<String>, out: &mut Vec<Message>) {
    for id in pending.drain(..) {
        out.push(Message::tool_result(id, MISSING_RESULT, true));
    }
}
