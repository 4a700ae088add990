//! 错误恢复引擎
//!
//! 根据 ProviderError 返回 RecoveryAction，供主循环决定是注入修复提示后重试一次，还是终止会话。
//! 鉴权 / 配额 / 配置错误从不在循环内自动恢复；瞬时网络错误已由适配器层重试过，到这里同样终止。

use crate::core::ProviderError;

/// 恢复引擎给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将提示追加为 user 消息，重新调用模型（仅用于响应畸形，且每轮只一次）
    RetryWithPrompt(String),
    /// 终止会话并把分类后的错误交给调用方
    Abort,
}

/// 响应畸形时的修复提示
pub const REPAIR_PROMPT: &str = "Your previous response could not be parsed. \
Reply again with plain text and, if you need a tool, a well-formed tool call whose arguments are a valid JSON object.";

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// repair_attempted：本轮是否已经做过一次修复重试
    pub fn handle(&self, err: &ProviderError, repair_attempted: bool) -> RecoveryAction {
        match err {
            ProviderError::MalformedResponse { .. } if !repair_attempted => {
                RecoveryAction::RetryWithPrompt(REPAIR_PROMPT.to_string())
            }
            _ => RecoveryAction::Abort,
        }
    }
}
