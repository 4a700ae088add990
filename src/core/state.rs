//! 主循环状态、终态与退出码
//!
//! LoopState 为状态机的各阶段；Outcome 为会话终态（DONE / CANCELLED / GUARD_STOPPED）；
//! exit_codes 为批处理协作方区分部分失败与完全失败所用的稳定退出码。

use std::fmt;

use serde::Serialize;

use crate::core::{AgentError, GuardExceeded, ProviderError};

/// 主循环阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    AwaitingInput,
    BuildingPrompt,
    CallingModel,
    ProcessingResponse,
    ExecutingTools,
    ApplyingGuard,
    Done,
    Cancelled,
    GuardStopped,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::GuardStopped)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitingInput => "AWAITING_INPUT",
            Self::BuildingPrompt => "BUILDING_PROMPT",
            Self::CallingModel => "CALLING_MODEL",
            Self::ProcessingResponse => "PROCESSING_RESPONSE",
            Self::ExecutingTools => "EXECUTING_TOOLS",
            Self::ApplyingGuard => "APPLYING_GUARD",
            Self::Done => "DONE",
            Self::Cancelled => "CANCELLED",
            Self::GuardStopped => "GUARD_STOPPED",
        };
        f.write_str(s)
    }
}

/// 会话终态
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// 最终纯文本回答，无待执行工具
    Done { answer: String },
    Cancelled,
    GuardStopped(GuardExceeded),
}

impl Outcome {
    pub fn state(&self) -> LoopState {
        match self {
            Self::Done { .. } => LoopState::Done,
            Self::Cancelled => LoopState::Cancelled,
            Self::GuardStopped(_) => LoopState::GuardStopped,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Done { .. } => exit_codes::DONE,
            Self::Cancelled => exit_codes::CANCELLED,
            Self::GuardStopped(_) => exit_codes::GUARD_STOPPED,
        }
    }
}

/// 稳定退出码
pub mod exit_codes {
    /// 循环到达 DONE
    pub const DONE: i32 = 0;
    /// 模型后端或运行时失败（瞬时网络、响应畸形、持久化等）
    pub const FAILURE: i32 = 1;
    /// 配置错误，包括无法路由的模型标识
    pub const CONFIG: i32 = 2;
    pub const CANCELLED: i32 = 3;
    pub const GUARD_STOPPED: i32 = 4;
    pub const AUTH: i32 = 5;
    pub const QUOTA: i32 = 6;
    /// 任务输入缺失或不可读
    pub const INPUT: i32 = 7;
}

impl AgentError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Provider(ProviderError::Auth { .. }) => exit_codes::AUTH,
            Self::Provider(ProviderError::QuotaExceeded { .. }) => exit_codes::QUOTA,
            Self::Provider(ProviderError::Config(_)) | Self::Config(_) => exit_codes::CONFIG,
            Self::Input(_) => exit_codes::INPUT,
            Self::Provider(_) | Self::Persistence(_) | Self::SessionNotFound(_) => {
                exit_codes::FAILURE
            }
        }
    }
}
