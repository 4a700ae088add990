//! 错误分类
//!
//! - ProviderError：模型适配器层（鉴权 / 配额 / 瞬时网络 / 响应畸形 / 配置），由适配器负责归类；
//! - ToolError：工具层结构化错误，作为对话内容回写给模型，不终止循环；
//! - AgentError：主循环层，包装 ProviderError 并加上配置、持久化、输入等错误；
//! - GuardExceeded：意图守卫或迭代上限触发时的诊断信息。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 模型后端错误（已由适配器归类，不以不透明字符串上抛）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// 凭据无效或缺失：致命，不重试
    #[error("authentication failed for {backend}: {message}")]
    Auth { backend: String, message: String },

    /// 后端配额 / 限流：交由调用方（运维）决定何时重试，循环本身不自动重试
    #[error("quota exceeded for {backend}: {message}")]
    QuotaExceeded {
        backend: String,
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// 连接失败 / 超时 / 5xx：仅在适配器层做有限次退避重试
    #[error("transient network error from {backend}: {message}")]
    TransientNetwork { backend: String, message: String },

    /// 响应无法解析为规范结构
    #[error("malformed response from {backend}: {message}")]
    MalformedResponse { backend: String, message: String },

    /// 其它 4xx（请求本身有问题），不重试
    #[error("{backend} returned HTTP {status}: {message}")]
    Api {
        backend: String,
        status: u16,
        message: String,
    },

    /// 模型无法路由、缺少端点等配置问题（在任何网络调用之前失败）
    #[error("provider configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// 是否允许适配器层自动重试：只有瞬时网络错误
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    /// 日志与轨迹中使用的短分类名
    pub fn category(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::QuotaExceeded { .. } => "quota",
            Self::TransientNetwork { .. } => "transient_network",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::Api { .. } => "api",
            Self::Config(_) => "config",
        }
    }

    pub fn malformed(backend: &str, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn transient(backend: &str, message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    /// 按 HTTP 状态码与响应体归类后端错误
    ///
    /// 401/403 → Auth；429 或正文提到 quota → QuotaExceeded；408 / 5xx → TransientNetwork；其余 4xx → Api。
    pub fn from_status(
        backend: &str,
        status: u16,
        body: &str,
        retry_after_ms: Option<u64>,
    ) -> Self {
        let message = summarize_body(body);
        let lowered = body.to_lowercase();
        match status {
            401 | 403 => Self::Auth {
                backend: backend.to_string(),
                message,
            },
            429 => Self::QuotaExceeded {
                backend: backend.to_string(),
                message,
                retry_after_ms,
            },
            _ if lowered.contains("quota") || lowered.contains("resource_exhausted") => {
                Self::QuotaExceeded {
                    backend: backend.to_string(),
                    message,
                    retry_after_ms,
                }
            }
            408 | 500..=599 => Self::TransientNetwork {
                backend: backend.to_string(),
                message: format!("HTTP {status}: {message}"),
            },
            _ => Self::Api {
                backend: backend.to_string(),
                status,
                message,
            },
        }
    }
}

/// 错误正文过长时只保留前 500 个字符
fn summarize_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 500 {
        format!("{}...", trimmed.chars().take(500).collect::<String>())
    } else {
        trimmed.to_string()
    }
}

/// 工具层结构化错误：以 ToolResult 的形式回到对话中
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    /// 命令或路径未通过策略校验，工具从未执行
    #[error("AllowlistViolation: {reason}")]
    AllowlistViolation { reason: String },

    #[error("ToolTimeout: tool did not finish within {secs}s")]
    Timeout { secs: u64 },

    /// 非零退出码，附带（已截断的）stdout / stderr
    #[error("ToolExecutionError: command exited with code {exit_code}\n{output}")]
    Execution { exit_code: i32, output: String },

    #[error("InvalidArguments: {message}")]
    InvalidArguments { message: String },

    #[error("UnknownTool: no tool named '{name}'")]
    UnknownTool { name: String },

    /// 其它工具内部失败（文件不存在、替换不唯一等）
    #[error("{message}")]
    Failed { message: String },
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }
}

/// 意图守卫达到连续续跑上限，或会话达到迭代上限
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("guard stopped the session: {diagnostic}")]
pub struct GuardExceeded {
    pub diagnostic: String,
}

/// 主循环错误：终止会话并向调用方报告分类后的失败
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Task input error: {0}")]
    Input(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
