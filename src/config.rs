//! 应用配置：从 config/default.toml、--config 文件与环境变量加载
//!
//! 加载顺序：先读默认 TOML，再叠加显式指定的文件，最后用环境变量 `BEE__*` 覆盖
//! （双下划线表示嵌套，如 `BEE__LLM__MODEL=gpt-4o`、`BEE__GUARD__SOLO_MODE=on`）。
//! 每个字段都有默认值，空配置即可运行。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::AgentError;
use crate::llm::{ProviderSettings, RetryPolicy};
use crate::react::{SoloMode, DEFAULT_SYSTEM_PROMPT};
use crate::tools::{CommandPolicy, FileAccessPolicy, OutputLimits};

/// 覆盖 `llm.model` 的环境变量，会话开始时读取一次
pub const CURRENT_MODEL_ENV: &str = "CURRENT_MODEL";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub guard: GuardSection,
}

/// [app] 段：会话存储根目录与系统提示
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 会话与轨迹的存储根目录
    pub storage_root: PathBuf,
    pub system_prompt: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(".bee-code/sessions"),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// [llm] 段：模型、流式、超时、重试与各后端设置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub stream: bool,
    /// 单次模型请求超时（秒）
    pub request_timeout: u64,
    pub retry: RetryPolicy,
    pub providers: ProviderSettings,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4".to_string(),
            stream: false,
            request_timeout: 300,
            retry: RetryPolicy::default(),
            providers: ProviderSettings::default(),
        }
    }
}

/// [tools] 段：工具超时、view 行数上限、输出截断、Shell 策略与文件访问策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub timeout: u64,
    pub view_max_lines: usize,
    pub output: OutputLimits,
    pub shell: CommandPolicy,
    pub file: FileAccessPolicy,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            timeout: 120,
            view_max_lines: 300,
            output: OutputLimits::default(),
            shell: CommandPolicy::default(),
            file: FileAccessPolicy::default(),
        }
    }
}

/// [guard] 段：续跑策略与上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardSection {
    pub solo_mode: SoloMode,
    /// 连续纯文本轮次的自动续跑上限
    pub max_consecutive_nudges: usize,
    /// 单次运行的模型调用上限
    pub max_iterations: usize,
}

impl Default for GuardSection {
    fn default() -> Self {
        Self {
            solo_mode: SoloMode::Auto,
            max_consecutive_nudges: 1,
            max_iterations: 1000,
        }
    }
}

impl AppConfig {
    /// 实际使用的模型：CURRENT_MODEL 优先于配置
    pub fn effective_model(&self) -> String {
        std::env::var(CURRENT_MODEL_ENV)
            .ok()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.llm.model.clone())
    }
}

/// 加载配置
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在，可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, AgentError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(AgentError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}
