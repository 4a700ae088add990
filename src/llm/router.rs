//! Provider Router：模型 id → 后端
//!
//! 静态前缀表，按声明顺序匹配（忽略大小写），第一个命中者生效；未命中在任何网络调用之前以配置错误失败。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::core::ProviderError;
use crate::llm::bedrock::{BedrockAdapter, BedrockSettings};
use crate::llm::google::{GoogleAdapter, GoogleSettings};
use crate::llm::openai::{OpenAiAdapter, OpenAiSettings};
use crate::llm::retry::{RetryPolicy, RetryingAdapter};
use crate::llm::ModelAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Bedrock,
    OpenAi,
    Google,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bedrock => "bedrock",
            Self::OpenAi => "openai",
            Self::Google => "google",
        };
        f.write_str(name)
    }
}

/// 前缀规则
enum Rule {
    Prefix(&'static str),
    /// `o` 后紧跟数字（o1 / o3 / o4-mini ...）
    ODigit,
}

impl Rule {
    fn matches(&self, model: &str) -> bool {
        match self {
            Self::Prefix(p) => model.starts_with(p),
            Self::ODigit => {
                let mut chars = model.chars();
                chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit())
            }
        }
    }
}

const ROUTES: &[(Rule, Backend)] = &[
    (Rule::Prefix("claude"), Backend::Bedrock),
    (Rule::Prefix("gpt"), Backend::OpenAi),
    (Rule::Prefix("codex"), Backend::OpenAi),
    (Rule::ODigit, Backend::OpenAi),
    (Rule::Prefix("gemini"), Backend::Google),
];

/// 按模型 id 选择后端
pub fn route(model: &str) -> Result<Backend, ProviderError> {
    let lowered = model.trim().to_ascii_lowercase();
    ROUTES
        .iter()
        .find(|(rule, _)| rule.matches(&lowered))
        .map(|(_, backend)| *backend)
        .ok_or_else(|| {
            ProviderError::Config(format!(
                "no provider route for model '{model}' (expected a claude*, gpt*, o<digit>*, codex* or gemini* id)"
            ))
        })
}

/// 各后端的连接设置
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub bedrock: BedrockSettings,
    pub openai: OpenAiSettings,
    pub google: GoogleSettings,
}

pub struct ProviderRouter {
    settings: ProviderSettings,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ProviderRouter {
    pub fn new(settings: ProviderSettings, retry: RetryPolicy, timeout_secs: u64) -> Self {
        Self {
            settings,
            retry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 为模型构造带重试的适配器
    pub fn adapter_for(&self, model: &str) -> Result<Arc<dyn ModelAdapter>, ProviderError> {
        let backend = route(model)?;
        let inner: Arc<dyn ModelAdapter> = match backend {
            Backend::Bedrock => Arc::new(BedrockAdapter::from_settings(
                &self.settings.bedrock,
                self.timeout,
            )?),
            Backend::OpenAi => Arc::new(OpenAiAdapter::from_settings(
                &self.settings.openai,
                self.timeout,
            )?),
            Backend::Google => Arc::new(GoogleAdapter::from_settings(
                &self.settings.google,
                self.timeout,
            )?),
        };
        tracing::info!(model, backend = %backend, "provider routed");
        Ok(Arc::new(RetryingAdapter::new(inner, self.retry)))
    }
}
