//! 模型适配器抽象
//!
//! 每个后端（Bedrock 风格 / OpenAI 风格 / Google 风格）实现 ModelAdapter：序列化规范请求、发起调用（流式或整包）、
//! 把响应解析回规范结构，并自行把失败归类为 ProviderError。

use async_trait::async_trait;

use crate::core::ProviderError;
use crate::llm::{CanonicalResponse, ModelRequest};

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// 后端名（日志、错误与轨迹中使用）
    fn backend(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<CanonicalResponse, ProviderError>;
}
