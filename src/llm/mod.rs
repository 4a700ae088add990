//! LLM 层：规范请求/响应、模型适配器（Bedrock / OpenAI / Google / 脚本化）与路由

pub mod bedrock;
pub mod google;
pub mod http;
pub mod mock;
pub mod openai;
pub mod retry;
pub mod router;
pub mod traits;
pub mod types;

pub use mock::ScriptedAdapter;
pub use retry::{RetryPolicy, RetryingAdapter};
pub use router::{route, Backend, ProviderRouter, ProviderSettings};
pub use traits::ModelAdapter;
pub use types::{
    close_dangling_calls, CanonicalResponse, ModelRequest, Segment, ToolDefinition, Usage,
    MISSING_RESULT,
};
