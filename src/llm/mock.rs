//! 脚本化适配器（用于测试，无需网络）
//!
//! 按顺序返回预先给定的响应或错误，并记录收到的每个请求；脚本用完后返回 MalformedResponse。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::ProviderError;
use crate::llm::{CanonicalResponse, ModelAdapter, ModelRequest};

pub type Scripted = Result<CanonicalResponse, ProviderError>;

#[derive(Debug, Default)]
pub struct ScriptedAdapter {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedAdapter {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 已收到的调用次数
    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelAdapter for ScriptedAdapter {
    fn backend(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<CanonicalResponse, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| Err(ProviderError::malformed("scripted", "script exhausted")))
    }
}
