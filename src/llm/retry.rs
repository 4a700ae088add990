//! 适配器层的有限次退避重试
//!
//! 只重试 TransientNetwork；鉴权、配额、响应畸形等错误原样返回给主循环。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::ProviderError;
use crate::llm::{CanonicalResponse, ModelAdapter, ModelRequest};

/// 指数退避参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次重试（从 1 开始）前的等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(u64::from(self.factor).saturating_pow(exp));
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

pub struct RetryingAdapter {
    inner: Arc<dyn ModelAdapter>,
    policy: RetryPolicy,
}

impl RetryingAdapter {
    pub fn new(inner: Arc<dyn ModelAdapter>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ModelAdapter for RetryingAdapter {
    fn backend(&self) -> &str {
        self.inner.backend()
    }

    async fn complete(&self, request: &ModelRequest) -> Result<CanonicalResponse, ProviderError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.complete(request).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = self.policy.delay(attempt);
                    tracing::warn!(
                        backend = self.inner.backend(),
                        attempt,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedAdapter;

    fn request() -> ModelRequest {
        ModelRequest {
            model: "gpt-test".into(),
            system: String::new(),
            messages: vec![crate::memory::Message::user("hi")],
            tools: vec![],
            stream: false,
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 4,
            factor: 2,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(1), Duration::from_millis(500));
        assert_eq!(p.delay(2), Duration::from_millis(1000));
        assert_eq!(p.delay(10), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn test_transient_retried_until_success() {
        let inner = Arc::new(ScriptedAdapter::new(vec![
            Err(ProviderError::transient("mock", "reset")),
            Ok(CanonicalResponse::text_only("ok")),
        ]));
        let adapter = RetryingAdapter::new(inner.clone(), fast());
        let resp = adapter.complete(&request()).await.unwrap();
        assert_eq!(resp.text(), "ok");
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let inner = Arc::new(ScriptedAdapter::new(vec![
            Err(ProviderError::transient("mock", "1")),
            Err(ProviderError::transient("mock", "2")),
            Err(ProviderError::transient("mock", "3")),
            Ok(CanonicalResponse::text_only("too late")),
        ]));
        let adapter = RetryingAdapter::new(inner.clone(), fast());
        assert!(adapter.complete(&request()).await.unwrap_err().is_retryable());
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_auth_and_quota_not_retried() {
        for err in [
            ProviderError::Auth {
                backend: "mock".into(),
                message: "bad".into(),
            },
            ProviderError::QuotaExceeded {
                backend: "mock".into(),
                message: "limit".into(),
                retry_after_ms: None,
            },
        ] {
            let inner = Arc::new(ScriptedAdapter::new(vec![
                Err(err.clone()),
                Ok(CanonicalResponse::text_only("unused")),
            ]));
            let adapter = RetryingAdapter::new(inner.clone(), fast());
            assert_eq!(adapter.complete(&request()).await.unwrap_err(), err);
            assert_eq!(inner.calls(), 1);
        }
    }
}
