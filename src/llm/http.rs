//! 适配器共用的 HTTP 基础
//!
//! 发送 JSON、按状态码与 reqwest 错误类型归类 ProviderError、逐条读取 SSE 数据。

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use serde_json::Value;

use crate::core::ProviderError;

/// 请求的鉴权方式
#[derive(Debug, Clone, Copy)]
pub enum Auth<'a> {
    Bearer(&'a str),
    Header(&'static str, &'a str),
}

#[derive(Clone)]
pub struct HttpBackend {
    backend: &'static str,
    endpoint: String,
    api_key: Option<String>,
    http: Client,
}

impl HttpBackend {
    pub fn new(
        backend: &'static str,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Config(format!("http client for {backend}: {e}")))?;
        Ok(Self {
            backend,
            endpoint: endpoint.into(),
            api_key,
            http,
        })
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn build_url(&self, path: &str) -> String {
        let base = self.endpoint.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    /// 凭据缺失视为鉴权失败（致命，不重试）
    pub fn require_api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::Auth {
                backend: self.backend.to_string(),
                message: "missing credentials".to_string(),
            })
    }

    /// POST JSON；非 2xx 按状态码归类
    pub async fn post(
        &self,
        url: &str,
        auth: Auth<'_>,
        body: &Value,
    ) -> Result<Response, ProviderError> {
        let request = self.http.post(url).json(body);
        let request = match auth {
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Header(name, value) => request.header(name, value),
        };
        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest(self.backend, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after_ms = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(backend = self.backend, status = status.as_u16(), "provider error response");
        Err(ProviderError::from_status(
            self.backend,
            status.as_u16(),
            &body,
            retry_after_ms,
        ))
    }

    /// 读取整包 JSON 响应
    pub async fn read_json(&self, response: Response) -> Result<Value, ProviderError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest(self.backend, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::malformed(self.backend, format!("invalid JSON body: {e}")))
    }

    /// 逐条处理 SSE `data:` 负载（JSON），遇到 `[DONE]` 结束
    pub async fn for_each_sse<F>(&self, response: Response, mut on_data: F) -> Result<(), ProviderError>
    where
        F: FnMut(Value) -> Result<(), ProviderError>,
    {
        let mut stream = Box::pin(response.bytes_stream().eventsource());
        while let Some(event) = stream.next().await {
            let event = event
                .map_err(|e| ProviderError::transient(self.backend, format!("stream error: {e}")))?;
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }
            let value: Value = serde_json::from_str(data).map_err(|e| {
                ProviderError::malformed(self.backend, format!("invalid stream chunk: {e}"))
            })?;
            on_data(value)?;
        }
        Ok(())
    }
}

/// 连接失败 / 超时 → 瞬时错误；响应体解码失败 → 响应畸形
fn classify_reqwest(backend: &str, e: reqwest::Error) -> ProviderError {
    if e.is_decode() {
        ProviderError::malformed(backend, e.to_string())
    } else if e.is_builder() {
        ProviderError::Config(format!("{backend}: {e}"))
    } else {
        ProviderError::transient(backend, e.to_string())
    }
}
