//! Bedrock 风格适配器（Anthropic Messages 格式）
//!
//! POST `{endpoint}/model/{model}/invoke`，Bearer 凭据取自环境变量（默认 AWS_BEARER_TOKEN_BEDROCK）。
//! 只支持整包响应：请求流式时记录降级日志后按整包调用。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::ProviderError;
use crate::llm::http::{Auth, HttpBackend};
use crate::llm::{
    close_dangling_calls, CanonicalResponse, ModelAdapter, ModelRequest, Segment, Usage,
};
use crate::memory::{Message, Role, ToolCall};

const BACKEND: &str = "bedrock";
const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BedrockSettings {
    /// 显式端点；为空时按区域拼接
    pub endpoint: Option<String>,
    pub region_env: String,
    pub default_region: String,
    pub token_env: String,
    /// 模型别名 → Bedrock 模型 id
    pub model_ids: HashMap<String, String>,
    pub max_tokens: u32,
}

impl Default for BedrockSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            region_env: "AWS_REGION".to_string(),
            default_region: "us-east-1".to_string(),
            token_env: "AWS_BEARER_TOKEN_BEDROCK".to_string(),
            model_ids: HashMap::new(),
            max_tokens: 8192,
        }
    }
}

pub struct BedrockAdapter {
    http: HttpBackend,
    model_ids: HashMap<String, String>,
    max_tokens: u32,
}

impl BedrockAdapter {
    pub fn new(http: HttpBackend, settings: &BedrockSettings) -> Self {
        Self {
            http,
            model_ids: settings.model_ids.clone(),
            max_tokens: settings.max_tokens,
        }
    }

    /// 从环境变量读取区域与凭据
    pub fn from_settings(settings: &BedrockSettings, timeout: Duration) -> Result<Self, ProviderError> {
        let endpoint = match &settings.endpoint {
            Some(e) if !e.trim().is_empty() => e.clone(),
            _ => {
                let region = std::env::var(&settings.region_env)
                    .ok()
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| settings.default_region.clone());
                format!("https://bedrock-runtime.{region}.amazonaws.com")
            }
        };
        let token = std::env::var(&settings.token_env).ok();
        let http = HttpBackend::new(BACKEND, endpoint, token, timeout)?;
        Ok(Self::new(http, settings))
    }

    fn model_id<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_ids.get(model).map(String::as_str).unwrap_or(model)
    }

    fn build_body(&self, request: &ModelRequest) -> Value {
        let mut body = json!({
            "anthropic_version": ANTHROPIC_VERSION,
            "max_tokens": self.max_tokens,
            "messages": to_wire_messages(&close_dangling_calls(&request.messages)),
        });
        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
        }
        body
    }
}

/// 规范消息 → Anthropic content blocks；同角色的相邻消息合并
fn to_wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<(String, Vec<Value>)> = Vec::new();
    for msg in messages {
        let (role, blocks) = match msg.role {
            Role::User | Role::System => ("user", vec![text_block(&msg.content)]),
            Role::Tool => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content,
                    "is_error": msg.is_error,
                })],
            ),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(text_block(&msg.content));
                }
                for call in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(text_block("(empty)"));
                }
                ("assistant", blocks)
            }
        };
        match out.last_mut() {
            Some((last, existing)) if last == role => existing.extend(blocks),
            _ => out.push((role.to_string(), blocks)),
        }
    }
    out.into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect()
}

fn text_block(text: &str) -> Value {
    let text = if text.is_empty() { "(empty)" } else { text };
    json!({ "type": "text", "text": text })
}

fn parse_response(raw: Value) -> Result<CanonicalResponse, ProviderError> {
    let blocks = raw
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::malformed(BACKEND, "response has no content array"))?;
    let mut segments = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
                segments.push(Segment::Text {
                    text: text.to_string(),
                });
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProviderError::malformed(BACKEND, "tool_use block without name"))?;
                segments.push(Segment::ToolCall(ToolCall {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: name.to_string(),
                    arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                }));
            }
            // thinking 等块不进入规范响应
            _ => {}
        }
    }
    let usage = raw.get("usage").map(|u| Usage {
        input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
    });
    Ok(CanonicalResponse {
        segments,
        raw,
        usage,
    })
}

#[async_trait]
impl ModelAdapter for BedrockAdapter {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn complete(&self, request: &ModelRequest) -> Result<CanonicalResponse, ProviderError> {
        if request.stream {
            tracing::debug!(backend = BACKEND, "streaming not supported, using whole-response call");
        }
        let token = self.http.require_api_key()?;
        let url = self
            .http
            .build_url(&format!("model/{}/invoke", self.model_id(&request.model)));
        let body = self.build_body(request);
        let response = self.http.post(&url, Auth::Bearer(token), &body).await?;
        let raw = self.http.read_json(response).await?;
        parse_response(raw)
    }
}
