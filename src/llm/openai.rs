//! OpenAI 风格适配器（Chat Completions）
//!
//! 支持整包与 SSE 流式两种调用；流式时按 index 拼装 tool_calls 增量，最终产出同样的规范响应。

use std::collections::BTreeMap;
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

const BACKEND: &str = "openai";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub base_url: String,
    /// 设置时覆盖 base_url
    pub base_url_env: String,
    pub api_key_env: String,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            base_url_env: "OPENAI_BASE_URL".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

pub struct OpenAiAdapter {
    http: HttpBackend,
}

impl OpenAiAdapter {
    pub fn new(http: HttpBackend) -> Self {
        Self { http }
    }

    pub fn from_settings(settings: &OpenAiSettings, timeout: Duration) -> Result<Self, ProviderError> {
        let base_url = std::env::var(&settings.base_url_env)
            .ok()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| settings.base_url.clone());
        let api_key = std::env::var(&settings.api_key_env).ok();
        Ok(Self::new(HttpBackend::new(BACKEND, base_url, api_key, timeout)?))
    }

    fn build_body(request: &ModelRequest) -> Value {
        let mut messages = Vec::new();
        if !request.system.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system }));
        }
        messages.extend(
            close_dangling_calls(&request.messages)
                .iter()
                .map(to_wire_message),
        );
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });
        if request.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        body
    }
}

fn to_wire_message(msg: &Message) -> Value {
    match msg.role {
        Role::User => json!({ "role": "user", "content": msg.content }),
        Role::System => json!({ "role": "system", "content": msg.content }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
        Role::Assistant => {
            let mut wire = json!({
                "role": "assistant",
                "content": if msg.content.is_empty() { Value::Null } else { json!(msg.content) },
            });
            if !msg.tool_calls.is_empty() {
                wire["tool_calls"] = msg
                    .tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments.to_string() },
                        })
                    })
                    .collect();
            }
            wire
        }
    }
}

/// arguments 是 JSON 字符串；空串视为 `{}`
fn parse_arguments(raw: &str) -> Result<Value, ProviderError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| {
        ProviderError::malformed(BACKEND, format!("tool call arguments are not valid JSON: {e}"))
    })
}

fn parse_usage(raw: &Value) -> Option<Usage> {
    let u = raw.get("usage").filter(|u| u.is_object())?;
    Some(Usage {
        input_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
    })
}

fn parse_response(raw: Value) -> Result<CanonicalResponse, ProviderError> {
    let message = raw
        .pointer("/choices/0/message")
        .ok_or_else(|| ProviderError::malformed(BACKEND, "response has no choices[0].message"))?;
    let mut segments = Vec::new();
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            segments.push(Segment::Text {
                text: text.to_string(),
            });
        }
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .ok_or_else(|| ProviderError::malformed(BACKEND, "tool call without function name"))?;
            let args = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .unwrap_or_default();
            segments.push(Segment::ToolCall(ToolCall {
                id: call
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: name.to_string(),
                arguments: parse_arguments(args)?,
            }));
        }
    }
    let usage = parse_usage(&raw);
    Ok(CanonicalResponse {
        segments,
        raw,
        usage,
    })
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// 流式增量的拼装状态
#[derive(Default)]
struct StreamAssembler {
    text: String,
    calls: BTreeMap<u64, PartialCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    chunks: usize,
}

impl StreamAssembler {
    fn push(&mut self, chunk: Value) {
        self.chunks += 1;
        if let Some(usage) = parse_usage(&chunk) {
            self.usage = Some(usage);
        }
        let Some(choice) = chunk.pointer("/choices/0") else {
            return;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }
        let Some(delta) = choice.get("delta") else {
            return;
        };
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            self.text.push_str(text);
        }
        for tc in delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0);
            let entry = self.calls.entry(index).or_default();
            if let Some(id) = tc.get("id").and_then(Value::as_str) {
                entry.id = id.to_string();
            }
            if let Some(name) = tc.pointer("/function/name").and_then(Value::as_str) {
                entry.name.push_str(name);
            }
            if let Some(args) = tc.pointer("/function/arguments").and_then(Value::as_str) {
                entry.arguments.push_str(args);
            }
        }
    }

    fn finish(self) -> Result<CanonicalResponse, ProviderError> {
        let mut segments = Vec::new();
        if !self.text.is_empty() {
            segments.push(Segment::Text {
                text: self.text.clone(),
            });
        }
        let mut raw_calls = Vec::new();
        for call in self.calls.into_values() {
            if call.name.is_empty() {
                return Err(ProviderError::malformed(BACKEND, "streamed tool call without name"));
            }
            raw_calls.push(json!({
                "id": call.id,
                "name": call.name,
                "arguments": call.arguments,
            }));
            segments.push(Segment::ToolCall(ToolCall {
                arguments: parse_arguments(&call.arguments)?,
                id: call.id,
                name: call.name,
            }));
        }
        let raw = json!({
            "streamed": true,
            "chunks": self.chunks,
            "text": self.text,
            "tool_calls": raw_calls,
            "finish_reason": self.finish_reason,
        });
        Ok(CanonicalResponse {
            segments,
            raw,
            usage: self.usage,
        })
    }
}

#[async_trait]
impl ModelAdapter for OpenAiAdapter {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn complete(&self, request: &ModelRequest) -> Result<CanonicalResponse, ProviderError> {
        let key = self.http.require_api_key()?;
        let url = self.http.build_url("chat/completions");
        let body = Self::build_body(request);
        let response = self.http.post(&url, Auth::Bearer(key), &body).await?;
        if !request.stream {
            let raw = self.http.read_json(response).await?;
            return parse_response(raw);
        }
        let mut assembler = StreamAssembler::default();
        self.http
            .for_each_sse(response, |chunk| {
                assembler.push(chunk);
                Ok(())
            })
            .await?;
        assembler.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> OpenAiAdapter {
        OpenAiAdapter::new(
            HttpBackend::new(BACKEND, server.uri(), Some("sk-test".into()), Duration::from_secs(5))
                .unwrap(),
        )
    }

    fn request(stream: bool) -> ModelRequest {
        ModelRequest {
            model: "gpt-5.2".into(),
            system: "sys".into(),
            messages: vec![Message::user("hi")],
            tools: vec![],
            stream,
        }
    }

    #[test]
    fn test_assistant_tool_calls_serialized_as_strings() {
        let msg = Message::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "bash".into(),
                arguments: json!({"command": "ls"}),
            }],
        );
        let wire = to_wire_message(&msg);
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], "{\"command\":\"ls\"}");
    }

    #[tokio::test]
    async fn test_whole_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-5.2", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "bash", "arguments": "{\"command\":\"ls\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 4}
            })))
            .mount(&server)
            .await;
        let resp = adapter(&server).complete(&request(false)).await.unwrap();
        assert_eq!(resp.text(), "");
        assert_eq!(resp.tool_calls()[0].arguments, json!({"command": "ls"}));
        assert_eq!(resp.usage, Some(Usage { input_tokens: 3, output_tokens: 4 }));
    }

    #[tokio::test]
    async fn test_streamed_deltas_are_assembled() {
        let server = MockServer::start().await;
        let chunks = [
            json!({"choices": [{"delta": {"content": "Let me "}}]}),
            json!({"choices": [{"delta": {"content": "look."}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_9", "function": {"name": "bash", "arguments": "{\"comm"}}]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "and\":\"pwd\"}"}}]}, "finish_reason": "tool_calls"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 1, "completion_tokens": 2}}),
        ];
        let mut body: String = chunks.iter().map(|c| format!("data: {c}\n\n")).collect();
        body.push_str("data: [DONE]\n\n");
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let resp = adapter(&server).complete(&request(true)).await.unwrap();
        assert_eq!(resp.text(), "Let me look.");
        let calls = resp.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].arguments, json!({"command": "pwd"}));
        assert_eq!(resp.usage.unwrap().output_tokens, 2);
        assert_eq!(resp.raw["finish_reason"], "tool_calls");
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"tool_calls": [{
                    "id": "c", "function": {"name": "bash", "arguments": "{not json"}
                }]}}]
            })))
            .mount(&server)
            .await;
        let err = adapter(&server).complete(&request(false)).await.unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;
        let err = adapter(&server).complete(&request(false)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth { .. }));
    }
}
