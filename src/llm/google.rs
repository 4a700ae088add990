//! Google 风格适配器（generateContent / streamGenerateContent）
//!
//! 工具以 functionDeclarations 发送；参数 schema 需先清洗（内联 $ref、去掉不支持的关键字、
//! `["string","null"]` 这类类型数组改为 nullable）。后端不给调用 id 时由适配器生成。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::core::ProviderError;
use crate::llm::http::{Auth, HttpBackend};
use crate::llm::{
    close_dangling_calls, CanonicalResponse, ModelAdapter, ModelRequest, Segment, Usage,
};
use crate::memory::{Message, Role, ToolCall};

const BACKEND: &str = "google";
const MAX_SCHEMA_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GoogleSettings {
    pub endpoint: String,
    pub api_key_env: String,
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
        }
    }
}

pub struct GoogleAdapter {
    http: HttpBackend,
}

impl GoogleAdapter {
    pub fn new(http: HttpBackend) -> Self {
        Self { http }
    }

    pub fn from_settings(settings: &GoogleSettings, timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&settings.api_key_env).ok();
        Ok(Self::new(HttpBackend::new(
            BACKEND,
            settings.endpoint.clone(),
            api_key,
            timeout,
        )?))
    }

    fn build_body(request: &ModelRequest) -> Value {
        let mut body = json!({
            "contents": to_contents(&close_dangling_calls(&request.messages)),
        });
        if !request.system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": request.system }] });
        }
        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": sanitize_schema(&t.parameters),
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        body
    }
}

/// 规范消息 → contents；functionResponse 需要函数名，按 id 回查此前 assistant 的调用
fn to_contents(messages: &[Message]) -> Vec<Value> {
    let mut names: HashMap<&str, &str> = HashMap::new();
    let mut out: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for msg in messages {
        let (role, parts) = match msg.role {
            Role::User | Role::System => ("user", vec![json!({ "text": msg.content })]),
            Role::Tool => {
                let id = msg.tool_call_id.as_deref().unwrap_or_default();
                let name = names.get(id).copied().unwrap_or(id);
                let key = if msg.is_error { "error" } else { "content" };
                let mut response = Map::new();
                response.insert(key.to_string(), json!(msg.content));
                (
                    "user",
                    vec![json!({
                        "functionResponse": { "name": name, "response": response }
                    })],
                )
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(json!({ "text": msg.content }));
                }
                for call in &msg.tool_calls {
                    names.insert(call.id.as_str(), call.name.as_str());
                    parts.push(json!({
                        "functionCall": { "name": call.name, "args": call.arguments }
                    }));
                }
                if parts.is_empty() {
                    parts.push(json!({ "text": "(empty)" }));
                }
                ("model", parts)
            }
        };
        match out.last_mut() {
            Some((last, existing)) if *last == role => existing.extend(parts),
            _ => out.push((role, parts)),
        }
    }
    out.into_iter()
        .map(|(role, parts)| json!({ "role": role, "parts": parts }))
        .collect()
}

/// 清洗为后端接受的 OpenAPI 子集
pub fn sanitize_schema(schema: &Value) -> Value {
    let defs = schema
        .get("definitions")
        .or_else(|| schema.get("$defs"))
        .cloned()
        .unwrap_or(Value::Null);
    sanitize_node(schema, &defs, 0)
}

fn sanitize_node(node: &Value, defs: &Value, depth: usize) -> Value {
    let Some(obj) = node.as_object() else {
        return node.clone();
    };
    if depth > MAX_SCHEMA_DEPTH {
        return json!({ "type": "object" });
    }

    if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
        let name = reference.rsplit('/').next().unwrap_or_default();
        let mut resolved = defs
            .get(name)
            .map(|d| sanitize_node(d, defs, depth + 1))
            .unwrap_or_else(|| json!({ "type": "object" }));
        copy_description(obj, &mut resolved);
        return resolved;
    }

    for key in ["allOf", "anyOf", "oneOf"] {
        let Some(variants) = obj.get(key).and_then(Value::as_array) else {
            continue;
        };
        let non_null: Vec<&Value> = variants
            .iter()
            .filter(|v| v.get("type").and_then(Value::as_str) != Some("null"))
            .collect();
        let nullable = non_null.len() < variants.len();
        let mut merged = match non_null.as_slice() {
            [] => json!({ "type": "object" }),
            [single] => sanitize_node(single, defs, depth + 1),
            many => merge_variants(many, defs, depth),
        };
        if let Some(m) = merged.as_object_mut() {
            if nullable {
                m.insert("nullable".to_string(), Value::Bool(true));
            }
        }
        copy_description(obj, &mut merged);
        return merged;
    }

    let mut out = Map::new();
    for (key, value) in obj {
        match key.as_str() {
            "type" => match value {
                Value::Array(types) => {
                    let first = types
                        .iter()
                        .filter_map(Value::as_str)
                        .find(|t| *t != "null")
                        .unwrap_or("string");
                    out.insert("type".to_string(), json!(first));
                    if types.iter().any(|t| t == "null") {
                        out.insert("nullable".to_string(), Value::Bool(true));
                    }
                }
                other => {
                    out.insert("type".to_string(), other.clone());
                }
            },
            "properties" => {
                let props: Map<String, Value> = value
                    .as_object()
                    .into_iter()
                    .flatten()
                    .map(|(k, v)| (k.clone(), sanitize_node(v, defs, depth + 1)))
                    .collect();
                out.insert(key.clone(), Value::Object(props));
            }
            "items" => {
                out.insert(key.clone(), sanitize_node(value, defs, depth + 1));
            }
            "description" | "required" | "enum" | "nullable" | "minimum" | "maximum" => {
                out.insert(key.clone(), value.clone());
            }
            _ => {}
        }
    }
    Value::Object(out)
}

/// 多个字符串枚举变体合并为一个枚举；其它情况取第一个变体
fn merge_variants(variants: &[&Value], defs: &Value, depth: usize) -> Value {
    let sanitized: Vec<Value> = variants
        .iter()
        .map(|v| sanitize_node(v, defs, depth + 1))
        .collect();
    let all_enums = sanitized.iter().all(|v| v.get("enum").is_some());
    if all_enums {
        let values: Vec<Value> = sanitized
            .iter()
            .filter_map(|v| v.get("enum").and_then(Value::as_array))
            .flatten()
            .cloned()
            .collect();
        return json!({ "type": "string", "enum": values });
    }
    sanitized
        .into_iter()
        .next()
        .unwrap_or_else(|| json!({ "type": "object" }))
}

fn copy_description(from: &Map<String, Value>, to: &mut Value) {
    if let (Some(desc), Some(m)) = (from.get("description"), to.as_object_mut()) {
        m.insert("description".to_string(), desc.clone());
    }
}

fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

fn parse_usage(raw: &Value) -> Option<Usage> {
    let u = raw.get("usageMetadata")?;
    Some(Usage {
        input_tokens: u.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: u
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

/// 一个响应块中的 parts 追加到 segments；相邻文本合并
fn push_parts(raw: &Value, segments: &mut Vec<Segment>) -> Result<(), ProviderError> {
    let Some(candidate) = raw.pointer("/candidates/0") else {
        if let Some(reason) = raw.pointer("/promptFeedback/blockReason").and_then(Value::as_str) {
            return Err(ProviderError::malformed(
                BACKEND,
                format!("prompt blocked: {reason}"),
            ));
        }
        return Ok(());
    };
    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            // thought 部分不进入规范响应
            if part.get("thought").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            match segments.last_mut() {
                Some(Segment::Text { text: existing }) => existing.push_str(text),
                _ => segments.push(Segment::Text {
                    text: text.to_string(),
                }),
            }
        } else if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ProviderError::malformed(BACKEND, "functionCall without name"))?;
            segments.push(Segment::ToolCall(ToolCall {
                id: call
                    .get("id")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(new_call_id),
                name: name.to_string(),
                arguments: call.get("args").cloned().unwrap_or_else(|| json!({})),
            }));
        }
    }
    Ok(())
}

fn parse_response(raw: Value) -> Result<CanonicalResponse, ProviderError> {
    if raw.pointer("/candidates/0").is_none() && raw.get("promptFeedback").is_none() {
        return Err(ProviderError::malformed(BACKEND, "response has no candidates"));
    }
    let mut segments = Vec::new();
    push_parts(&raw, &mut segments)?;
    let usage = parse_usage(&raw);
    Ok(CanonicalResponse {
        segments,
        raw,
        usage,
    })
}

#[async_trait]
impl ModelAdapter for GoogleAdapter {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn complete(&self, request: &ModelRequest) -> Result<CanonicalResponse, ProviderError> {
        let key = self.http.require_api_key()?;
        let body = Self::build_body(request);
        let auth = Auth::Header("x-goog-api-key", key);

        if !request.stream {
            let url = self
                .http
                .build_url(&format!("models/{}:generateContent", request.model));
            let response = self.http.post(&url, auth, &body).await?;
            let raw = self.http.read_json(response).await?;
            return parse_response(raw);
        }

        let url = self.http.build_url(&format!(
            "models/{}:streamGenerateContent?alt=sse",
            request.model
        ));
        let response = self.http.post(&url, auth, &body).await?;
        let mut segments = Vec::new();
        let mut usage = None;
        let mut finish_reason = None;
        let mut chunks = 0usize;
        self.http
            .for_each_sse(response, |chunk| {
                chunks += 1;
                if let Some(u) = parse_usage(&chunk) {
                    usage = Some(u);
                }
                if let Some(r) = chunk.pointer("/candidates/0/finishReason") {
                    finish_reason = Some(r.clone());
                }
                push_parts(&chunk, &mut segments)
            })
            .await?;
        let raw = json!({
            "streamed": true,
            "chunks": chunks,
            "segments": segments,
            "finish_reason": finish_reason,
        });
        Ok(CanonicalResponse {
            segments,
            raw,
            usage,
        })
    }
}
