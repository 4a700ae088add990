//! 规范响应 → 文本 + 工具调用
//!
//! 缺失或重复的调用 id 由本地生成；工具名为空、或既无文本也无调用的响应视为畸形。

use std::collections::HashSet;

use serde_json::{json, Value};

use crate::core::ProviderError;
use crate::llm::CanonicalResponse;
use crate::memory::ToolCall;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ParsedOutput {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

pub fn parse_output(backend: &str, response: &CanonicalResponse) -> Result<ParsedOutput, ProviderError> {
    let text = response.text();
    let mut seen = HashSet::new();
    let mut tool_calls = Vec::new();
    for mut call in response.tool_calls() {
        if call.name.trim().is_empty() {
            return Err(ProviderError::malformed(backend, "tool call with empty name"));
        }
        if call.id.is_empty() || seen.contains(&call.id) {
            call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
        }
        if call.arguments.is_null() {
            call.arguments = json!({});
        }
        if !matches!(call.arguments, Value::Object(_)) {
            return Err(ProviderError::malformed(
                backend,
                format!("arguments for '{}' are not an object", call.name),
            ));
        }
        seen.insert(call.id.clone());
        tool_calls.push(call);
    }
    if text.trim().is_empty() && tool_calls.is_empty() {
        return Err(ProviderError::malformed(backend, "empty response"));
    }
    Ok(ParsedOutput { text, tool_calls })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    #[test]
    fn test_text_only() {
        let out = parse_output("t", &CanonicalResponse::text_only("done")).unwrap();
        assert_eq!(out.text, "done");
        assert!(!out.has_tool_calls());
    }

    #[test]
    fn test_ids_filled_and_deduplicated() {
        let resp = CanonicalResponse::with_tool_calls(
            "",
            vec![
                call("", "bash", json!({"command": "ls"})),
                call("a", "bash", Value::Null),
                call("a", "bash", json!({})),
            ],
        );
        let out = parse_output("t", &resp).unwrap();
        assert!(out.tool_calls[0].id.starts_with("call_"));
        assert_eq!(out.tool_calls[1].id, "a");
        assert_eq!(out.tool_calls[1].arguments, json!({}));
        assert_ne!(out.tool_calls[2].id, "a");
    }

    #[test]
    fn test_malformed_cases() {
        let empty_name = CanonicalResponse::with_tool_calls("", vec![call("x", " ", json!({}))]);
        assert!(parse_output("t", &empty_name).is_err());
        let bad_args = CanonicalResponse::with_tool_calls("", vec![call("x", "bash", json!("ls"))]);
        assert!(parse_output("t", &bad_args).is_err());
        assert!(parse_output("t", &CanonicalResponse::text_only("  ")).is_err());
    }
}
