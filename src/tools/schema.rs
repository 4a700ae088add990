//! 工具参数 JSON Schema 生成（schemars）
//!
//! 各工具以 `#[derive(Deserialize, JsonSchema)]` 的参数结构体为唯一来源，既用于解析模型给出的参数，
//! 也用于生成发给后端的 `parameters`。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::ToolError;

/// 生成参数 schema；去掉后端不需要的 `$schema` / `title`
pub fn args_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({"type": "object", "properties": {}})
    });
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// 把模型给出的参数解析为结构体；失败时返回 InvalidArguments
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::invalid_args(e.to_string()))
}
