//! `update_task_progress` 工具（solo 模式）
//!
//! 工具本身只校验并确认进度；Intent Guard 从本轮 TurnRecord 里读取最近一次成功的调用参数，
//! 据此判断任务是否完成（100）或受阻（status = error）。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::schema::{args_schema, parse_args};
use crate::tools::Tool;

pub const UPDATE_TASK_PROGRESS: &str = "update_task_progress";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    #[default]
    Info,
    Success,
    Warning,
    // 受阻或需要用户授权，停止自主工作
    Error,
}

/// 一次进度上报
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressUpdate {
    /// Progress percentage, an integer from 0 to 100.
    pub progress: u8,
    /// Brief title describing the current work.
    pub title: String,
    /// What has been accomplished so far.
    pub description: String,
    /// Optional status. Omit for normal work; `error` when blocked; `warning` for concerns;
    /// `success` to mark the work as successful.
    #[serde(default)]
    pub status: Option<ProgressStatus>,
}

impl ProgressUpdate {
    /// 从工具调用参数解析；参数不合法时返回 None
    pub fn from_args(args: &Value) -> Option<Self> {
        serde_json::from_value::<Self>(args.clone())
            .ok()
            .filter(|u| u.progress <= 100)
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= 100
    }

    pub fn is_blocked(&self) -> bool {
        self.status == Some(ProgressStatus::Error)
    }
}

pub struct UpdateTaskProgressTool;

#[async_trait]
impl Tool for UpdateTaskProgressTool {
    fn name(&self) -> &str {
        UPDATE_TASK_PROGRESS
    }

    fn description(&self) -> &str {
        "Updates the current task progress with title, description, completion percentage and an \
         optional status. Use it to track progress on long-running tasks in solo mode and update it \
         as you make meaningful advances. Set progress to 100 only when the task is completely \
         finished. Set status to 'error' if you are blocked or need user authorization (this stops \
         autonomous work), 'warning' for concerns, 'success' to mark the work as successful."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<ProgressUpdate>()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let update: ProgressUpdate = parse_args(args)?;
        if update.progress > 100 {
            return Err(ToolError::invalid_args(format!(
                "progress must be between 0 and 100, got {}",
                update.progress
            )));
        }
        tracing::info!(
            progress = update.progress,
            title = %update.title,
            status = ?update.status,
            "task progress"
        );
        Ok("Task progress updated successfully".to_string())
    }
}
