//! 工具层：注册表、执行器、命令白名单与内置工具

pub mod allowlist;
pub mod executor;
pub mod file_edit;
pub mod file_policy;
pub mod progress;
pub mod registry;
pub mod schema;
pub mod shell;
pub mod truncate;

pub use allowlist::{split_commands, CommandPolicy, CommandValidator, DenyRule, PolicyDecision};
pub use executor::{ToolDispatch, ToolExecutor, ToolOutcome, ToolResult};
pub use file_edit::FileEditTool;
pub use file_policy::{FileAccess, FileAccessPolicy};
pub use progress::{ProgressStatus, ProgressUpdate, UpdateTaskProgressTool, UPDATE_TASK_PROGRESS};
pub use registry::{Tool, ToolRegistry};
pub use shell::BashTool;
pub use truncate::{truncate_output, OutputLimits};
