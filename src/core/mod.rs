//! 核心层：错误分类与恢复、循环状态与退出码、会话、协作式取消、会话构建

pub mod builder;
pub mod error;
pub mod recovery;
pub mod session;
pub mod shutdown;
pub mod state;

pub use builder::SessionBuilder;
pub use error::{AgentError, GuardExceeded, ProviderError, ToolError};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use session::Session;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{exit_codes, LoopState, Outcome};
