//! 编排层：主循环、输出解析、意图守卫与过程事件

pub mod events;
pub mod guard;
pub mod loop_;
pub mod output;

pub use events::LoopEvent;
pub use guard::{IntentGuard, SoloMode};
pub use loop_::{load_session, LoopSettings, Orchestrator, SessionReport, DEFAULT_SYSTEM_PROMPT};
pub use output::{parse_output, ParsedOutput};
