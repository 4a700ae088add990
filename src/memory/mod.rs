//! 记忆层：只追加的对话存储、按会话 id 的持久化、轨迹记录

pub mod conversation;
pub mod persistence;
pub mod trajectory;

pub use conversation::{MemoryStore, Message, Role, ToolCall};
pub use persistence::{PersistedSession, SessionStore};
pub use trajectory::{
    PromptSnapshot, ToolCallRecord, TrajectoryDocument, TrajectoryRecorder, TurnRecord,
    TurnStatus,
};
