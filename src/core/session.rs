//! 会话：不可变 id + 固定工作目录 + 轮次计数

use std::path::{Path, PathBuf};

use crate::core::AgentError;

/// 一次端到端任务执行。工作目录在会话生命周期内固定不变。
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    workdir: PathBuf,
    turns: usize,
}

impl Session {
    /// 新会话：随机 id
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workdir: workdir.into(),
            turns: 0,
        }
    }

    /// 恢复已有会话（id 来自持久化存储，turns 为已完成的轮次数）
    pub fn restore(
        id: impl Into<String>,
        workdir: impl Into<PathBuf>,
        turns: usize,
    ) -> Result<Self, AgentError> {
        let id = id.into();
        validate_session_id(&id)?;
        Ok(Self {
            id,
            workdir: workdir.into(),
            turns,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn turns(&self) -> usize {
        self.turns
    }

    /// 开始新一轮，返回该轮序号（从 0 开始）
    pub fn next_turn(&mut self) -> usize {
        let index = self.turns;
        self.turns += 1;
        index
    }
}

/// 会话 id 会成为存储目录名，禁止路径分隔符与 `..`
pub fn validate_session_id(id: &str) -> Result<(), AgentError> {
    let ok = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(AgentError::Config(format!("invalid session id: {id:?}")))
    }
}
