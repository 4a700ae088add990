//! 会话持久化
//!
//! SessionStore 以构造时传入的存储根目录为基准，按会话 id 分目录：
//! `<root>/<session_id>/memory.json`（消息快照）、`trajectory.jsonl`（轨迹日志）、`trajectory.json`（导出文档）。
//! 快照写入先落临时文件再 rename，崩溃时最多丢失正在进行的一轮。

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::session::validate_session_id;
use crate::memory::Message;

const MEMORY_FILE: &str = "memory.json";

/// memory.json 的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub session_id: String,
    pub workdir: PathBuf,
    /// 已完成（含中断）的轮次数
    pub turns: usize,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

/// 按会话 id 存取记忆与轨迹文件
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 会话目录；id 非法（含路径分隔符等）时报错
    pub fn session_dir(&self, session_id: &str) -> anyhow::Result<PathBuf> {
        validate_session_id(session_id).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(self.root.join(session_id))
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.session_dir(session_id)
            .map(|d| d.join(MEMORY_FILE).exists())
            .unwrap_or(false)
    }

    /// 原子写入当前消息快照
    pub fn persist(&self, snapshot: &PersistedSession) -> anyhow::Result<()> {
        let dir = self.session_dir(&snapshot.session_id)?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create session dir {}", dir.display()))?;
        let data = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&dir.join(MEMORY_FILE), &data)
    }

    /// 读取某会话的消息快照
    pub fn load(&self, session_id: &str) -> anyhow::Result<PersistedSession> {
        let path = self.session_dir(session_id)?.join(MEMORY_FILE);
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let snapshot: PersistedSession =
            serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?;
        Ok(snapshot)
    }
}

/// 原子写文件：同目录临时文件 + persist(rename)，要么完整替换要么原文件不变
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    // 临时文件默认 0600，替换已有文件时沿用原权限
    if let Ok(meta) = std::fs::metadata(path) {
        std::fs::set_permissions(tmp.path(), meta.permissions())?;
    }
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("rename into {}: {}", path.display(), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCall;

    fn sample(id: &str) -> PersistedSession {
        PersistedSession {
            session_id: id.to_string(),
            workdir: PathBuf::from("/work"),
            turns: 2,
            updated_at: Utc::now(),
            messages: vec![
                Message::user("fix the bug"),
                Message::assistant_with_tools(
                    "looking",
                    vec![ToolCall {
                        id: "c1".into(),
                        name: "bash".into(),
                        arguments: serde_json::json!({"command": "ls"}),
                    }],
                ),
                Message::tool_result("c1", "src\n", false),
                Message::assistant("done"),
            ],
        }
    }

    #[test]
    fn test_persist_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let snap = sample("s1");
        store.persist(&snap).unwrap();
        assert!(store.exists("s1"));
        let loaded = store.load("s1").unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn test_persist_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let mut snap = sample("s2");
        store.persist(&snap).unwrap();
        snap.messages.push(Message::user("more"));
        store.persist(&snap).unwrap();
        assert_eq!(store.load("s2").unwrap().messages.len(), 5);
    }

    #[test]
    fn test_load_missing_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(!store.exists("nope"));
        assert!(store.load("nope").is_err());
        assert!(store.session_dir("../escape").is_err());
    }
}
