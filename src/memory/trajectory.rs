//! 轨迹记录器
//!
//! 每轮一条不可变 JSON 记录，只追加写入 `trajectory.jsonl`；终态时导出为单个文档
//! `trajectory.json`（`{"session_id": ..., "turns": [...]}`），供审计与下游评测使用。

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::persistence::write_atomic;
use crate::memory::{Message, SessionStore, ToolCall};
use crate::tools::{PolicyDecision, ToolResult};

const JOURNAL_FILE: &str = "trajectory.jsonl";
const EXPORT_FILE: &str = "trajectory.json";

/// 轮次状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Complete,
    /// 被取消打断的部分轮次
    Interrupted,
    /// 模型调用失败，note 中为归类后的错误
    Failed,
}

/// 发给模型的 prompt 快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSnapshot {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    /// 本轮提供给模型的工具名
    pub tools: Vec<String>,
}

/// 一次工具调用：校验结论 + 结果（被跳过的调用没有结果）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call: ToolCall,
    pub decision: PolicyDecision,
    pub result: Option<ToolResult>,
}

/// 单轮轨迹记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub session_id: String,
    pub index: usize,
    pub status: TurnStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub prompt: PromptSnapshot,
    /// 后端原始响应；模型调用未完成时为 null
    pub raw_response: Value,
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TurnRecord {
    pub fn begin(session_id: &str, index: usize, prompt: PromptSnapshot) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            index,
            status: TurnStatus::Complete,
            started_at: now,
            finished_at: now,
            prompt,
            raw_response: Value::Null,
            tool_calls: Vec::new(),
            note: None,
        }
    }

    pub fn finish(&mut self, status: TurnStatus) {
        self.status = status;
        self.finished_at = Utc::now();
    }
}

/// 导出文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryDocument {
    pub session_id: String,
    pub exported_at: DateTime<Utc>,
    pub turns: Vec<TurnRecord>,
}

/// 会话独占的轨迹记录器
#[derive(Debug)]
pub struct TrajectoryRecorder {
    session_id: String,
    journal: PathBuf,
    export: PathBuf,
    appended: usize,
}

impl TrajectoryRecorder {
    /// 打开（或续写）某会话的轨迹日志
    pub fn open(store: &SessionStore, session_id: &str) -> anyhow::Result<Self> {
        let dir = store.session_dir(session_id)?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create session dir {}", dir.display()))?;
        let journal = dir.join(JOURNAL_FILE);
        let appended = if journal.exists() {
            read_journal(&journal)?.len()
        } else {
            0
        };
        Ok(Self {
            session_id: session_id.to_string(),
            journal,
            export: dir.join(EXPORT_FILE),
            appended,
        })
    }

    /// 追加一条记录（一行 JSON）；已写入的行从不改写
    pub fn append(&mut self, record: &TurnRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal)
            .with_context(|| format!("open {}", self.journal.display()))?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        self.appended += 1;
        tracing::debug!(session = %self.session_id, turn = record.index, status = ?record.status, "trajectory record appended");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.appended
    }

    pub fn is_empty(&self) -> bool {
        self.appended == 0
    }

    pub fn records(&self) -> anyhow::Result<Vec<TurnRecord>> {
        if !self.journal.exists() {
            return Ok(Vec::new());
        }
        read_journal(&self.journal)
    }

    /// 由日志重新生成导出文档，返回其路径
    pub fn export(&self) -> anyhow::Result<PathBuf> {
        let doc = TrajectoryDocument {
            session_id: self.session_id.clone(),
            exported_at: Utc::now(),
            turns: self.records()?,
        };
        write_atomic(&self.export, &serde_json::to_vec_pretty(&doc)?)?;
        Ok(self.export.clone())
    }

    pub fn export_path(&self) -> &Path {
        &self.export
    }
}

fn read_journal(path: &Path) -> anyhow::Result<Vec<TurnRecord>> {
    let file = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: TurnRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), i + 1))?;
        records.push(record);
    }
    Ok(records)
}
