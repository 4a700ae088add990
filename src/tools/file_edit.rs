//! 文件工具 `str_replace_based_edit_tool`
//!
//! 命令：view / create / str_replace / insert / undo_edit。相对路径按会话工作目录解析并按词法规范化，
//! 执行前由 FileAccess 校验（默认不允许离开工作目录）。
//! 每次成功修改前把原内容存入按文件的内存历史，undo_edit 恢复最近一次快照（create 引入的文件则删除）。
//! 写入先落同目录临时文件再 rename：要么完整生效，要么返回工具错误。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::core::ToolError;
use crate::memory::persistence::write_atomic;
use crate::tools::schema::{args_schema, parse_args};
use crate::tools::file_policy::{resolve_path, FileAccess};
use crate::tools::truncate::{truncate_output, OutputLimits};
use crate::tools::{PolicyDecision, Tool};

/// 修改后回显的上下文行数
const SNIPPET_CONTEXT: usize = 4;
const DIRECTORY_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum EditCommand {
    View,
    Create,
    StrReplace,
    Insert,
    UndoEdit,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EditArgs {
    /// Operation to perform.
    command: EditCommand,
    /// File or directory path, absolute or relative to the working directory.
    path: String,
    /// `view` only: `[start_line, end_line]`, 1-based and inclusive; `end_line = -1` means end of file.
    view_range: Option<Vec<i64>>,
    /// `create` only: full content of the new file.
    file_text: Option<String>,
    /// `str_replace` only: exact text to replace; must occur exactly once.
    old_str: Option<String>,
    /// `str_replace` / `insert`: replacement or inserted text.
    new_str: Option<String>,
    /// `insert` only: insert after this line (0 inserts at the top).
    insert_line: Option<usize>,
}

/// 文件历史：按规范化路径索引，None 表示该次修改前文件不存在
type History = HashMap<PathBuf, Vec<Option<String>>>;

pub struct FileEditTool {
    workdir: PathBuf,
    max_view_lines: usize,
    access: FileAccess,
    history: Mutex<History>,
}

impl FileEditTool {
    pub fn new(workdir: impl Into<PathBuf>, max_view_lines: usize, access: FileAccess) -> Self {
        Self {
            workdir: workdir.into(),
            max_view_lines,
            access,
            history: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        resolve_path(&self.workdir, path)
    }

    fn not_found(&self, path: &Path) -> ToolError {
        ToolError::failed(format!(
            "File not found: {}. Please use the absolute path to the file. Your current working directory is {}.",
            path.display(),
            self.workdir.display()
        ))
    }

    async fn read(&self, path: &Path) -> Result<String, ToolError> {
        if !path.exists() {
            return Err(self.not_found(path));
        }
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ToolError::failed(format!("Failed to read {}: {e}", path.display())))
    }

    async fn record(&self, path: &Path, before: Option<String>) {
        self.history
            .lock()
            .await
            .entry(path.to_path_buf())
            .or_default()
            .push(before);
    }

    fn view(&self, path: &Path, range: Option<Vec<i64>>) -> Result<String, ToolError> {
        if !path.exists() {
            return Err(self.not_found(path));
        }
        if path.is_dir() {
            return Ok(self.view_directory(path));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ToolError::failed(format!("Failed to read {}: {e}", path.display())))?;
        view_content(&content, range, self.max_view_lines)
    }

    /// 深度 2 以内的条目，跳过隐藏项
    fn view_directory(&self, dir: &Path) -> String {
        let mut entries = Vec::new();
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(DIRECTORY_DEPTH)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker.filter_map(Result::ok) {
            let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            let mut line = rel.display().to_string();
            if entry.file_type().is_dir() {
                line.push('/');
            }
            entries.push(line);
        }
        let listing = format!(
            "Files and directories up to {DIRECTORY_DEPTH} levels deep in {}, excluding hidden items:\n{}",
            dir.display(),
            entries.join("\n")
        );
        truncate_output(
            &listing,
            OutputLimits {
                max_bytes: usize::MAX,
                max_lines: self.max_view_lines + 1,
            },
        )
    }

    async fn create(&self, path: &Path, text: String) -> Result<String, ToolError> {
        if path.exists() {
            return Err(ToolError::failed(format!(
                "File already exists: {}. Use str_replace or insert to change it.",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::failed(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        write_file(path, &text)?;
        self.record(path, None).await;
        Ok(format!("File created successfully at: {}", path.display()))
    }

    async fn str_replace(&self, path: &Path, old: String, new: String) -> Result<String, ToolError> {
        if old.is_empty() {
            return Err(ToolError::invalid_args("old_str must not be empty"));
        }
        let content = self.read(path).await?;
        let occurrences = content.matches(old.as_str()).count();
        match occurrences {
            0 => {
                return Err(ToolError::failed(format!(
                    "No replacement was performed: old_str did not appear verbatim in {}.",
                    path.display()
                )))
            }
            1 => {}
            n => {
                return Err(ToolError::failed(format!(
                    "No replacement was performed: found {n} occurrences of old_str in {}. Include more context to make it unique.",
                    path.display()
                )))
            }
        }
        let start = content.find(old.as_str()).unwrap_or(0);
        let updated = content.replacen(old.as_str(), &new, 1);
        write_file(path, &updated)?;
        self.record(path, Some(content)).await;

        let first = updated[..start].matches('\n').count() + 1;
        let last = first + new.matches('\n').count();
        Ok(format!(
            "The file {} has been edited. Here is a snippet of the result:\n{}",
            path.display(),
            snippet(&updated, first, last)
        ))
    }

    async fn insert(&self, path: &Path, after: usize, text: String) -> Result<String, ToolError> {
        let content = self.read(path).await?;
        let lines: Vec<&str> = content.split_inclusive('\n').collect();
        if after > lines.len() {
            return Err(ToolError::invalid_args(format!(
                "Invalid insert_line {after}: the file has {} lines",
                lines.len()
            )));
        }
        let mut updated = lines[..after].concat();
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&text);
        if !text.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&lines[after..].concat());
        write_file(path, &updated)?;
        self.record(path, Some(content)).await;

        let first = after + 1;
        let last = after + text.trim_end_matches('\n').matches('\n').count() + 1;
        Ok(format!(
            "The file {} has been edited. Here is a snippet of the result:\n{}",
            path.display(),
            snippet(&updated, first, last)
        ))
    }

    /// 先恢复再出栈：恢复失败时快照保留，可以重试
    async fn undo(&self, path: &Path) -> Result<String, ToolError> {
        let mut history = self.history.lock().await;
        let Some(versions) = history.get_mut(path) else {
            return Err(no_history(path));
        };
        let message = match versions.last() {
            None => return Err(no_history(path)),
            Some(None) => {
                tokio::fs::remove_file(path).await.map_err(|e| {
                    ToolError::failed(format!("Failed to remove {}: {e}", path.display()))
                })?;
                format!("Last edit to {} undone successfully (file removed).", path.display())
            }
            Some(Some(text)) => {
                write_file(path, text)?;
                format!("Last edit to {} undone successfully.", path.display())
            }
        };
        versions.pop();
        Ok(message)
    }
}

fn no_history(path: &Path) -> ToolError {
    ToolError::failed(format!("No edit history for {}", path.display()))
}

fn write_file(path: &Path, text: &str) -> Result<(), ToolError> {
    write_atomic(path, text.as_bytes()).map_err(|e| ToolError::failed(format!("{e:#}")))
}

/// 文件内容按行切分；末尾换行不产生额外空行
fn split_lines(content: &str) -> Vec<&str> {
    if content.is_empty() {
        return Vec::new();
    }
    content
        .strip_suffix('\n')
        .unwrap_or(content)
        .split('\n')
        .collect()
}

fn number_lines(lines: &[&str], start: usize, end: usize) -> Vec<String> {
    let width = end.to_string().len();
    (start..=end)
        .map(|i| format!("{i:>width$}|{}", lines[i - 1]))
        .collect()
}

/// 带行号查看；显式范围超过上限报错，不指定范围时截断到上限并提示
fn view_content(content: &str, range: Option<Vec<i64>>, max_lines: usize) -> Result<String, ToolError> {
    let lines = split_lines(content);
    let total = lines.len();
    if total == 0 {
        return Ok("(empty file)".to_string());
    }

    let (start, end) = match range.as_deref() {
        None | Some([]) => (1, total.min(max_lines)),
        Some([s]) => explicit_range(*s, -1, total)?,
        Some([s, e]) => explicit_range(*s, *e, total)?,
        Some(_) => {
            return Err(ToolError::invalid_args(
                "view_range must be [start_line, end_line]",
            ))
        }
    };

    if end - start + 1 > max_lines {
        return Err(ToolError::invalid_args(format!(
            "Max view lines exceeded: {} > {max_lines}, please specify a smaller range",
            end - start + 1
        )));
    }

    let mut out = Vec::new();
    if start > 1 {
        out.push(format!("({} line(s) above)", start - 1));
    }
    out.extend(number_lines(&lines, start, end));
    if end < total {
        out.push(format!("({} line(s) below)", total - end));
    }
    Ok(out.join("\n"))
}

/// 1 起始的闭区间；end 为 -1 表示到文件末尾，超出文件长度时截到末尾
fn explicit_range(s: i64, e: i64, total: usize) -> Result<(usize, usize), ToolError> {
    if s < 1 || (e < 1 && e != -1) {
        return Err(ToolError::invalid_args("Line numbers must be positive"));
    }
    let start = s as usize;
    let end = if e == -1 { total } else { (e as usize).min(total) };
    if start > end {
        return Err(ToolError::invalid_args(format!(
            "Start line must be less than or equal to end line (start {start}, end {end}, file has {total} lines)"
        )));
    }
    Ok((start, end))
}

/// 修改位置前后各若干行
fn snippet(content: &str, first: usize, last: usize) -> String {
    let lines = split_lines(content);
    if lines.is_empty() {
        return String::new();
    }
    let start = first.saturating_sub(SNIPPET_CONTEXT).max(1);
    let end = (last + SNIPPET_CONTEXT).min(lines.len());
    if start > end {
        return String::new();
    }
    number_lines(&lines, start, end).join("\n")
}

#[async_trait]
impl Tool for FileEditTool {
    fn name(&self) -> &str {
        "str_replace_based_edit_tool"
    }

    fn description(&self) -> &str {
        "View, create and edit files. `view` shows numbered lines of a file or lists a directory; \
         `create` writes a new file (fails if it exists); `str_replace` replaces exactly one occurrence \
         of old_str; `insert` inserts new_str after insert_line; `undo_edit` reverts the last edit to a file."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<EditArgs>()
    }

    fn check(&self, args: &Value) -> PolicyDecision {
        match args.get("path").and_then(|v| v.as_str()) {
            Some(path) => self.access.check(&self.workdir, &self.resolve(path)),
            None => PolicyDecision::Denied {
                reason: "missing 'path' argument".to_string(),
            },
        }
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let args: EditArgs = parse_args(args)?;
        let path = self.resolve(&args.path);
        if let PolicyDecision::Denied { reason } = self.access.check(&self.workdir, &path) {
            return Err(ToolError::AllowlistViolation { reason });
        }
        tracing::debug!(command = ?args.command, path = %path.display(), "file tool execute");
        match args.command {
            EditCommand::View => self.view(&path, args.view_range),
            EditCommand::Create => {
                let text = args
                    .file_text
                    .ok_or_else(|| ToolError::invalid_args("create requires file_text"))?;
                self.create(&path, text).await
            }
            EditCommand::StrReplace => {
                let old = args
                    .old_str
                    .ok_or_else(|| ToolError::invalid_args("str_replace requires old_str"))?;
                self.str_replace(&path, old, args.new_str.unwrap_or_default())
                    .await
            }
            EditCommand::Insert => {
                let after = args
                    .insert_line
                    .ok_or_else(|| ToolError::invalid_args("insert requires insert_line"))?;
                let text = args
                    .new_str
                    .ok_or_else(|| ToolError::invalid_args("insert requires new_str"))?;
                self.insert(&path, after, text).await
            }
            EditCommand::UndoEdit => self.undo(&path).await,
        }
    }
}
