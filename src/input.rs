//! 任务输入解析
//!
//! 来源优先级：提示文件 > 内联文本 > 管道输入（stdin 非终端时才读取）。只有一个来源生效。

use std::io::Read;
use std::path::Path;

use crate::core::AgentError;

/// 任务来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    File,
    Inline,
    Stdin,
}

/// 解析任务文本；所有来源都缺失或内容为空时返回 Input 错误
pub fn resolve_task<R: Read>(
    prompt_file: Option<&Path>,
    inline: Option<&str>,
    stdin: R,
    stdin_is_terminal: bool,
) -> Result<(String, TaskSource), AgentError> {
    let (text, source) = if let Some(path) = prompt_file {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Input(format!("cannot read prompt file {}: {e}", path.display()))
        })?;
        (text, TaskSource::File)
    } else if let Some(text) = inline {
        (text.to_string(), TaskSource::Inline)
    } else if !stdin_is_terminal {
        let mut text = String::new();
        let mut stdin = stdin;
        stdin
            .read_to_string(&mut text)
            .map_err(|e| AgentError::Input(format!("cannot read piped input: {e}")))?;
        (text, TaskSource::Stdin)
    } else {
        return Err(AgentError::Input(
            "no task given: use --prompt-file, --prompt or pipe the task on stdin".into(),
        ));
    };

    if text.trim().is_empty() {
        return Err(AgentError::Input(format!("task from {source:?} is empty")));
    }
    tracing::debug!(source = ?source, chars = text.chars().count(), "task resolved");
    Ok((text, source))
}
