//! bash 命令工具
//!
//! 执行前用 CommandValidator 校验整条命令行；未通过的命令返回 AllowlistViolation，不启动任何进程。
//! 通过的命令以 `bash -c` 在会话工作目录中执行，带超时。stdout / stderr 边读边截断，内存中最多保留
//! `max_bytes`；bash 在独立进程组中启动，超时时整组杀掉，管道中的孙进程不会残留。

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::core::ToolError;
use crate::tools::schema::{args_schema, parse_args};
use crate::tools::truncate::{truncate_captured, OutputLimits};
use crate::tools::{CommandValidator, PolicyDecision, Tool};

#[derive(Debug, Deserialize, JsonSchema)]
struct BashArgs {
    /// The full command line to run. Pipes, `&&`, `;` and redirects are allowed;
    /// every command in it must be permitted by the allowlist.
    command: String,
}

pub struct BashTool {
    validator: CommandValidator,
    workdir: PathBuf,
    timeout: Duration,
    limits: OutputLimits,
    spawns: Arc<AtomicUsize>,
}

impl BashTool {
    pub fn new(
        validator: CommandValidator,
        workdir: impl Into<PathBuf>,
        timeout_secs: u64,
        limits: OutputLimits,
    ) -> Self {
        Self {
            validator,
            workdir: workdir.into(),
            timeout: Duration::from_secs(timeout_secs),
            limits,
            spawns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 已启动的子进程数（共享计数器，工具移交注册表后仍可读取）
    pub fn spawn_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.spawns)
    }

    fn command_of(args: &Value) -> Option<&str> {
        args.get("command").and_then(|v| v.as_str())
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the session working directory and return its stdout \
         (stderr is appended under a [stderr] header). Only allowlisted commands may run; \
         long output is truncated."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<BashArgs>()
    }

    fn check(&self, args: &Value) -> PolicyDecision {
        match Self::command_of(args) {
            Some(command) => self.validator.validate(command),
            None => PolicyDecision::Denied {
                reason: "missing 'command' argument".to_string(),
            },
        }
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let BashArgs { command } = parse_args(args)?;
        if let PolicyDecision::Denied { reason } = self.validator.validate(&command) {
            return Err(ToolError::AllowlistViolation { reason });
        }

        tracing::info!(command = %command, workdir = %self.workdir.display(), "bash tool execute");

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::failed(format!("failed to spawn bash: {e}")))?;
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.limits.max_bytes;
        let waited = tokio::time::timeout(self.timeout, async {
            let (out, err, status) = tokio::join!(
                read_capped(stdout, cap),
                read_capped(stderr, cap),
                child.wait()
            );
            Ok::<_, std::io::Error>((out?, err?, status?))
        })
        .await;

        let (out, err, status) = match waited {
            Ok(result) => {
                result.map_err(|e| ToolError::failed(format!("failed to wait for command: {e}")))?
            }
            Err(_) => {
                tracing::warn!(command = %command, secs = self.timeout.as_secs(), "bash tool timed out");
                kill_process_group(pid).await;
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "bash already exited");
                }
                return Err(ToolError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = truncate_captured(&out.kept, out.dropped, self.limits);
        let stderr = truncate_captured(&err.kept, err.dropped, self.limits);
        let combined = combine_streams(stdout, &stderr);

        if status.success() {
            Ok(combined)
        } else {
            Err(ToolError::Execution {
                exit_code: status.code().unwrap_or(-1),
                output: combined,
            })
        }
    }
}

/// 边读边截断的一路输出
#[derive(Debug, Default)]
struct Captured {
    kept: Vec<u8>,
    /// 超过上限后读到并丢弃的字节数
    dropped: usize,
}

/// 读到 EOF，只保留前 `cap` 字节；其余字节只计数，保证管道被持续排空
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> std::io::Result<Captured> {
    let mut captured = Captured::default();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(captured);
        }
        let take = cap.saturating_sub(captured.kept.len()).min(n);
        captured.kept.extend_from_slice(&buf[..take]);
        captured.dropped += n - take;
    }
}

/// bash 以 `process_group(0)` 启动，进程组号等于它的 pid
#[cfg(unix)]
async fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    // bash 内建的 kill，不依赖系统里的 kill 可执行文件
    let status = Command::new("bash")
        .arg("-c")
        .arg(format!("kill -KILL -- -{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) if s.success() => tracing::debug!(pgid = pid, "killed process group"),
        Ok(s) => tracing::warn!(pgid = pid, status = %s, "process group kill failed"),
        Err(e) => tracing::warn!(pgid = pid, error = %e, "process group kill failed"),
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: Option<u32>) {}

/// stdout 原样保留；stderr 非空时追加在 `[stderr]` 标题下
fn combine_streams(mut stdout: String, stderr: &str) -> String {
    if stderr.is_empty() {
        return stdout;
    }
    if !stdout.is_empty() && !stdout.ends_with('\n') {
        stdout.push('\n');
    }
    stdout.push_str("[stderr]\n");
    stdout.push_str(stderr);
    stdout
}
