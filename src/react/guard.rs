//! Intent Guard / solo 模式
//!
//! 检测"宣布要做却没有发出工具调用"的纯文本轮次。solo 模式开启时合成一条续跑消息让模型动手，
//! 连续续跑次数达到上限后以诊断信息终止（GUARD_STOPPED）；关闭时纯文本轮次直接成为最终回答。
//! 模型通过 update_task_progress 报告 100 或 status=error（受阻）时，纯文本轮次正常结束；
//! 报告低于 100 的进度后，下一次模型调用的系统提示附带一次续跑消息。

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::extensions::{Extension, HookFlow, PromptContext};
use crate::memory::{Role, TurnRecord};
use crate::react::ParsedOutput;
use crate::tools::{ProgressUpdate, UPDATE_TASK_PROGRESS};

/// 意图句的最大长度（字符）；更长的文本视为实质性回答
const INTENT_MAX_CHARS: usize = 360;

pub const INTENT_NUDGE: &str = "Do not end with intent-only statements. \
Use available tools now and return concrete findings or a direct final answer in this turn.";

pub const CONTINUE_MESSAGE: &str = "Continue working autonomously. Do not pause or ask the user for input \
unless you are blocked or need authorization. Only stop when the task progress reaches 100%.";

pub const SOLO_MODE_INSTRUCTIONS: &str = "You are operating in SOLO MODE. This means you are expected to work \
independently on tasks that may take a significant amount of time to complete.

During your work:
- Use the update_task_progress tool regularly to report your progress
- Progress should be reported as an integer from 0-100
- Provide meaningful titles and descriptions of what you're working on
- Mark progress as 100 only when the task is completely finished
- Set status to \"error\" when blocked or when you need user authorization; this stops autonomous work
- Set status to \"warning\" when there is a concern but you can continue working";

const ACTION_KEYWORDS: &[&str] = &[
    "repo", "repository", "codebase", "project", "readme", "structure", "file", "fix",
    "implement", "refactor", "debug", "analyze", "저장소", "코드베이스", "구조", "파일", "정체",
    "수정", "구현", "디버그", "분석",
];

fn intent_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\b(i(?:'ll| will)|let me)\b.{0,96}\b(check|inspect|review|look)\b",
            r"확인해볼게요|확인하겠습니다|살펴보겠습니다|파악해보겠습니다|잠깐만요|검토해볼게요",
            r"저장소 구조를 빠르게 확인",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// 短文本且只表达了"将要查看"的意图
pub fn is_intent_only(text: &str) -> bool {
    let stripped = text.trim();
    if stripped.is_empty() || stripped.chars().count() > INTENT_MAX_CHARS {
        return false;
    }
    intent_patterns().iter().any(|p| p.is_match(stripped))
}

/// 用户请求是否要求对代码库动手
pub fn requires_action(prompt: &str) -> bool {
    let lowered = prompt.to_lowercase();
    ACTION_KEYWORDS.iter().any(|k| lowered.contains(k))
}

pub fn progress_reminder(progress: u8) -> String {
    format!(
        "You are in solo mode working on a task that may take a long time to complete. \
Please check your current progress to see how much you have accomplished for the user task. \
Current progress is {progress}%. If you haven't updated progress yet, use the {UPDATE_TASK_PROGRESS} tool \
with a 0-100 integer to indicate your progress. If you have completed the task, mark the progress as 100."
    )
}

/// 续跑策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoloMode {
    On,
    Off,
    /// 无人值守（批处理）时开启，交互时关闭
    #[default]
    Auto,
}

impl SoloMode {
    pub fn resolve(self, unattended: bool) -> bool {
        match self {
            Self::On => true,
            Self::Off => false,
            Self::Auto => unattended,
        }
    }
}

impl FromStr for SoloMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "auto" => Ok(Self::Auto),
            other => Err(format!("invalid solo mode '{other}' (expected on, off or auto)")),
        }
    }
}

impl fmt::Display for SoloMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Auto => "auto",
        })
    }
}

pub struct IntentGuard {
    enabled: bool,
    max_consecutive_nudges: usize,
    nudges: usize,
    progress: Option<ProgressUpdate>,
    /// 上一轮报告了未完成的进度，下一次调用前提醒继续
    continue_pending: bool,
}

impl IntentGuard {
    pub fn new(enabled: bool, max_consecutive_nudges: usize) -> Self {
        Self {
            enabled,
            max_consecutive_nudges,
            nudges: 0,
            progress: None,
            continue_pending: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 最近一次上报的进度（未上报为 0）
    pub fn progress(&self) -> u8 {
        self.progress.as_ref().map(|p| p.progress).unwrap_or(0)
    }

    fn record_progress(&mut self, record: &TurnRecord) {
        let latest = record
            .tool_calls
            .iter()
            .filter(|r| r.call.name == UPDATE_TASK_PROGRESS)
            .filter(|r| r.result.as_ref().is_some_and(|res| res.is_success()))
            .filter_map(|r| ProgressUpdate::from_args(&r.call.arguments))
            .last();
        if let Some(update) = latest {
            self.continue_pending = !(update.is_complete() || update.is_blocked());
            self.progress = Some(update);
        }
    }

    fn work_finished(&self) -> bool {
        self.progress
            .as_ref()
            .is_some_and(|p| p.is_complete() || p.is_blocked())
    }
}

fn last_user_prompt(record: &TurnRecord) -> &str {
    record
        .prompt
        .messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.trim())
        .find(|c| !c.is_empty())
        .unwrap_or_default()
}

fn preview(text: &str) -> String {
    let t = text.trim();
    if t.chars().count() > 200 {
        format!("{}...", t.chars().take(200).collect::<String>())
    } else {
        t.to_string()
    }
}

impl Extension for IntentGuard {
    fn name(&self) -> &str {
        "intent_guard"
    }

    fn pre_call(&mut self, ctx: &mut PromptContext) -> HookFlow {
        if self.enabled {
            ctx.append_system(SOLO_MODE_INSTRUCTIONS);
            if std::mem::take(&mut self.continue_pending) {
                ctx.append_system(CONTINUE_MESSAGE);
            }
        }
        HookFlow::Proceed
    }

    fn post_turn(&mut self, output: &ParsedOutput, record: &TurnRecord) -> HookFlow {
        self.record_progress(record);
        if output.has_tool_calls() {
            self.nudges = 0;
            return HookFlow::Proceed;
        }
        if !self.enabled || self.work_finished() {
            return HookFlow::Proceed;
        }
        if self.nudges >= self.max_consecutive_nudges {
            return HookFlow::Halt(format!(
                "{} consecutive text-only turns without tool calls (cap {}), progress {}%; last response: {}",
                self.nudges + 1,
                self.max_consecutive_nudges,
                self.progress(),
                preview(&output.text)
            ));
        }
        self.nudges += 1;
        let nudge = if is_intent_only(&output.text) && requires_action(last_user_prompt(record)) {
            INTENT_NUDGE.to_string()
        } else {
            progress_reminder(self.progress())
        };
        HookFlow::Nudge(nudge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Message, PromptSnapshot, ToolCall, ToolCallRecord};
    use crate::tools::{PolicyDecision, ToolOutcome, ToolResult};

    fn record(task: &str, calls: Vec<ToolCallRecord>) -> TurnRecord {
        let mut r = TurnRecord::begin(
            "s",
            0,
            PromptSnapshot {
                model: "m".into(),
                system: String::new(),
                messages: vec![Message::user(task)],
                tools: vec![],
            },
        );
        r.tool_calls = calls;
        r
    }

    fn text(t: &str) -> ParsedOutput {
        ParsedOutput {
            text: t.into(),
            tool_calls: vec![],
        }
    }

    fn progress_call(progress: u8, status: Option<&str>) -> ToolCallRecord {
        let mut args = serde_json::json!({"progress": progress, "title": "t", "description": "d"});
        if let Some(s) = status {
            args["status"] = serde_json::json!(s);
        }
        ToolCallRecord {
            call: ToolCall {
                id: "p".into(),
                name: UPDATE_TASK_PROGRESS.into(),
                arguments: args,
            },
            decision: PolicyDecision::Allowed,
            result: Some(ToolResult {
                call_id: "p".into(),
                tool: UPDATE_TASK_PROGRESS.into(),
                outcome: ToolOutcome::Success {
                    output: "ok".into(),
                },
            }),
        }
    }

    #[test]
    fn test_intent_detection() {
        assert!(is_intent_only("Let me check the repository structure first."));
        assert!(is_intent_only("I'll quickly look at the failing test."));
        assert!(is_intent_only("저장소 구조를 빠르게 확인해볼게요."));
        assert!(!is_intent_only("The bug is in parser.rs: the loop skips the last token."));
        assert!(!is_intent_only(""));
        let long = format!("Let me check {}", "x".repeat(400));
        assert!(!is_intent_only(&long));
    }

    #[test]
    fn test_solo_mode_resolution() {
        assert!(SoloMode::On.resolve(false));
        assert!(!SoloMode::Off.resolve(true));
        assert!(SoloMode::Auto.resolve(true));
        assert!(!SoloMode::Auto.resolve(false));
        assert_eq!("AUTO".parse::<SoloMode>().unwrap(), SoloMode::Auto);
        assert!("sometimes".parse::<SoloMode>().is_err());
    }

    #[test]
    fn test_off_never_nudges() {
        let mut guard = IntentGuard::new(false, 1);
        let r = record("fix the bug in the repo", vec![]);
        assert_eq!(guard.post_turn(&text("Let me check the repo."), &r), HookFlow::Proceed);
    }

    #[test]
    fn test_on_nudges_once_then_halts() {
        let mut guard = IntentGuard::new(true, 1);
        let r = record("fix the bug in the repo", vec![]);
        assert_eq!(
            guard.post_turn(&text("Let me check the repo."), &r),
            HookFlow::Nudge(INTENT_NUDGE.to_string())
        );
        assert!(guard.post_turn(&text("Let me check the repo."), &r).is_halt());
    }

    #[test]
    fn test_tool_calls_reset_counter() {
        let mut guard = IntentGuard::new(true, 1);
        let r = record("explain", vec![]);
        assert!(matches!(guard.post_turn(&text("thinking"), &r), HookFlow::Nudge(_)));
        let acting = ParsedOutput {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: "c".into(),
                name: "bash".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }],
        };
        assert_eq!(guard.post_turn(&acting, &r), HookFlow::Proceed);
        assert!(matches!(guard.post_turn(&text("thinking"), &r), HookFlow::Nudge(_)));
    }

    #[test]
    fn test_reminder_carries_progress() {
        let mut guard = IntentGuard::new(true, 3);
        let r = record("explain", vec![progress_call(40, None)]);
        let acting = ParsedOutput {
            text: String::new(),
            tool_calls: vec![progress_call(40, None).call],
        };
        guard.post_turn(&acting, &r);
        assert_eq!(guard.progress(), 40);
        let flow = guard.post_turn(&text("working on it"), &record("explain", vec![]));
        assert_eq!(flow, HookFlow::Nudge(progress_reminder(40)));
        assert!(progress_reminder(40).contains("Current progress is 40%"));
    }

    #[test]
    fn test_complete_or_blocked_progress_finishes() {
        for call in [progress_call(100, None), progress_call(30, Some("error"))] {
            let mut guard = IntentGuard::new(true, 1);
            let acting = ParsedOutput {
                text: String::new(),
                tool_calls: vec![call.call.clone()],
            };
            guard.post_turn(&acting, &record("fix it", vec![call]));
            assert_eq!(
                guard.post_turn(&text("All done."), &record("fix it", vec![])),
                HookFlow::Proceed
            );
        }
    }

    fn empty_ctx() -> PromptContext {
        PromptContext {
            system: String::new(),
            messages: vec![],
            tools: vec![],
        }
    }

    #[test]
    fn test_incomplete_progress_adds_continue_message_once() {
        let mut guard = IntentGuard::new(true, 3);
        let call = progress_call(60, Some("warning"));
        let acting = ParsedOutput {
            text: String::new(),
            tool_calls: vec![call.call.clone()],
        };
        assert_eq!(guard.post_turn(&acting, &record("fix it", vec![call])), HookFlow::Proceed);

        let mut ctx = empty_ctx();
        guard.pre_call(&mut ctx);
        assert!(ctx.system.ends_with(CONTINUE_MESSAGE));
        let mut ctx = empty_ctx();
        guard.pre_call(&mut ctx);
        assert!(!ctx.system.contains(CONTINUE_MESSAGE));

        // 随后的纯文本轮次仍按进度提醒续跑
        let flow = guard.post_turn(&text("making progress"), &record("fix it", vec![]));
        assert_eq!(flow, HookFlow::Nudge(progress_reminder(60)));
    }

    #[test]
    fn test_finished_progress_adds_no_continue_message() {
        for call in [progress_call(100, None), progress_call(20, Some("error"))] {
            let mut guard = IntentGuard::new(true, 1);
            let acting = ParsedOutput {
                text: String::new(),
                tool_calls: vec![call.call.clone()],
            };
            guard.post_turn(&acting, &record("fix it", vec![call]));
            let mut ctx = empty_ctx();
            guard.pre_call(&mut ctx);
            assert!(!ctx.system.contains(CONTINUE_MESSAGE));
        }
    }

    #[test]
    fn test_pre_call_injects_instructions_only_when_enabled() {
        let mut ctx = PromptContext {
            system: String::new(),
            messages: vec![],
            tools: vec![],
        };
        IntentGuard::new(false, 1).pre_call(&mut ctx);
        assert!(ctx.system.is_empty());
        IntentGuard::new(true, 1).pre_call(&mut ctx);
        assert!(ctx.system.starts_with("You are operating in SOLO MODE"));
    }
}
