//! 扩展管线
//!
//! 每个扩展是实现 Extension 的值，可选实现四个钩子：pre_call（改写即将发送的 prompt）、post_call（检查/修改原始响应）、
//! post_output（检查解析后的输出）、post_turn（工具执行完成后）。按声明顺序执行；钩子可以请求续跑（Nudge）
//! 或终止本会话（Halt），但不能改动 MemoryStore 的顺序：pre_call 看到的是快照副本。

pub mod cwd;

pub use cwd::WorkingDirectoryContext;

use crate::llm::{CanonicalResponse, ToolDefinition};
use crate::memory::{Message, TurnRecord};
use crate::react::ParsedOutput;

/// 即将发送的 prompt
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl PromptContext {
    /// 在系统提示末尾追加一段
    pub fn append_system(&mut self, section: &str) {
        if !self.system.is_empty() {
            self.system.push_str("\n\n");
        }
        self.system.push_str(section);
    }
}

/// 钩子结论
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HookFlow {
    #[default]
    Proceed,
    /// 追加一条用户消息后继续下一轮
    Nudge(String),
    /// 终止会话，附带诊断
    Halt(String),
}

impl HookFlow {
    /// Halt 优先于 Nudge，Nudge 优先于 Proceed；多条 Nudge 合并
    pub fn combine(self, other: HookFlow) -> HookFlow {
        match (self, other) {
            (HookFlow::Halt(d), _) | (_, HookFlow::Halt(d)) => HookFlow::Halt(d),
            (HookFlow::Nudge(a), HookFlow::Nudge(b)) => HookFlow::Nudge(format!("{a}\n\n{b}")),
            (HookFlow::Nudge(a), HookFlow::Proceed) | (HookFlow::Proceed, HookFlow::Nudge(a)) => {
                HookFlow::Nudge(a)
            }
            (HookFlow::Proceed, HookFlow::Proceed) => HookFlow::Proceed,
        }
    }

    pub fn is_halt(&self) -> bool {
        matches!(self, HookFlow::Halt(_))
    }
}

/// 扩展钩子；默认全部放行
pub trait Extension: Send {
    fn name(&self) -> &str;

    fn pre_call(&mut self, _ctx: &mut PromptContext) -> HookFlow {
        HookFlow::Proceed
    }

    fn post_call(&mut self, _response: &mut CanonicalResponse) -> HookFlow {
        HookFlow::Proceed
    }

    fn post_output(&mut self, _output: &ParsedOutput) -> HookFlow {
        HookFlow::Proceed
    }

    fn post_turn(&mut self, _output: &ParsedOutput, _record: &TurnRecord) -> HookFlow {
        HookFlow::Proceed
    }
}

/// 有序扩展列表；某个钩子返回 Halt 时同一阶段后续扩展不再执行
#[derive(Default)]
pub struct ExtensionPipeline {
    extensions: Vec<Box<dyn Extension>>,
}

impl ExtensionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ext: impl Extension + 'static) {
        self.extensions.push(Box::new(ext));
    }

    pub fn with(mut self, ext: impl Extension + 'static) -> Self {
        self.push(ext);
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.extensions.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    fn run<F>(&mut self, stage: &str, mut hook: F) -> HookFlow
    where
        F: FnMut(&mut (dyn Extension + 'static)) -> HookFlow,
    {
        let mut flow = HookFlow::Proceed;
        for ext in self.extensions.iter_mut() {
            let next = hook(ext.as_mut());
            if next != HookFlow::Proceed {
                tracing::debug!(extension = ext.name(), stage, flow = ?next, "extension hook");
            }
            flow = flow.combine(next);
            if flow.is_halt() {
                break;
            }
        }
        flow
    }

    pub fn pre_call(&mut self, ctx: &mut PromptContext) -> HookFlow {
        self.run("pre_call", |ext| ext.pre_call(ctx))
    }

    pub fn post_call(&mut self, response: &mut CanonicalResponse) -> HookFlow {
        self.run("post_call", |ext| ext.post_call(response))
    }

    pub fn post_output(&mut self, output: &ParsedOutput) -> HookFlow {
        self.run("post_output", |ext| ext.post_output(output))
    }

    pub fn post_turn(&mut self, output: &ParsedOutput, record: &TurnRecord) -> HookFlow {
        self.run("post_turn", |ext| ext.post_turn(output, record))
    }
}
