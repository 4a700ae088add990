//! 把会话工作目录写入系统提示

use std::path::PathBuf;

use crate::extensions::{Extension, HookFlow, PromptContext};

pub struct WorkingDirectoryContext {
    workdir: PathBuf,
}

impl WorkingDirectoryContext {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

impl Extension for WorkingDirectoryContext {
    fn name(&self) -> &str {
        "working_directory"
    }

    fn pre_call(&mut self, ctx: &mut PromptContext) -> HookFlow {
        ctx.append_system(&format!(
            "Current working directory: {}",
            self.workdir.display()
        ));
        HookFlow::Proceed
    }
}
