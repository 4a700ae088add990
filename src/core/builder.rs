//! 会话构建器：统一的编排器初始化逻辑
//!
//! CLI 与集成测试共用同一套工具注册与扩展顺序；模型适配器可以来自路由器，也可以由调用方注入。

use std::path::Path;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::{AgentError, Session};
use crate::extensions::{ExtensionPipeline, WorkingDirectoryContext};
use crate::llm::{ModelAdapter, ProviderRouter};
use crate::memory::{MemoryStore, SessionStore};
use crate::react::{IntentGuard, LoopSettings, Orchestrator};
use crate::tools::{
    BashTool, CommandValidator, FileAccess, FileEditTool, ToolExecutor, ToolRegistry,
    UpdateTaskProgressTool,
};

/// 会话构建器：按配置组装工具、扩展与循环参数
pub struct SessionBuilder {
    config: AppConfig,
    model: String,
    solo: bool,
}

impl SessionBuilder {
    /// 模型取 CURRENT_MODEL 或配置；续跑策略按交互会话解析
    pub fn new(config: AppConfig) -> Self {
        let model = config.effective_model();
        let solo = config.guard.solo_mode.resolve(false);
        Self { config, model, solo }
    }

    /// 命令行显式指定的模型
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// 是否无人值守（决定 auto 续跑策略）
    pub fn unattended(mut self, unattended: bool) -> Self {
        self.solo = self.config.guard.solo_mode.resolve(unattended);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn solo_enabled(&self) -> bool {
        self.solo
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session_store(&self) -> SessionStore {
        SessionStore::new(&self.config.app.storage_root)
    }

    /// 工具注册表：bash、文件编辑；续跑开启时加入进度工具
    pub fn build_tool_registry(&self, workdir: &Path) -> Result<ToolRegistry, AgentError> {
        let tools = &self.config.tools;
        let validator = CommandValidator::new(&tools.shell)
            .map_err(|e| AgentError::Config(format!("invalid tools.shell pattern: {e}")))?;
        let access = FileAccess::new(&tools.file)
            .map_err(|e| AgentError::Config(format!("invalid tools.file pattern: {e}")))?;

        let mut registry = ToolRegistry::new();
        registry.register(BashTool::new(validator, workdir, tools.timeout, tools.output));
        registry.register(FileEditTool::new(workdir, tools.view_max_lines, access));
        if self.solo {
            registry.register(UpdateTaskProgressTool);
        }
        Ok(registry)
    }

    /// 扩展顺序：工作目录上下文在前，意图守卫在后
    pub fn build_extensions(&self, workdir: &Path) -> ExtensionPipeline {
        ExtensionPipeline::new()
            .with(WorkingDirectoryContext::new(workdir))
            .with(IntentGuard::new(
                self.solo,
                self.config.guard.max_consecutive_nudges,
            ))
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            model: self.model.clone(),
            system_prompt: self.config.app.system_prompt.clone(),
            stream: self.config.llm.stream,
            max_iterations: self.config.guard.max_iterations,
        }
    }

    /// 通过路由表为当前模型构造带重试的适配器
    pub fn route_adapter(&self) -> Result<Arc<dyn ModelAdapter>, AgentError> {
        let llm = &self.config.llm;
        let router = ProviderRouter::new(llm.providers.clone(), llm.retry, llm.request_timeout);
        Ok(router.adapter_for(&self.model)?)
    }

    /// 用给定适配器组装编排器；工具与扩展绑定到会话的工作目录
    pub fn build(
        &self,
        session: Session,
        memory: MemoryStore,
        adapter: Arc<dyn ModelAdapter>,
    ) -> Result<Orchestrator, AgentError> {
        let workdir = session.workdir().to_path_buf();
        let executor = ToolExecutor::new(self.build_tool_registry(&workdir)?, self.config.tools.timeout);
        tracing::info!(
            session = session.id(),
            model = %self.model,
            solo = self.solo,
            tools = ?executor.tool_names(),
            "orchestrator built"
        );
        Orchestrator::new(
            session,
            memory,
            self.session_store(),
            adapter,
            executor,
            self.build_extensions(&workdir),
            self.loop_settings(),
        )
    }
}
