//! Bee Code - 工具驱动的编码智能体运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复、循环状态与退出码、会话、取消、构建器
//! - **extensions**: 扩展管线（pre_call / post_call / post_output / post_turn）
//! - **input**: 任务输入解析（文件 / 内联 / 管道）
//! - **llm**: 模型路由与 Bedrock / OpenAI / Google 适配器、重试
//! - **memory**: 对话存储、会话持久化、轨迹记录
//! - **observability**: tracing 初始化
//! - **react**: 主循环、输出解析、意图守卫
//! - **tools**: 命令白名单、bash、文件编辑、进度工具与执行器

pub mod config;
pub mod core;
pub mod extensions;
pub mod input;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
