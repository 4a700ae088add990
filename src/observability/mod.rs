//! 可观测性：tracing 订阅器初始化
//!
//! 日志写到 stderr，stdout 只留给最终回答。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认级别 info（verbose 时 debug），RUST_LOG 优先
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
