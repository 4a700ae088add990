//! 协作式取消
//!
//! Ctrl+C / SIGTERM 只取消 CancellationToken；主循环在迭代边界与每次工具执行前后检查该 token，
//! 追加一条中断消息、写入部分轮次的轨迹记录后进入 CANCELLED，不会强行打断正在运行的工具。

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// 取消原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM（批处理容器被回收）
    Signal,
}

/// 取消信号管理器：一个会话一个 token
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 交给主循环的取消 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发取消；只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().cloned()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling session at next safe point");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, cancelling session at next safe point");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}
