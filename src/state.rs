use crate::supervisor::SupervisorHandle;
use std::sync::Arc;
use std::time::Instant;

/// 全局应用上下文
pub struct AppState {
    /// 监督器 mailbox 句柄，控制面所有操作都经它串行下发
    pub supervisor: SupervisorHandle,
    /// 进程启动时间 (用于 /health 的 uptime)
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;
