use serde::Serialize;
use tokio::time::Instant;

/// 监督器状态机的相位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// 未推流 (初始态，也是显式 stop 后的状态)
    Idle,
    /// 已发起子进程，等待开播确认
    Starting,
    Running,
    /// 故障后等待重试
    Recovering,
    /// 源轮换中，等待重新拉起
    Rotating,
    DegradedStarting,
    DegradedRunning,
    DegradedRecovering,
    /// 降级重试也耗尽，仅响应操作员指令
    Offline,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Recovering => "recovering",
            Phase::Rotating => "rotating",
            Phase::DegradedStarting => "degraded-starting",
            Phase::DegradedRunning => "degraded-running",
            Phase::DegradedRecovering => "degraded-recovering",
            Phase::Offline => "offline",
        }
    }

}

/// 会话可变状态，进程内唯一实例，只由监督器修改
pub struct StreamSession {
    /// 子进程确认开播到确认退出之间为 true
    pub running: bool,
    /// 是否已进入降级 (静态图) 模式
    pub degraded: bool,
    /// 本轮故障内的重试次数，操作员操作或稳定播完后清零
    pub restart_attempts: u32,
    /// 降级模式内的重试次数
    pub degraded_attempts: u32,
    /// 短时间窗口内连续故障计数，仅用于诊断
    pub consecutive_errors: u32,
    /// 最近一次故障时刻 (用于连续错误窗口判定)
    pub last_failure_at: Option<Instant>,
    /// 最近一次子进程进度/开播信号时刻
    pub last_activity_at: Option<Instant>,
}

impl StreamSession {
    pub fn new() -> Self {
        Self {
            running: false,
            degraded: false,
            restart_attempts: 0,
            degraded_attempts: 0,
            consecutive_errors: 0,
            last_failure_at: None,
            last_activity_at: None,
        }
    }

    /// 操作员 start/stop/restart 统一走这里清零
    pub fn reset_counters(&mut self) {
        self.restart_attempts = 0;
        self.degraded_attempts = 0;
        self.consecutive_errors = 0;
        self.last_failure_at = None;
    }

    /// 记录一次故障并维护连续错误窗口
    pub fn note_failure(&mut self, now: Instant, window_ms: u64) {
        match self.last_failure_at {
            Some(prev) if now.duration_since(prev).as_millis() <= window_ms as u128 => {
                self.consecutive_errors += 1;
            }
            _ => self.consecutive_errors = 0,
        }
        self.last_failure_at = Some(now);
    }
}

/// 暴露给控制面的只读快照
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub degraded: bool,
    pub phase: &'static str,
    pub profile_name: String,
    pub profile_index: usize,
    pub profile_total: usize,
    pub endpoint: String,
    pub endpoint_index: usize,
    pub endpoint_total: usize,
    pub source: String,
    pub source_index: usize,
    pub source_total: usize,
    pub restart_attempts: u32,
    pub degraded_attempts: u32,
    pub consecutive_errors: u32,
    pub seconds_since_activity: Option<u64>,
    pub auto_restart: bool,
}
