use std::time::Duration;
use tokio::time::Instant;

/// 假死检测：对比当前时间与最近活动时间。
/// 每次卡死最多触发一次，重新拉起子进程 (arm) 后才会再次武装。
pub struct StalenessGauge {
    threshold: Duration,
    last_activity: Option<Instant>,
    fired: bool,
}

impl StalenessGauge {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_activity: None,
            fired: false,
        }
    }

    /// 子进程开播确认时调用，重新武装检测器
    pub fn arm(&mut self, now: Instant) {
        self.last_activity = Some(now);
        self.fired = false;
    }

    /// 子进程每次进度信号调用
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    /// 会话结束时调用，之后 check 恒为 false
    pub fn disarm(&mut self) {
        self.last_activity = None;
        self.fired = false;
    }

    /// 周期性检查；超时返回 true，且同一次卡死只返回一次
    pub fn check(&mut self, now: Instant) -> bool {
        if self.fired {
            return false;
        }
        let Some(last) = self.last_activity else {
            return false;
        };
        if now.duration_since(last) > self.threshold {
            self.fired = true;
            return true;
        }
        false
    }
}

/// 探测结果累计器：连续失败达到阈值时返回 true 并自行归零
pub struct ProbeLedger {
    threshold: u32,
    consecutive_failures: u32,
}

impl ProbeLedger {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive_failures: 0,
        }
    }

    pub fn record(&mut self, ok: bool) -> bool {
        if ok {
            self.consecutive_failures = 0;
            return false;
        }
        self.consecutive_failures += 1;
        if self.threshold > 0 && self.consecutive_failures >= self.threshold {
            self.consecutive_failures = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}
