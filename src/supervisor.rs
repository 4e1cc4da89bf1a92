use crate::config::AppConfig;
use crate::engine::{ChildHandle, Engine, EngineEvent, LaunchPlan, ProbePlan, SourceKind};
use crate::monitor::{ProbeLedger, StalenessGauge};
use crate::rotation::RotationTables;
use crate::session::{Phase, StatusSnapshot, StreamSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// 控制面可下发的指令
pub enum Command {
    Start,
    Stop,
    Restart,
    RotateSource,
    SetAutoRestart(bool),
    Snapshot(oneshot::Sender<StatusSnapshot>),
}

/// 故障分类：连通类优先换推流地址，普通类优先换编码档位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    Connectivity,
    Generic,
}

/// 监督器的外部句柄，所有指令经 mailbox 串行进入事件循环
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SupervisorHandle {
    pub fn start(&self) {
        let _ = self.tx.send(Command::Start);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }

    pub fn restart(&self) {
        let _ = self.tx.send(Command::Restart);
    }

    pub fn rotate_source(&self) {
        let _ = self.tx.send(Command::RotateSource);
    }

    pub fn set_auto_restart(&self, enabled: bool) {
        let _ = self.tx.send(Command::SetAutoRestart(enabled));
    }

    pub async fn snapshot(&self) -> anyhow::Result<StatusSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(tx))
            .map_err(|_| anyhow::anyhow!("Supervisor is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("Supervisor is gone"))
    }
}

/// 推流监督器：唯一会话状态的持有者。
///
/// 子进程事件、定时器回调与控制面指令全部串行经过同一个事件循环，
/// 会话状态不存在并发修改。每次拆除/拉起/停止都会递增 generation，
/// 旧子进程的事件和已排定但未触发的定时器因代数不匹配而被丢弃，
/// 监督器自己发出的终止信号因此天然不会计入故障。
pub struct Supervisor {
    cfg: Arc<AppConfig>,
    engine: Arc<dyn Engine>,
    session: StreamSession,
    phase: Phase,
    tables: RotationTables,
    gauge: StalenessGauge,
    probes: ProbeLedger,
    auto_restart: bool,
    generation: u64,
    child: Option<Box<dyn ChildHandle>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    timer_tx: mpsc::UnboundedSender<u64>,
    /// 开播前探测已发出、等待结果
    awaiting_probe_start: bool,
}

/// 创建监督器并在后台任务中运行其事件循环
pub fn spawn(cfg: Arc<AppConfig>, engine: Arc<dyn Engine>) -> SupervisorHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();

    let supervisor = Supervisor {
        session: StreamSession::new(),
        phase: Phase::Idle,
        tables: RotationTables::new(&cfg.stream),
        gauge: StalenessGauge::new(Duration::from_millis(cfg.tuning.stale_after_ms)),
        probes: ProbeLedger::new(cfg.probe.failure_threshold),
        auto_restart: true,
        generation: 0,
        child: None,
        events_tx,
        timer_tx,
        awaiting_probe_start: false,
        engine,
        cfg,
    };
    tokio::spawn(supervisor.run(cmd_rx, events_rx, timer_rx));
    SupervisorHandle { tx: cmd_tx }
}

impl Supervisor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut events_rx: mpsc::UnboundedReceiver<EngineEvent>,
        mut timer_rx: mpsc::UnboundedReceiver<u64>,
    ) {
        let t = &self.cfg.tuning;
        let mut liveness =
            tokio::time::interval(Duration::from_millis(t.liveness_interval_ms.max(1)));
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // 轮换与探测周期跳过创建时的立即 tick
        let rotation_period = Duration::from_millis(t.source_rotation_interval_ms.max(1));
        let mut rotation =
            tokio::time::interval_at(Instant::now() + rotation_period, rotation_period);
        rotation.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let probe_period = Duration::from_millis(self.cfg.probe.interval_ms.max(1));
        let mut probe_tick = tokio::time::interval_at(Instant::now() + probe_period, probe_period);
        probe_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // 所有句柄都已释放，进程收尾
                    None => {
                        self.teardown_child();
                        break;
                    }
                },
                Some(event) = events_rx.recv() => self.handle_event(event),
                Some(generation) = timer_rx.recv() => self.handle_spawn_timer(generation),
                _ = liveness.tick() => self.on_liveness_tick(),
                _ = rotation.tick() => self.on_rotation_tick(),
                _ = probe_tick.tick() => self.on_probe_tick(),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => self.operator_start(),
            Command::Stop => self.operator_stop(),
            Command::Restart => self.operator_restart(),
            Command::RotateSource => self.rotate_source(true),
            Command::SetAutoRestart(enabled) => self.set_auto_restart(enabled),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // ---- 操作员指令 ----

    fn operator_start(&mut self) {
        if self.session.running {
            info!("Start ignored: stream already running");
            return;
        }
        // 操作员操作清零计数并退出降级/离线状态
        self.session.reset_counters();
        self.session.degraded = false;
        self.probes.reset();

        if self.cfg.probe.enabled && self.cfg.probe.before_start {
            self.teardown_child();
            self.phase = Phase::Starting;
            self.awaiting_probe_start = true;
            info!(
                "Probing endpoint [{}] before start",
                self.tables.current_endpoint()
            );
            self.engine.probe(
                ProbePlan {
                    destination: self.tables.destination(),
                    duration_secs: self.cfg.probe.duration_secs,
                },
                self.events_tx.clone(),
                self.generation,
            );
        } else {
            self.spawn_current();
        }
    }

    fn operator_stop(&mut self) {
        let was_running = self.session.running;
        self.teardown_child();
        self.session.running = false;
        self.session.degraded = false;
        self.session.reset_counters();
        self.session.last_activity_at = None;
        self.gauge.disarm();
        self.probes.reset();
        self.awaiting_probe_start = false;
        self.phase = Phase::Idle;
        if was_running {
            info!("Stream stopped by operator");
        }
    }

    fn operator_restart(&mut self) {
        info!("Operator restart requested");
        self.teardown_child();
        self.session.running = false;
        self.session.degraded = false;
        self.session.reset_counters();
        self.gauge.disarm();
        self.probes.reset();
        self.awaiting_probe_start = false;
        self.phase = Phase::Starting;
        self.schedule_spawn(self.cfg.tuning.restart_delay_ms);
    }

    /// 源轮换：仅在正常运行时有效，降级模式下始终压制
    fn rotate_source(&mut self, manual: bool) {
        if !self.session.running || self.session.degraded {
            if manual {
                warn!("Rotate ignored: stream not running or degraded");
            }
            return;
        }
        self.teardown_child();
        self.session.running = false;
        self.gauge.disarm();
        self.advance_source_and_resume();
    }

    fn advance_source_and_resume(&mut self) {
        self.tables.source.advance();
        info!(
            "Rotating to source {}/{}",
            self.tables.source.index() + 1,
            self.tables.source.len()
        );
        self.phase = Phase::Rotating;
        self.schedule_spawn(self.cfg.tuning.rotate_delay_ms);
    }

    fn set_auto_restart(&mut self, enabled: bool) {
        self.auto_restart = enabled;
        info!(
            "Auto-restart {}",
            if enabled { "enabled" } else { "disabled" }
        );
        // 关闭时撤销已排定但尚未触发的重试 (代数失配即作废)
        if !enabled
            && self.child.is_none()
            && matches!(
                self.phase,
                Phase::Recovering | Phase::Rotating | Phase::DegradedRecovering
            )
        {
            self.generation += 1;
            self.phase = Phase::Idle;
        }
    }

    // ---- 子进程事件 ----

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Started {
                generation,
                command,
            } if generation == self.generation => {
                let now = Instant::now();
                self.session.running = true;
                self.session.last_activity_at = Some(now);
                self.gauge.arm(now);
                self.phase = if self.session.degraded {
                    Phase::DegradedRunning
                } else {
                    Phase::Running
                };
                info!("Stream started: {}", command);
            }
            EngineEvent::Progress { generation } if generation == self.generation => {
                let now = Instant::now();
                self.session.last_activity_at = Some(now);
                self.gauge.touch(now);
            }
            EngineEvent::Failed {
                generation,
                message,
                code,
            } if generation == self.generation => {
                let class = if self
                    .cfg
                    .stream
                    .failure_rules
                    .is_connectivity(&message, code)
                {
                    FailureClass::Connectivity
                } else {
                    FailureClass::Generic
                };
                warn!("Stream error ({:?}, code {:?}): {}", class, code, message);
                self.handle_failure(class, &message);
            }
            EngineEvent::Exited { generation } if generation == self.generation => {
                self.handle_clean_exit();
            }
            EngineEvent::ProbeFinished { generation, ok } => self.handle_probe(generation, ok),
            // 已被替换的子进程发出的事件 (包括监督器自己终止的那些)
            other => debug!("Stale engine event ignored: {:?}", other),
        }
    }

    /// 中央故障处理：spawn 失败、运行期错误、假死超时、探测超限都汇聚到这里
    fn handle_failure(&mut self, class: FailureClass, context: &str) {
        self.teardown_child();
        self.session.running = false;
        self.gauge.disarm();
        self.awaiting_probe_start = false;
        self.session
            .note_failure(Instant::now(), self.cfg.tuning.error_window_ms);

        if !self.auto_restart {
            warn!(
                "Failure with auto-restart disabled, no action taken: {}",
                context
            );
            self.phase = Phase::Idle;
            return;
        }

        if self.session.degraded {
            self.degraded_failure(context);
            return;
        }

        let max = self.cfg.tuning.max_restart_attempts;
        if self.session.restart_attempts < max {
            self.session.restart_attempts += 1;
            match class {
                FailureClass::Connectivity => {
                    // 连通类故障直接换地址，跳过档位轮换
                    self.tables.endpoint.advance();
                }
                FailureClass::Generic => {
                    // 同一地址先试遍所有档位，档位绕回一圈才换地址
                    if self.tables.profile.advance() {
                        self.tables.endpoint.advance();
                    }
                }
            }
            warn!(
                "Recovering (attempt {}/{}) profile [{}] endpoint [{}] errors_in_window {}: {}",
                self.session.restart_attempts,
                max,
                self.tables.current_profile().name,
                self.tables.current_endpoint(),
                self.session.consecutive_errors,
                context
            );
            self.phase = Phase::Recovering;
            self.schedule_spawn(self.cfg.tuning.retry_delay_ms);
        } else {
            error!(
                "Max restart attempts ({}) exhausted. Entering degraded mode with fallback image.",
                max
            );
            self.session.degraded = true;
            self.phase = Phase::DegradedRecovering;
            self.schedule_spawn(self.cfg.tuning.degraded_entry_delay_ms);
        }
    }

    fn degraded_failure(&mut self, context: &str) {
        let max = self.cfg.tuning.max_degraded_attempts;
        if self.session.degraded_attempts < max {
            self.session.degraded_attempts += 1;
            self.tables.endpoint.advance();
            warn!(
                "Degraded stream failure ({}/{}), rotating endpoint to [{}]: {}",
                self.session.degraded_attempts,
                max,
                self.tables.current_endpoint(),
                context
            );
            self.phase = Phase::DegradedRecovering;
            self.schedule_spawn(self.cfg.tuning.degraded_retry_delay_ms);
        } else {
            // 不再自动重试；控制面保持存活等待人工恢复
            error!(
                "Degraded attempts ({}) exhausted. Stream offline until manual start/restart.",
                max
            );
            self.phase = Phase::Offline;
        }
    }

    fn handle_clean_exit(&mut self) {
        self.child = None;
        self.session.running = false;
        self.gauge.disarm();

        if !self.auto_restart {
            info!("Stream ended with auto-restart disabled");
            self.phase = Phase::Idle;
            return;
        }

        if self.session.degraded {
            // 降级推流到达时长上限，继续循环
            debug!("Degraded push reached duration cap, relooping");
            self.phase = Phase::DegradedRecovering;
            self.schedule_spawn(self.cfg.tuning.degraded_retry_delay_ms);
        } else {
            // 自然播完视为一次隐式源轮换；稳定播完重置重试计数
            info!("Source playback completed");
            self.session.restart_attempts = 0;
            self.advance_source_and_resume();
        }
    }

    fn handle_probe(&mut self, generation: u64, ok: bool) {
        if generation != self.generation {
            debug!("Stale probe result ignored");
            return;
        }
        if self.awaiting_probe_start {
            self.awaiting_probe_start = false;
            if ok {
                self.spawn_current();
            } else {
                warn!(
                    "Pre-start probe failed for [{}]",
                    self.tables.current_endpoint()
                );
                self.handle_failure(FailureClass::Connectivity, "pre-start probe failure");
            }
            return;
        }
        if self.probes.record(ok) && self.auto_restart {
            warn!(
                "Probe failure threshold reached for [{}], forcing endpoint rotation",
                self.tables.current_endpoint()
            );
            self.handle_failure(FailureClass::Connectivity, "probe failure threshold");
        }
    }

    // ---- 定时器 ----

    fn schedule_spawn(&self, delay_ms: u64) {
        let generation = self.generation;
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(generation);
        });
    }

    fn handle_spawn_timer(&mut self, generation: u64) {
        // stop/新一轮拉起会递增代数，迟到的定时器在此作废
        if generation != self.generation {
            debug!(
                "Stale spawn timer ignored (gen {} != {})",
                generation, self.generation
            );
            return;
        }
        self.spawn_current();
    }

    fn on_liveness_tick(&mut self) {
        if !self.session.running {
            return;
        }
        let now = Instant::now();
        if self.gauge.check(now) {
            warn!(
                "No subprocess activity for {}s, treating as failure",
                self.session
                    .last_activity_at
                    .map(|t| now.duration_since(t).as_secs())
                    .unwrap_or(0)
            );
            self.handle_failure(FailureClass::Generic, "activity-timeout");
        }
    }

    fn on_rotation_tick(&mut self) {
        if self.phase == Phase::Running && !self.session.degraded && self.auto_restart {
            info!("Scheduled source rotation");
            self.rotate_source(false);
        }
    }

    fn on_probe_tick(&mut self) {
        if !self.cfg.probe.enabled || self.phase != Phase::Running {
            return;
        }
        self.engine.probe(
            ProbePlan {
                destination: self.tables.destination(),
                duration_secs: self.cfg.probe.duration_secs,
            },
            self.events_tx.clone(),
            self.generation,
        );
    }

    // ---- 拉起与拆除 ----

    /// 根据当前轮换位置 (或降级模式) 拉起子进程
    fn spawn_current(&mut self) {
        self.teardown_child();
        self.generation += 1;

        let plan = if self.session.degraded {
            let profile = self.tables.conservative_profile();
            LaunchPlan {
                profile_name: profile.name.clone(),
                source: SourceKind::FallbackStill,
                input_args: vec!["-loop".to_string(), "1".to_string(), "-re".to_string()],
                output_args: profile.output_args.clone(),
                destination: self.tables.destination(),
                duration_cap_secs: Some(self.cfg.tuning.degraded_duration_cap_secs),
            }
        } else {
            let profile = self.tables.current_profile();
            LaunchPlan {
                profile_name: profile.name.clone(),
                source: SourceKind::Remote(self.tables.current_source().to_string()),
                input_args: profile.input_args.clone(),
                output_args: profile.output_args.clone(),
                destination: self.tables.destination(),
                duration_cap_secs: None,
            }
        };
        self.phase = if self.session.degraded {
            Phase::DegradedStarting
        } else {
            Phase::Starting
        };

        match self
            .engine
            .launch(plan, self.events_tx.clone(), self.generation)
        {
            Ok(handle) => self.child = Some(handle),
            Err(e) => {
                // 根本没拉起来，与运行期故障同路处理
                error!("Spawn failure: {}", e);
                self.handle_failure(FailureClass::Generic, &format!("spawn failure: {}", e));
            }
        }
    }

    /// 终止并清空当前子进程；递增代数使其残余事件全部作废
    fn teardown_child(&mut self) {
        self.generation += 1;
        if let Some(mut child) = self.child.take() {
            debug!("Terminating subprocess (pid {:?})", child.id());
            child.terminate();
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let now = Instant::now();
        let profile = if self.session.degraded {
            self.tables.conservative_profile()
        } else {
            self.tables.current_profile()
        };
        StatusSnapshot {
            running: self.session.running,
            degraded: self.session.degraded,
            phase: self.phase.name(),
            profile_name: profile.name.clone(),
            profile_index: self.tables.profile.index(),
            profile_total: self.tables.profile.len(),
            endpoint: self.tables.current_endpoint().to_string(),
            endpoint_index: self.tables.endpoint.index(),
            endpoint_total: self.tables.endpoint.len(),
            source: self.tables.current_source().to_string(),
            source_index: self.tables.source.index(),
            source_total: self.tables.source.len(),
            restart_attempts: self.session.restart_attempts,
            degraded_attempts: self.session.degraded_attempts,
            consecutive_errors: self.session.consecutive_errors,
            seconds_since_activity: self
                .session
                .last_activity_at
                .map(|t| now.duration_since(t).as_secs()),
            auto_restart: self.auto_restart,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[derive(Clone)]
    struct RecordedLaunch {
        plan: LaunchPlan,
        generation: u64,
        events: mpsc::UnboundedSender<EngineEvent>,
    }

    #[derive(Clone)]
    struct RecordedProbe {
        generation: u64,
        events: mpsc::UnboundedSender<EngineEvent>,
    }

    struct FakeChild;

    impl ChildHandle for FakeChild {
        fn terminate(&mut self) {}
        fn id(&self) -> Option<u32> {
            None
        }
    }

    /// 记录所有拉起与探测请求，由测试注入子进程事件
    #[derive(Default)]
    struct FakeEngine {
        launches: std::sync::Mutex<Vec<RecordedLaunch>>,
        probes: std::sync::Mutex<Vec<RecordedProbe>>,
    }

    impl Engine for FakeEngine {
        fn launch(
            &self,
            plan: LaunchPlan,
            events: mpsc::UnboundedSender<EngineEvent>,
            generation: u64,
        ) -> anyhow::Result<Box<dyn ChildHandle>> {
            self.launches.lock().unwrap().push(RecordedLaunch {
                plan,
                generation,
                events,
            });
            Ok(Box::new(FakeChild))
        }

        fn probe(
            &self,
            _plan: ProbePlan,
            events: mpsc::UnboundedSender<EngineEvent>,
            generation: u64,
        ) {
            self.probes
                .lock()
                .unwrap()
                .push(RecordedProbe { generation, events });
        }
    }

    struct Rig {
        handle: SupervisorHandle,
        engine: Arc<FakeEngine>,
    }

    impl Rig {
        fn new(cfg: AppConfig) -> Self {
            let engine = Arc::new(FakeEngine::default());
            let handle = spawn(Arc::new(cfg), engine.clone());
            Self { handle, engine }
        }

        fn launches(&self) -> usize {
            self.engine.launches.lock().unwrap().len()
        }

        fn last(&self) -> RecordedLaunch {
            self.engine
                .launches
                .lock()
                .unwrap()
                .last()
                .expect("no launch recorded")
                .clone()
        }

        async fn settle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        async fn start_and_confirm(&self) {
            self.handle.start();
            Self::settle().await;
            let l = self.last();
            let _ = l.events.send(EngineEvent::Started {
                generation: l.generation,
                command: "ffmpeg -i ...".to_string(),
            });
            Self::settle().await;
        }

        async fn fail_last(&self, message: &str) {
            let l = self.last();
            let _ = l.events.send(EngineEvent::Failed {
                generation: l.generation,
                message: message.to_string(),
                code: None,
            });
            Self::settle().await;
        }

        async fn snap(&self) -> StatusSnapshot {
            self.handle.snapshot().await.unwrap()
        }
    }

    async fn wait(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn test_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.stream.stream_key = "key".to_string();
        cfg.stream.endpoints = vec![
            "rtmp://e0/live".to_string(),
            "rtmp://e1/live".to_string(),
            "rtmp://e2/live".to_string(),
        ];
        cfg.stream.sources = vec![
            "https://cdn.example.com/v0.mp4".to_string(),
            "https://cdn.example.com/v1.mp4".to_string(),
        ];
        cfg.tuning.liveness_interval_ms = 50;
        cfg.tuning.retry_delay_ms = 100;
        cfg.tuning.restart_delay_ms = 100;
        cfg.tuning.rotate_delay_ms = 100;
        cfg.tuning.degraded_entry_delay_ms = 100;
        cfg.tuning.degraded_retry_delay_ms = 100;
        cfg.tuning.source_rotation_interval_ms = 3_600_000;
        cfg
    }

    #[tokio::test(start_paused = true)]
    async fn start_confirms_and_ignores_duplicate_start() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;

        let s = rig.snap().await;
        assert!(s.running);
        assert_eq!(s.phase, "running");
        assert_eq!(rig.last().plan.destination, "rtmp://e0/live/key");

        rig.handle.start();
        Rig::settle().await;
        assert_eq!(rig.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn profiles_cycle_before_endpoint_advances() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;

        rig.fail_last("demuxer error").await;
        wait(120).await;
        let s = rig.snap().await;
        assert_eq!((s.profile_index, s.endpoint_index), (1, 0));

        rig.fail_last("demuxer error").await;
        wait(120).await;
        let s = rig.snap().await;
        assert_eq!((s.profile_index, s.endpoint_index), (2, 0));

        // 档位绕回一圈，地址才前进
        rig.fail_last("demuxer error").await;
        wait(120).await;
        let s = rig.snap().await;
        assert_eq!((s.profile_index, s.endpoint_index), (0, 1));
        assert_eq!(s.restart_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_failure_advances_endpoint_only() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;

        rig.fail_last("RTMP handshake: Connection refused").await;
        wait(120).await;

        let s = rig.snap().await;
        assert_eq!(s.endpoint_index, 1);
        assert_eq!(s.profile_index, 0);
        assert_eq!(s.restart_attempts, 1);
        assert_eq!(rig.launches(), 2);
        assert_eq!(rig.last().plan.destination, "rtmp://e1/live/key");
    }

    #[tokio::test(start_paused = true)]
    async fn escalates_to_degraded_after_max_attempts() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;

        for n in 1..=10u32 {
            rig.fail_last("codec error").await;
            wait(120).await;
            let s = rig.snap().await;
            assert_eq!(s.restart_attempts, n);
            assert!(!s.degraded, "not degraded after failure {}", n);
        }

        // 第 11 次故障触发降级
        rig.fail_last("codec error").await;
        wait(120).await;
        let s = rig.snap().await;
        assert!(s.degraded);
        assert_eq!(s.restart_attempts, 10);
        assert_eq!(s.phase, "degraded-starting");

        let plan = rig.last().plan;
        assert_eq!(plan.source, SourceKind::FallbackStill);
        assert_eq!(plan.profile_name, "Ultra Stable");
        assert!(plan.duration_cap_secs.is_some());
        assert_eq!(rig.launches(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_resets_everything_from_degraded() {
        let mut cfg = test_config();
        cfg.tuning.max_restart_attempts = 1;
        let rig = Rig::new(cfg);
        rig.start_and_confirm().await;

        rig.fail_last("codec error").await;
        wait(120).await;
        rig.fail_last("codec error").await;
        wait(120).await;

        // 确认降级子进程开播
        let l = rig.last();
        let _ = l.events.send(EngineEvent::Started {
            generation: l.generation,
            command: "ffmpeg".to_string(),
        });
        Rig::settle().await;
        let s = rig.snap().await;
        assert!(s.degraded && s.running);
        assert_eq!(s.phase, "degraded-running");

        // 降级模式下源轮换被压制
        rig.handle.rotate_source();
        Rig::settle().await;
        assert_eq!(rig.launches(), 3);
        assert_eq!(rig.snap().await.source_index, 0);

        rig.handle.stop();
        Rig::settle().await;
        let s = rig.snap().await;
        assert!(!s.running);
        assert!(!s.degraded);
        assert_eq!(s.restart_attempts, 0);
        assert_eq!(s.degraded_attempts, 0);
        assert_eq!(s.phase, "idle");

        // stop 之后不会有任何残留定时器再拉起子进程
        wait(2_000).await;
        assert_eq!(rig.launches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_activity_timestamp() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;
        wait(1_000).await;
        assert!(rig.snap().await.seconds_since_activity.is_some());

        rig.handle.stop();
        Rig::settle().await;
        // 空闲态不应继续报告上一轮会话的活性时刻
        assert!(rig.snap().await.seconds_since_activity.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_exhaustion_goes_offline_until_operator_start() {
        let mut cfg = test_config();
        cfg.tuning.max_restart_attempts = 1;
        cfg.tuning.max_degraded_attempts = 2;
        let rig = Rig::new(cfg);
        rig.start_and_confirm().await;

        rig.fail_last("codec error").await; // attempt 1
        wait(120).await;
        rig.fail_last("codec error").await; // 触发降级
        wait(120).await;
        rig.fail_last("codec error").await; // degraded attempt 1
        wait(120).await;
        rig.fail_last("codec error").await; // degraded attempt 2
        wait(120).await;
        rig.fail_last("codec error").await; // 降级重试耗尽
        wait(2_000).await;

        let s = rig.snap().await;
        assert_eq!(s.phase, "offline");
        assert_eq!(s.degraded_attempts, 2);
        assert_eq!(rig.launches(), 5);

        // 只有操作员能离开 Offline
        rig.handle.start();
        Rig::settle().await;
        assert_eq!(rig.launches(), 6);
        let s = rig.snap().await;
        assert!(!s.degraded);
        assert_eq!(s.phase, "starting");
        assert!(matches!(rig.last().plan.source, SourceKind::Remote(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_timeout_fires_exactly_once_per_stall() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;

        // 31 秒无任何进度信号
        wait(31_000).await;
        assert_eq!(rig.launches(), 2);
        let s = rig.snap().await;
        assert_eq!(s.restart_attempts, 1);

        // 同一次卡死不会在后续 tick 里重复计为故障
        wait(10_000).await;
        assert_eq!(rig.launches(), 2);
        assert_eq!(rig.snap().await.restart_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_defers_liveness_timeout() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;
        let l = rig.last();

        // 每 20 秒一个进度信号，永远到不了 30 秒阈值
        for _ in 0..3 {
            wait(20_000).await;
            let _ = l.events.send(EngineEvent::Progress {
                generation: l.generation,
            });
            Rig::settle().await;
        }
        assert_eq!(rig.launches(), 1);
        assert!(rig.snap().await.running);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_restart_off_reports_but_schedules_nothing() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;

        rig.handle.set_auto_restart(false);
        Rig::settle().await;
        rig.fail_last("codec error").await;

        let s = rig.snap().await;
        assert!(!s.running);
        assert!(!s.auto_restart);
        assert_eq!(s.phase, "idle");

        // 足够宽裕的窗口内没有任何重试
        wait(5_000).await;
        assert_eq!(rig.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_exit_rotates_source_without_counting_failure() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;

        let l = rig.last();
        let _ = l.events.send(EngineEvent::Exited {
            generation: l.generation,
        });
        Rig::settle().await;
        wait(120).await;

        assert_eq!(rig.launches(), 2);
        let s = rig.snap().await;
        assert_eq!(s.source_index, 1);
        assert_eq!(s.restart_attempts, 0);
        assert_eq!(
            rig.last().plan.source,
            SourceKind::Remote("https://cdn.example.com/v1.mp4".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_rotation_cycles_source() {
        let mut cfg = test_config();
        cfg.tuning.source_rotation_interval_ms = 10_000;
        let rig = Rig::new(cfg);
        rig.start_and_confirm().await;

        wait(10_500).await;
        assert_eq!(rig.launches(), 2);
        assert_eq!(rig.snap().await.source_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_rotate_advances_source() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;

        rig.handle.rotate_source();
        Rig::settle().await;
        wait(120).await;

        assert_eq!(rig.launches(), 2);
        let s = rig.snap().await;
        assert_eq!(s.source_index, 1);
        assert_eq!(s.restart_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resets_counters_and_respawns_after_delay() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;

        rig.fail_last("codec error").await;
        wait(120).await;
        assert_eq!(rig.snap().await.restart_attempts, 1);

        rig.handle.restart();
        Rig::settle().await;
        assert_eq!(rig.snap().await.restart_attempts, 0);
        wait(150).await;
        assert_eq!(rig.launches(), 3);

        let l = rig.last();
        let _ = l.events.send(EngineEvent::Started {
            generation: l.generation,
            command: "ffmpeg".to_string(),
        });
        Rig::settle().await;
        assert!(rig.snap().await.running);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_threshold_forces_endpoint_rotation() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;
        let l = rig.last();

        for _ in 0..3 {
            let _ = l.events.send(EngineEvent::ProbeFinished {
                generation: l.generation,
                ok: false,
            });
            Rig::settle().await;
        }
        wait(120).await;

        assert_eq!(rig.launches(), 2);
        let s = rig.snap().await;
        assert_eq!(s.endpoint_index, 1);
        assert_eq!(s.profile_index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_start_probe_gates_spawn() {
        let mut cfg = test_config();
        cfg.probe.enabled = true;
        cfg.probe.before_start = true;
        let rig = Rig::new(cfg);

        rig.handle.start();
        Rig::settle().await;
        // 探测完成前不拉起子进程
        assert_eq!(rig.launches(), 0);

        let probe = rig.engine.probes.lock().unwrap().last().unwrap().clone();
        let _ = probe.events.send(EngineEvent::ProbeFinished {
            generation: probe.generation,
            ok: true,
        });
        Rig::settle().await;
        assert_eq!(rig.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_child_events_are_ignored_after_stop() {
        let rig = Rig::new(test_config());
        rig.start_and_confirm().await;
        let l = rig.last();

        rig.handle.stop();
        Rig::settle().await;

        // 旧子进程的崩溃事件迟到，不得复活会话
        let _ = l.events.send(EngineEvent::Failed {
            generation: l.generation,
            message: "killed".to_string(),
            code: Some(1),
        });
        wait(2_000).await;

        assert_eq!(rig.launches(), 1);
        let s = rig.snap().await;
        assert!(!s.running);
        assert_eq!(s.restart_attempts, 0);
    }
}
