use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// 子进程事件流。所有事件都带 generation 标记，
/// 监督器据此丢弃已被替换的旧子进程发出的事件
#[derive(Debug)]
pub enum EngineEvent {
    /// 开播确认，附带解析后的完整命令行 (用于日志)
    Started { generation: u64, command: String },
    /// 进度信号
    Progress { generation: u64 },
    /// 异常终止，附带错误信息与退出码
    Failed {
        generation: u64,
        message: String,
        code: Option<i32>,
    },
    /// 正常播放结束
    Exited { generation: u64 },
    /// 探测结果
    ProbeFinished { generation: u64, ok: bool },
}

/// 输入源：远端视频 URL 或内嵌的降级静态图
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Remote(String),
    FallbackStill,
}

/// 一次拉起所需的全部参数，由监督器根据当前轮换位置构造
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub profile_name: String,
    pub source: SourceKind,
    pub input_args: Vec<String>,
    pub output_args: Vec<String>,
    pub destination: String,
    /// 降级模式下单次推流的时长上限
    pub duration_cap_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProbePlan {
    pub destination: String,
    pub duration_secs: u64,
}

/// 监督器持有的子进程句柄，只支持发终止信号与读 PID
pub trait ChildHandle: Send {
    /// 尽力而为地终止子进程，幂等
    fn terminate(&mut self);
    fn id(&self) -> Option<u32>;
}

/// 转码器抽象：测试中用假实现替换
pub trait Engine: Send + Sync {
    fn launch(
        &self,
        plan: LaunchPlan,
        events: mpsc::UnboundedSender<EngineEvent>,
        generation: u64,
    ) -> anyhow::Result<Box<dyn ChildHandle>>;

    fn probe(&self, plan: ProbePlan, events: mpsc::UnboundedSender<EngineEvent>, generation: u64);
}

struct FfmpegChild {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ChildHandle for FfmpegChild {
    fn terminate(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    fn id(&self) -> Option<u32> {
        self.pid
    }
}

pub struct FfmpegEngine {
    binary: String,
    fallback_image: PathBuf,
}

impl FfmpegEngine {
    pub fn new(binary: String) -> anyhow::Result<Self> {
        let fallback_image = materialize_fallback_image()?;
        Ok(Self {
            binary,
            fallback_image,
        })
    }

    fn build_command(&self, plan: &LaunchPlan) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner").arg("-y");
        for arg in &plan.input_args {
            cmd.arg(arg);
        }
        let input: String = match &plan.source {
            SourceKind::Remote(url) => url.clone(),
            SourceKind::FallbackStill => self.fallback_image.to_string_lossy().into_owned(),
        };
        cmd.arg("-i").arg(&input);
        for arg in &plan.output_args {
            cmd.arg(arg);
        }
        if let Some(cap) = plan.duration_cap_secs {
            cmd.arg("-t").arg(cap.to_string());
        }
        cmd.arg(&plan.destination);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

impl Engine for FfmpegEngine {
    /// 拉起 FFmpeg 子进程并接管其事件流
    ///
    /// # 副作用
    /// - 启动子进程
    /// - 派生 stderr 读取任务与退出等待任务
    ///
    /// # 错误处理
    /// - 内存不足时返回错误
    /// - FFmpeg 启动失败时返回错误
    fn launch(
        &self,
        plan: LaunchPlan,
        events: mpsc::UnboundedSender<EngineEvent>,
        generation: u64,
    ) -> anyhow::Result<Box<dyn ChildHandle>> {
        // 1. 检查系统内存是否足够
        match sys_info::mem_info() {
            Ok(mem) => {
                // 可用内存小于 5MB 时拒绝拉起
                if mem.avail < 5120 {
                    return Err(anyhow::anyhow!(
                        "Insufficient system memory ({} KB available)",
                        mem.avail
                    ));
                }
            }
            Err(e) => {
                // 取不到内存信息只告警，不阻断
                warn!("Failed to check memory usage: {}", e);
            }
        }

        // 2. 构建命令并启动子进程
        let mut cmd = self.build_command(&plan);
        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn FFmpeg process: {}", e);
            anyhow::anyhow!("spawn failed: {}", e)
        })?;
        let pid = child.id();
        let command_line = render_command_line(&cmd);
        info!(
            "FFmpeg spawned (pid {:?}) profile [{}] -> {}",
            pid, plan.profile_name, plan.destination
        );

        // 3. stderr 读取任务：进度行转为 Progress 事件，其余行留作错误尾巴
        let error_tail = Arc::new(Mutex::new(VecDeque::<String>::new()));
        if let Some(stderr) = child.stderr.take() {
            let events_rd = events.clone();
            let tail = error_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if is_progress_line(&line) {
                        let _ = events_rd.send(EngineEvent::Progress { generation });
                    } else if !line.trim().is_empty() {
                        debug!("ffmpeg: {}", line);
                        let mut tail = tail.lock().unwrap();
                        if tail.len() >= 5 {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            });
        }

        // 4. 退出等待任务：监督器主动终止时走 kill 分支，不产生事件
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let events_wait = events.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                _ = &mut kill_rx => None,
                status = child.wait() => Some(status),
            };
            match waited {
                // 监督器主动终止，不产生事件
                None => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    debug!("FFmpeg (pid {:?}) terminated by supervisor", pid);
                }
                Some(Ok(status)) if status.success() => {
                    let _ = events_wait.send(EngineEvent::Exited { generation });
                }
                Some(Ok(status)) => {
                    let message = {
                        let tail = error_tail.lock().unwrap();
                        if tail.is_empty() {
                            format!("FFmpeg exited with {}", status)
                        } else {
                            tail.iter().cloned().collect::<Vec<_>>().join(" | ")
                        }
                    };
                    let _ = events_wait.send(EngineEvent::Failed {
                        generation,
                        message,
                        code: status.code(),
                    });
                }
                Some(Err(e)) => {
                    let _ = events_wait.send(EngineEvent::Failed {
                        generation,
                        message: format!("wait failed: {}", e),
                        code: None,
                    });
                }
            }
        });

        // 开播确认：进程成功拉起即视为开播
        let _ = events.send(EngineEvent::Started {
            generation,
            command: command_line,
        });

        Ok(Box::new(FfmpegChild {
            pid,
            kill_tx: Some(kill_tx),
        }))
    }

    /// 短时合成画面试推，验证候选地址可达性
    fn probe(&self, plan: ProbePlan, events: mpsc::UnboundedSender<EngineEvent>, generation: u64) {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner")
            .arg("-f")
            .arg("lavfi")
            .arg("-i")
            .arg("testsrc=size=320x240:rate=15")
            .arg("-f")
            .arg("lavfi")
            .arg("-i")
            .arg("anullsrc")
            .arg("-t")
            .arg(plan.duration_secs.to_string())
            .arg("-c:v")
            .arg("libx264")
            .arg("-preset")
            .arg("ultrafast")
            .arg("-c:a")
            .arg("aac")
            .arg("-f")
            .arg("flv")
            .arg(&plan.destination);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let grace = Duration::from_secs(plan.duration_secs + 10);
        tokio::spawn(async move {
            let ok = match cmd.spawn() {
                Ok(mut child) => match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => status.success(),
                    Ok(Err(_)) => false,
                    Err(_) => {
                        // 超时视为不可达
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        false
                    }
                },
                Err(e) => {
                    warn!("Probe spawn failed: {}", e);
                    false
                }
            };
            let _ = events.send(EngineEvent::ProbeFinished { generation, ok });
        });
    }
}

/// 进度行形如 "frame=  123 fps= 30 ... time=00:00:12.34 ..."
fn is_progress_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("frame=") || trimmed.starts_with("size=") || trimmed.contains("time=")
}

fn render_command_line(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut parts = vec![std_cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(
        std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned()),
    );
    parts.join(" ")
}

/// 将内嵌的降级图片落到临时目录，供 FFmpeg 读取
fn materialize_fallback_image() -> anyhow::Result<PathBuf> {
    let path = std::env::temp_dir().join("loopcast-fallback.png");
    std::fs::write(&path, include_bytes!("../static/fallback.png"))?;
    Ok(path)
}
