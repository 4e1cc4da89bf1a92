use serde::Deserialize;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub tuning: Tuning,
    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub ffmpeg_binary: String,
    /// 启动后是否自动开播 (部署即推流)
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// 自动开播前的等待时长，留给 HTTP 服务先就绪
    #[serde(default = "default_auto_start_delay")]
    pub auto_start_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            auto_start: true,
            auto_start_delay_ms: default_auto_start_delay(),
        }
    }
}

fn default_auto_start_delay() -> u64 {
    3_000
}

fn default_true() -> bool {
    true
}

/// 推流目标与素材配置
#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    /// 推流密钥，拼接在 endpoint 之后
    pub stream_key: String,
    /// 候选推流地址，按顺序轮换
    pub endpoints: Vec<String>,
    /// 循环播放的视频源，按顺序轮换
    pub sources: Vec<String>,
    /// 编码档位，从高质量到最保守排列 (最后一项用于降级模式)
    #[serde(default = "default_profiles")]
    pub profiles: Vec<Profile>,
    /// 故障分类规则
    #[serde(default)]
    pub failure_rules: FailureRules,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_key: "CHANGE_ME".to_string(),
            endpoints: vec![
                "rtmps://ingest.example.com/live".to_string(),
                "rtmp://ingest.example.com/live".to_string(),
            ],
            sources: vec!["https://media.example.com/loop.mp4".to_string()],
            profiles: default_profiles(),
            failure_rules: FailureRules::default(),
        }
    }
}

/// 编码档位：一组固定的 FFmpeg 输入/输出参数
#[derive(Debug, Deserialize, Clone)]
pub struct Profile {
    pub name: String,
    pub input_args: Vec<String>,
    pub output_args: Vec<String>,
}

fn default_profiles() -> Vec<Profile> {
    let loop_input = [
        "-re",
        "-stream_loop",
        "-1",
        "-fflags",
        "+genpts",
        "-avoid_negative_ts",
        "make_zero",
    ];
    vec![
        Profile {
            name: "High Performance".to_string(),
            input_args: to_args(&loop_input),
            output_args: to_args(&[
                "-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency", "-crf", "22",
                "-maxrate", "3M", "-bufsize", "1M", "-g", "30", "-c:a", "aac", "-b:a", "128k",
                "-f", "flv",
            ]),
        },
        Profile {
            name: "Stable Fallback".to_string(),
            input_args: to_args(&loop_input),
            output_args: to_args(&[
                "-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency", "-crf", "25",
                "-maxrate", "2M", "-bufsize", "1M", "-g", "60", "-c:a", "aac", "-b:a", "96k",
                "-f", "flv",
            ]),
        },
        Profile {
            name: "Ultra Stable".to_string(),
            input_args: to_args(&loop_input),
            output_args: to_args(&[
                "-c:v", "libx264", "-preset", "fast", "-tune", "zerolatency", "-crf", "28",
                "-maxrate", "1M", "-bufsize", "2M", "-g", "120", "-c:a", "aac", "-b:a", "64k",
                "-f", "flv",
            ]),
        },
    ]
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// 连通类故障的判定规则：命中则优先轮换推流地址而不是编码档位
#[derive(Debug, Deserialize, Clone)]
pub struct FailureRules {
    /// 视为连通类故障的子进程退出码
    #[serde(default)]
    pub connectivity_codes: Vec<i32>,
    /// 错误信息中视为连通类故障的关键字 (不区分大小写)
    #[serde(default = "default_connectivity_markers")]
    pub connectivity_markers: Vec<String>,
}

impl Default for FailureRules {
    fn default() -> Self {
        Self {
            connectivity_codes: Vec::new(),
            connectivity_markers: default_connectivity_markers(),
        }
    }
}

fn default_connectivity_markers() -> Vec<String> {
    [
        "connection refused",
        "connection timed out",
        "connection reset",
        "broken pipe",
        "network is unreachable",
        "no route to host",
        "failed to connect",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl FailureRules {
    /// 判断一条故障信息是否属于连通类
    pub fn is_connectivity(&self, message: &str, code: Option<i32>) -> bool {
        if let Some(code) = code {
            if self.connectivity_codes.contains(&code) {
                return true;
            }
        }
        let lower = message.to_lowercase();
        self.connectivity_markers
            .iter()
            .any(|m| lower.contains(&m.to_lowercase()))
    }
}

/// 所有延迟/阈值/上限集中在此，避免散落的魔法数字；
/// 单位统一为毫秒，便于测试注入极短值
#[derive(Debug, Deserialize, Clone)]
pub struct Tuning {
    /// 活性检查周期
    pub liveness_interval_ms: u64,
    /// 超过该时长无任何进度信号视为假死
    pub stale_after_ms: u64,
    /// 普通故障重试前的固定延迟
    pub retry_delay_ms: u64,
    /// 操作员 restart 的 stop→start 间隔
    pub restart_delay_ms: u64,
    /// 源轮换时 teardown→start 间隔
    pub rotate_delay_ms: u64,
    /// 进入降级模式前的延迟
    pub degraded_entry_delay_ms: u64,
    /// 降级模式下的重试延迟
    pub degraded_retry_delay_ms: u64,
    /// 定时源轮换周期
    pub source_rotation_interval_ms: u64,
    /// 连续错误计数的时间窗口
    pub error_window_ms: u64,
    /// 普通模式最大重试次数，超过则进入降级模式
    pub max_restart_attempts: u32,
    /// 降级模式最大重试次数，超过则进入 Offline
    pub max_degraded_attempts: u32,
    /// 降级模式单次推流的时长上限 (秒)
    pub degraded_duration_cap_secs: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            liveness_interval_ms: 5_000,
            stale_after_ms: 30_000,
            retry_delay_ms: 2_000,
            restart_delay_ms: 1_500,
            rotate_delay_ms: 1_000,
            degraded_entry_delay_ms: 3_000,
            degraded_retry_delay_ms: 5_000,
            source_rotation_interval_ms: 300_000,
            error_window_ms: 10_000,
            max_restart_attempts: 10,
            max_degraded_attempts: 6,
            degraded_duration_cap_secs: 3_600,
        }
    }
}

/// 连通性探测配置
#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    pub enabled: bool,
    /// 正式开播前是否先做一次探测
    pub before_start: bool,
    /// 运行期间的周期性探测间隔
    pub interval_ms: u64,
    /// 单次探测推流时长 (秒)
    pub duration_secs: u64,
    /// 连续失败多少次后强制轮换推流地址
    pub failure_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            before_start: false,
            interval_ms: 30_000,
            duration_secs: 3,
            failure_threshold: 3,
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 轮换表不允许为空，空表会让监督器无计划可取
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stream.endpoints.is_empty() {
            anyhow::bail!("stream.endpoints must contain at least one endpoint");
        }
        if self.stream.sources.is_empty() {
            anyhow::bail!("stream.sources must contain at least one source URL");
        }
        if self.stream.profiles.is_empty() {
            anyhow::bail!("stream.profiles must contain at least one profile");
        }
        Ok(())
    }

    /// 配置文件缺失时回退到内置默认值 (部署即可用)
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            warn!("Config file {:?} not found. Using built-in defaults.", path);
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.stream.profiles.len(), 3);
        assert_eq!(cfg.stream.profiles.last().unwrap().name, "Ultra Stable");
        assert_eq!(cfg.tuning.max_restart_attempts, 10);
        assert_eq!(cfg.server.auto_start_delay_ms, 3_000);
        assert!(!cfg.probe.enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_rotation_tables_rejected() {
        let mut cfg = AppConfig::default();
        cfg.stream.sources.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sources"));

        let mut cfg = AppConfig::default();
        cfg.stream.endpoints.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.stream.profiles.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: AppConfig = serde_yaml::from_str(
            r#"
stream:
  stream_key: "abc123"
  endpoints: ["rtmp://a/live", "rtmp://b/live"]
  sources: ["https://example.com/v.mp4"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.stream.stream_key, "abc123");
        assert_eq!(cfg.stream.endpoints.len(), 2);
        assert_eq!(cfg.stream.profiles.len(), 3);
        assert_eq!(cfg.tuning.stale_after_ms, 30_000);
    }

    #[test]
    fn connectivity_classification() {
        let rules = FailureRules::default();
        assert!(rules.is_connectivity("RTMP: Connection refused", None));
        assert!(rules.is_connectivity("av_interleaved_write_frame(): Broken pipe", None));
        assert!(!rules.is_connectivity("Invalid data found when processing input", None));

        let rules = FailureRules {
            connectivity_codes: vec![69],
            connectivity_markers: Vec::new(),
        };
        assert!(rules.is_connectivity("whatever", Some(69)));
        assert!(!rules.is_connectivity("whatever", Some(1)));
    }
}
