//! 控制器配置
//!
//! TOML 配置文件，所有字段都有默认值，缺省的段落和字段使用默认值：
//!
//! ```toml
//! [can]
//! interface = "can0"
//!
//! [worker]
//! interpreter = "python3"          # 为空时直接执行脚本
//! script = "ai/vision_server.py"   # 相对于可执行文件目录向上 levels_up 级
//! levels_up = 2
//! command = "analyze"
//! max_line_bytes = 2048
//!
//! [cycle]
//! tick_ms = 1000
//!
//! [actuator]
//! enabled = false
//! command_id = 0x3A0
//!
//! [recording]
//! enabled = false
//! out_dir = "events"
//! pre_secs = 5.0
//! post_secs = 5.0
//! retention_secs = 60.0
//! queue_capacity = 1024
//!
//! [video]
//! enabled = false
//! out_dir = "videos"
//! post_cycles = 10
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 完整配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlackboxConfig {
    pub can: CanConfig,
    pub worker: WorkerConfig,
    pub cycle: CycleConfig,
    pub actuator: ActuatorConfig,
    pub recording: RecordingConfig,
    pub video: VideoConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CanConfig {
    /// SocketCAN 接口名
    pub interface: String,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
        }
    }
}

/// 分析进程配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// 解释器（为空时直接执行脚本）
    pub interpreter: String,
    /// 脚本路径；相对路径按可执行文件所在目录向上 `levels_up` 级解析，绝对路径原样使用
    pub script: PathBuf,
    pub levels_up: usize,
    /// 每个周期发送的请求命令
    pub command: String,
    /// 单行应答上限（含换行符）
    pub max_line_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            script: PathBuf::from("ai/vision_server.py"),
            levels_up: 2,
            command: "analyze".to_string(),
            max_line_bytes: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CycleConfig {
    /// 就绪等待的心跳间隔（毫秒）
    pub tick_ms: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self { tick_ms: 1000 }
    }
}

impl CycleConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActuatorConfig {
    pub enabled: bool,
    /// 命令帧 ID（标准帧）
    pub command_id: u32,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command_id: 0x3A0,
        }
    }
}

/// 事件窗口录制配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub out_dir: PathBuf,
    /// 触发时刻之前保留的秒数
    pub pre_secs: f64,
    /// 触发时刻之后继续录制的秒数
    pub post_secs: f64,
    /// 环形缓冲保留的最长时间
    pub retention_secs: f64,
    /// 控制循环到录制线程的队列容量
    pub queue_capacity: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            out_dir: PathBuf::from("events"),
            pre_secs: 5.0,
            post_secs: 5.0,
            retention_secs: 60.0,
            queue_capacity: 1024,
        }
    }
}

impl RecordingConfig {
    pub fn pre(&self) -> Duration {
        secs(self.pre_secs)
    }

    pub fn post(&self) -> Duration {
        secs(self.post_secs)
    }

    pub fn retention(&self) -> Duration {
        secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VideoConfig {
    pub enabled: bool,
    pub out_dir: PathBuf,
    /// 危险事件之后继续录像的周期数
    pub post_cycles: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            out_dir: PathBuf::from("videos"),
            post_cycles: 10,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl BlackboxConfig {
    /// 从 TOML 文本解析（不做校验）
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// 读取并解析配置文件（不做校验）
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// 校验字段取值
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.can.interface.trim().is_empty() {
            return Err(invalid("can.interface", "must not be empty"));
        }
        if self.worker.command.trim().is_empty() {
            return Err(invalid("worker.command", "must not be empty"));
        }
        if self.worker.command.contains('\n') {
            return Err(invalid("worker.command", "must be a single line"));
        }
        if self.worker.script.as_os_str().is_empty() {
            return Err(invalid("worker.script", "must not be empty"));
        }
        if self.worker.max_line_bytes < 64 {
            return Err(invalid("worker.max_line_bytes", "must be at least 64"));
        }
        if self.cycle.tick_ms == 0 {
            return Err(invalid("cycle.tick_ms", "must be greater than 0"));
        }
        if self.actuator.command_id > blackbox_protocol::CAN_SFF_MAX_ID {
            return Err(invalid(
                "actuator.command_id",
                format!(
                    "0x{:X} is not a standard 11-bit identifier",
                    self.actuator.command_id
                ),
            ));
        }

        let rec = &self.recording;
        for (field, value) in [
            ("recording.pre_secs", rec.pre_secs),
            ("recording.post_secs", rec.post_secs),
            ("recording.retention_secs", rec.retention_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, format!("{} is not a non-negative number", value)));
            }
        }
        if rec.retention_secs < rec.pre_secs + rec.post_secs {
            return Err(invalid(
                "recording.retention_secs",
                "must cover pre_secs + post_secs",
            ));
        }
        if rec.queue_capacity == 0 {
            return Err(invalid("recording.queue_capacity", "must be greater than 0"));
        }

        Ok(())
    }
}
