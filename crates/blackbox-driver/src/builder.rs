//! Builder 模式实现
//!
//! 按配置依次打开 CAN 传输、启动分析进程、组装钩子链，得到可运行的控制器。
//! 任何一步失败都是启动期致命错误（已打开的资源随 Drop 释放）。

use crate::bsp::mock::{MockCamera, MockDisplay, MockVideoRecorder};
use crate::channel::{AnalysisChannel, WorkerLocator};
use crate::config::BlackboxConfig;
use crate::controller::{Controller, ControllerConfig};
use crate::error::{BlackboxError, InitError};
use crate::hooks::{ActuatorSink, LoggingSink, SinkChain};
use crate::mux::PollMultiplexer;
use crate::recording::{RecordingSink, WindowConfig};
use crate::video::VideoSink;
#[cfg(target_os = "linux")]
use blackbox_can::SocketCanTransport;
use tracing::info;

/// 生产环境的控制器类型
#[cfg(target_os = "linux")]
pub type BlackboxController =
    Controller<SocketCanTransport, AnalysisChannel, PollMultiplexer, SinkChain>;

/// 控制器 Builder
///
/// # Example
///
/// ```no_run
/// use blackbox_driver::{BlackboxBuilder, BlackboxConfig};
/// use std::sync::atomic::AtomicBool;
///
/// let mut config = BlackboxConfig::default();
/// config.can.interface = "vcan0".into();
///
/// let mut controller = BlackboxBuilder::new(config).build().unwrap();
/// let shutdown = AtomicBool::new(false);
/// controller.run(&shutdown).unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct BlackboxBuilder {
    config: BlackboxConfig,
}

impl BlackboxBuilder {
    pub fn new(config: BlackboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BlackboxConfig {
        &self.config
    }

    /// 分析进程定位方式（空解释器表示直接执行脚本）
    pub fn worker_locator(&self) -> WorkerLocator {
        let worker = &self.config.worker;
        let interpreter = worker.interpreter.trim();
        WorkerLocator {
            interpreter: (!interpreter.is_empty()).then(|| interpreter.to_string()),
            script: worker.script.clone(),
            levels_up: worker.levels_up,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            command: self.config.worker.command.clone(),
            tick: self.config.cycle.tick(),
        }
    }

    /// 按配置组装钩子链（始终包含日志钩子）
    pub fn build_sinks(&self) -> Result<SinkChain, InitError> {
        let mut sinks = SinkChain::new();
        sinks.add_sink(Box::new(LoggingSink::new()));

        if self.config.actuator.enabled {
            // validate() 保证是 11-bit 标准帧 ID
            let command_id = (self.config.actuator.command_id & 0x7FF) as u16;
            sinks.add_sink(Box::new(ActuatorSink::new(command_id)));
        }

        let rec = &self.config.recording;
        if rec.enabled {
            let window = WindowConfig {
                pre: rec.pre(),
                post: rec.post(),
                retention: rec.retention(),
            };
            let sink = RecordingSink::new(&rec.out_dir, window, rec.queue_capacity)
                .map_err(|source| InitError::Sink {
                    name: "recording",
                    source,
                })?;
            sinks.add_sink(Box::new(sink));
        }

        let video = &self.config.video;
        if video.enabled {
            let sink = VideoSink::new(
                MockCamera::default(),
                MockDisplay::new(),
                MockVideoRecorder::new(),
                &video.out_dir,
                video.post_cycles,
            )
            .map_err(|source| InitError::Sink {
                name: "video",
                source,
            })?;
            sinks.add_sink(Box::new(sink));
        }

        info!("Decision sinks: {}", sinks.names().join(", "));
        Ok(sinks)
    }

    /// 校验配置并打开所有资源
    ///
    /// # 错误
    /// - `BlackboxError::Init`: 配置非法、CAN 接口、分析进程或钩子初始化失败
    #[cfg(target_os = "linux")]
    pub fn build(self) -> Result<BlackboxController, BlackboxError> {
        self.config.validate().map_err(InitError::from)?;

        let transport =
            SocketCanTransport::open(&self.config.can.interface).map_err(InitError::Transport)?;
        info!("CAN interface '{}' ready", transport.interface());

        let channel = AnalysisChannel::open(&self.worker_locator(), self.config.worker.max_line_bytes)
            .map_err(InitError::Channel)?;
        info!("Analysis worker running (pid {})", channel.pid());

        let sinks = self.build_sinks()?;

        Ok(Controller::new(
            transport,
            channel,
            PollMultiplexer::new(),
            sinks,
            self.controller_config(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_worker_locator_from_config() {
        let builder = BlackboxBuilder::default();
        let locator = builder.worker_locator();
        assert_eq!(locator.interpreter.as_deref(), Some("python3"));
        assert_eq!(locator.script, PathBuf::from("ai/vision_server.py"));
        assert_eq!(locator.levels_up, 2);

        let mut config = BlackboxConfig::default();
        config.worker.interpreter = "  ".into();
        assert_eq!(BlackboxBuilder::new(config).worker_locator().interpreter, None);
    }

    #[test]
    fn test_controller_config_from_config() {
        let mut config = BlackboxConfig::default();
        config.cycle.tick_ms = 250;
        let cc = BlackboxBuilder::new(config).controller_config();
        assert_eq!(cc.command, "analyze");
        assert_eq!(cc.tick, Duration::from_millis(250));
    }

    #[test]
    fn test_default_sinks_log_only() {
        let sinks = BlackboxBuilder::default().build_sinks().unwrap();
        assert_eq!(sinks.names(), vec!["log"]);
    }

    #[test]
    fn test_all_sinks_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BlackboxConfig::default();
        config.actuator.enabled = true;
        config.recording.enabled = true;
        config.recording.out_dir = dir.path().join("events");
        config.video.enabled = true;
        config.video.out_dir = dir.path().join("videos");

        let sinks = BlackboxBuilder::new(config).build_sinks().unwrap();
        assert_eq!(sinks.names(), vec!["log", "actuator", "recording", "video"]);
        assert!(dir.path().join("events").is_dir());
        assert!(dir.path().join("videos").is_dir());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_build_rejects_invalid_config() {
        let mut config = BlackboxConfig::default();
        config.cycle.tick_ms = 0;
        let err = BlackboxBuilder::new(config).build().err().unwrap();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_build_fails_on_missing_interface() {
        let mut config = BlackboxConfig::default();
        config.can.interface = "nonexistent9".into();
        let err = BlackboxBuilder::new(config).build().err().unwrap();
        assert!(matches!(err, BlackboxError::Init(InitError::Transport(_))));
        assert_eq!(err.exit_code(), 1);
    }
}
