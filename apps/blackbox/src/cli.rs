//! 命令行参数
//!
//! 命令行参数覆盖配置文件中的同名字段。

use anyhow::{Context, Result};
use blackbox_driver::BlackboxConfig;
use clap::Parser;
use std::path::PathBuf;

/// 车载黑匣子控制器
///
/// 每个周期向 AI 分析进程发送一次请求，把分析结果与最近的 CAN 帧配对后交给决策钩子
#[derive(Parser, Debug, Default)]
#[command(name = "blackbox")]
#[command(about = "Vehicle blackbox controller - pairs AI analysis with CAN frames", long_about = None)]
#[command(version)]
pub struct Args {
    /// 配置文件路径（TOML）
    ///
    /// 默认: 使用内置默认值
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// SocketCAN 接口名（例如: can0, vcan0）
    #[arg(short, long)]
    pub interface: Option<String>,

    /// 分析脚本路径
    ///
    /// 相对路径按可执行文件所在目录解析（不依赖工作目录）
    #[arg(long)]
    pub worker: Option<PathBuf>,

    /// 分析脚本解释器；传空字符串表示直接执行脚本
    #[arg(long)]
    pub interpreter: Option<String>,

    /// 心跳间隔（毫秒）
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// 启用危险事件录制
    #[arg(long)]
    pub record: bool,

    /// 启用视频叠加与录像
    #[arg(long)]
    pub video: bool,

    /// 启用 CAN 命令回写
    #[arg(long)]
    pub actuate: bool,

    /// 日志文件目录（每日轮转）
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// 打印合并后的配置并退出
    #[arg(long)]
    pub print_config: bool,
}

impl Args {
    /// 读取配置文件（如果指定），应用命令行覆盖，并校验
    pub fn load_config(&self) -> Result<BlackboxConfig> {
        let mut config = match &self.config {
            Some(path) => BlackboxConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BlackboxConfig::default(),
        };
        self.apply(&mut config);
        config.validate().context("validating configuration")?;
        Ok(config)
    }

    /// 把命令行参数写入配置
    pub fn apply(&self, config: &mut BlackboxConfig) {
        if let Some(interface) = &self.interface {
            config.can.interface = interface.clone();
        }
        if let Some(worker) = &self.worker {
            config.worker.script = worker.clone();
        }
        if let Some(interpreter) = &self.interpreter {
            config.worker.interpreter = interpreter.clone();
        }
        if let Some(tick_ms) = self.tick_ms {
            config.cycle.tick_ms = tick_ms;
        }
        // 开关只能打开，关闭以配置文件为准
        config.recording.enabled |= self.record;
        config.video.enabled |= self.video;
        config.actuator.enabled |= self.actuate;
    }
}
