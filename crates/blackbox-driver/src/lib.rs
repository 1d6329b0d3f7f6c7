//! 黑匣子控制核心
//!
//! 本 crate 提供车载黑匣子的单线程事件核心，包括：
//! - 分析通道：与 AI 分析子进程的行协议（请求一行，结果一行 JSON）
//! - 就绪多路复用：在 CAN 套接字和分析进程输出上等待，带心跳超时
//! - 周期状态机：一次请求、一个分析结果、一帧 CAN 合成一个决策
//! - 决策钩子：日志、CAN 命令回写、事件录制、视频叠加
//!
//! # 使用场景
//!
//! 生产环境通过 [`BlackboxBuilder`] 按配置组装；测试中可以把任意
//! [`CanTransport`](blackbox_can::CanTransport)、[`AnalysisLink`]、
//! [`Multiplexer`] 和 [`DecisionSink`] 交给 [`Controller`]。

pub mod bsp;
mod builder;
pub mod channel;
pub mod config;
pub mod controller;
mod error;
pub mod hooks;
pub mod mux;
pub mod recording;
pub mod video;

#[cfg(target_os = "linux")]
pub use builder::BlackboxController;
pub use builder::BlackboxBuilder;
pub use channel::{AnalysisChannel, AnalysisLink, ChannelError, WorkerLocator};
pub use config::{BlackboxConfig, ConfigError};
pub use controller::{
    Controller, ControllerConfig, CyclePhase, CycleState, CycleStats, StepOutcome,
};
pub use error::{BlackboxError, InitError};
pub use hooks::{ActuatorSink, Commands, Decision, DecisionSink, LoggingSink, SinkChain};
pub use mux::{MultiplexError, Multiplexer, PollMultiplexer, ReadinessSource, ReadySet, Source};
pub use recording::{EventRecorder, RecordingSink, WindowConfig};
pub use video::VideoSink;
