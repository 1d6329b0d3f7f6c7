//! 控制器错误类型定义
//!
//! 错误按处理方式分三类：
//!
//! - **启动期致命**：`Init`，进程以退出码 1 结束
//! - **单帧/单行可恢复**：`CanError::is_recoverable()` / `ChannelError::is_recoverable()`，
//!   由控制循环记录日志后丢弃，不会以 `BlackboxError` 的形式出现
//! - **运行期致命**：其余变体，触发有序关闭，进程以退出码 2 结束

use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::mux::MultiplexError;
use blackbox_can::CanError;
use thiserror::Error;

/// 启动阶段的失败来源
#[derive(Error, Debug)]
pub enum InitError {
    #[error("CAN transport: {0}")]
    Transport(#[source] CanError),

    #[error("analysis channel: {0}")]
    Channel(#[source] ChannelError),

    #[error("decision sink '{name}': {source}")]
    Sink {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Config(#[from] ConfigError),
}

/// 控制器顶层错误类型
#[derive(Error, Debug)]
pub enum BlackboxError {
    /// 启动失败（退出码 1）
    #[error("Initialization failed: {0}")]
    Init(#[from] InitError),

    /// CAN 读写发生不可恢复的错误
    #[error("CAN transport error: {0}")]
    Transport(#[source] CanError),

    /// 分析进程退出、管道断开等
    #[error("Analysis channel error: {0}")]
    Channel(#[source] ChannelError),

    /// 就绪等待失败
    #[error("Readiness wait failed: {0}")]
    Multiplex(#[from] MultiplexError),
}

impl BlackboxError {
    /// 进程退出码：启动失败为 1，运行期致命错误为 2
    pub fn exit_code(&self) -> i32 {
        match self {
            BlackboxError::Init(_) => 1,
            _ => 2,
        }
    }
}
