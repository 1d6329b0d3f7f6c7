//! # Blackbox CAN Transport
//!
//! CAN 传输适配层：一个进程只持有一个传输句柄，由控制器显式拥有（没有全局 socket）。
//!
//! - `init`: [`SocketCanTransport::open`]（Linux）
//! - `send`: [`CanTransport::send`]
//! - `receive`: [`CanTransport::try_receive`]（非阻塞：`Ok(None)` 表示当前没有帧）
//! - `close`: [`CanTransport::close`]（幂等）

use thiserror::Error;

pub use blackbox_protocol::CanFrame;

pub mod wire;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanTransport;

/// CAN 传输层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    /// 创建 socket、查找接口或 bind 失败
    #[error("Failed to initialize CAN interface '{interface}': {reason}")]
    Init { interface: String, reason: String },

    /// 读 socket 失败（EAGAIN 除外）
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// 写 socket 失败或写入不完整
    #[error("CAN write failed: {0}")]
    Write(#[source] std::io::Error),

    /// 收到的字节数少于 `struct can_frame` 的固定长度
    #[error("Truncated CAN frame: {received} bytes (expected {expected})")]
    Truncated { received: usize, expected: usize },

    /// 错误帧、远程帧或 DLC 非法
    #[error("Invalid CAN frame: {0}")]
    InvalidFrame(String),

    /// 句柄已关闭
    #[error("Transport closed")]
    Closed,
}

impl CanError {
    /// 单帧级别的错误：记录日志、丢弃该帧，循环继续
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CanError::Truncated { .. } | CanError::InvalidFrame(_))
    }
}

/// CAN 传输接口
///
/// 所有方法都是非阻塞的；等待可读由上层的就绪多路复用器负责。
pub trait CanTransport {
    /// 发送一帧
    ///
    /// # 错误
    /// - `CanError::Write`: 写入失败或写入不完整
    /// - `CanError::Closed`: 句柄已关闭
    fn send(&mut self, frame: &CanFrame) -> Result<(), CanError>;

    /// 非阻塞接收
    ///
    /// # 返回值
    /// - `Ok(Some(frame))`: 收到一帧
    /// - `Ok(None)`: 当前没有排队的帧（would block）
    /// - `Err(_)`: 其它读错误，包括截断帧
    fn try_receive(&mut self) -> Result<Option<CanFrame>, CanError>;

    /// 关闭句柄；对已关闭的句柄是空操作
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}
