//! 就绪多路复用器（Readiness Multiplexer）
//!
//! 控制线程唯一的挂起点：阻塞直到分析通道或 CAN 传输可读，或超时。
//! 超时返回空的 [`ReadySet`]，是正常的心跳结果。

use crate::channel::AnalysisChannel;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::BorrowedFd;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// 就绪等待错误（均为致命错误）
#[derive(Error, Debug)]
pub enum MultiplexError {
    /// 等待被信号打断
    #[error("Readiness wait interrupted by signal")]
    Interrupted,

    /// poll(2) 失败
    #[error("poll(2) failed: {0}")]
    Poll(#[source] Errno),

    /// 没有任何可等待的文件描述符
    #[error("No readiness sources to wait on")]
    NoSources,
}

/// 就绪源的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Channel,
    Transport,
}

/// 一次等待返回的就绪集合
///
/// 处理顺序固定：先分析通道，再 CAN 传输。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadySet {
    pub channel: bool,
    pub transport: bool,
}

impl ReadySet {
    pub const NONE: ReadySet = ReadySet {
        channel: false,
        transport: false,
    };

    pub const fn channel() -> Self {
        Self {
            channel: true,
            transport: false,
        }
    }

    pub const fn transport() -> Self {
        Self {
            channel: false,
            transport: true,
        }
    }

    pub const fn both() -> Self {
        Self {
            channel: true,
            transport: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.channel && !self.transport
    }

    fn mark(&mut self, source: Source) {
        match source {
            Source::Channel => self.channel = true,
            Source::Transport => self.transport = true,
        }
    }
}

/// 能提供可等待文件描述符的资源
pub trait ReadinessSource {
    /// 关闭后返回 `None`
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>>;
}

impl ReadinessSource for AnalysisChannel {
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        self.as_fd()
    }
}

#[cfg(target_os = "linux")]
impl ReadinessSource for blackbox_can::SocketCanTransport {
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        self.as_fd()
    }
}

/// 就绪等待接口
pub trait Multiplexer {
    /// 阻塞直到至少一个源可读或超时
    fn wait(
        &mut self,
        sources: &[(Source, Option<BorrowedFd<'_>>)],
        timeout: Duration,
    ) -> Result<ReadySet, MultiplexError>;
}

/// 基于 `poll(2)` 的实现
///
/// `POLLHUP`/`POLLERR` 也视为可读，让后续的读操作暴露对端关闭或 socket 错误。
#[derive(Debug, Default)]
pub struct PollMultiplexer;

impl PollMultiplexer {
    pub fn new() -> Self {
        Self
    }
}

impl Multiplexer for PollMultiplexer {
    fn wait(
        &mut self,
        sources: &[(Source, Option<BorrowedFd<'_>>)],
        timeout: Duration,
    ) -> Result<ReadySet, MultiplexError> {
        let mut kinds = Vec::with_capacity(sources.len());
        let mut fds = Vec::with_capacity(sources.len());
        for (kind, fd) in sources {
            if let Some(fd) = fd {
                kinds.push(*kind);
                fds.push(PollFd::new(*fd, PollFlags::POLLIN));
            }
        }
        if fds.is_empty() {
            return Err(MultiplexError::NoSources);
        }

        // PollTimeout 以 u16 毫秒表示，超过 65535ms 的心跳会被截断
        let timeout_ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        let ready = match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Err(MultiplexError::Interrupted),
            Err(e) => return Err(MultiplexError::Poll(e)),
        };

        let mut set = ReadySet::NONE;
        if ready > 0 {
            let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            for (kind, pfd) in kinds.iter().zip(&fds) {
                if pfd.revents().is_some_and(|r| r.intersects(readable)) {
                    set.mark(*kind);
                }
            }
        }

        trace!("poll returned {:?}", set);
        Ok(set)
    }
}
