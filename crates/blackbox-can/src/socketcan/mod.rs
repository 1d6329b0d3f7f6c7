//! SocketCAN 传输实现
//!
//! 基于 Linux SocketCAN raw socket。socket 设置为非阻塞，等待可读由上层的 poll 循环负责，
//! 这里的 `try_receive` 只做一次 `recvmsg`。
//!
//! ## 限制
//!
//! - **仅限 Linux 平台**
//! - **接口配置**：波特率等配置由系统工具（`ip link`）完成，不在应用层设置
//! - **权限要求**：可能需要 `dialout` 组权限或 `sudo`

use crate::wire::{self, CAN_FRAME_LEN};
use crate::{CanError, CanFrame, CanTransport};
use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, SockaddrStorage, recvmsg};
use socketcan::{CanSocket, Socket};
use std::io::IoSliceMut;
use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

mod interface_check;

use interface_check::check_interface_status;

/// SocketCAN 传输句柄
///
/// 一个控制器只持有一个实例。`close` 之后所有 I/O 返回 `CanError::Closed`。
///
/// ```no_run
/// use blackbox_can::{CanFrame, CanTransport, SocketCanTransport};
///
/// let mut transport = SocketCanTransport::open("can0").unwrap();
/// transport.send(&CanFrame::new_standard(0x123, &[1, 2, 3])).unwrap();
/// if let Some(frame) = transport.try_receive().unwrap() {
///     println!("{}", frame);
/// }
/// transport.close();
/// ```
#[derive(Debug)]
pub struct SocketCanTransport {
    socket: Option<CanSocket>,
    interface: String,
}

impl SocketCanTransport {
    /// 打开并 bind 到指定接口
    ///
    /// # 错误
    /// - `CanError::Init`: 接口不存在、未 UP、socket 创建或 bind 失败
    pub fn open(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();

        match check_interface_status(&interface)? {
            true => trace!("CAN interface '{}' is UP", interface),
            false => {
                return Err(CanError::Init {
                    reason: format!(
                        "interface exists but is not UP; start it with `sudo ip link set up {}`",
                        interface
                    ),
                    interface,
                });
            },
        }

        let socket = CanSocket::open(&interface).map_err(|e| CanError::Init {
            interface: interface.clone(),
            reason: e.to_string(),
        })?;

        socket.set_nonblocking(true).map_err(|e| CanError::Init {
            interface: interface.clone(),
            reason: format!("failed to set O_NONBLOCK: {}", e),
        })?;

        // 本进程发出的执行器命令不应回环到其它本地 socket
        let loopback_enabled: libc::c_int = 0;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_LOOPBACK,
                &loopback_enabled as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            warn!(
                "Failed to disable CAN_RAW_LOOPBACK on '{}': {}",
                interface,
                std::io::Error::last_os_error()
            );
        }

        debug!("SocketCAN interface '{}' opened (non-blocking)", interface);
        Ok(Self {
            socket: Some(socket),
            interface,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// 供 poll 使用的文件描述符；关闭后返回 `None`
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        // socket 的生命周期不短于 &self
        self.socket
            .as_ref()
            .map(|s| unsafe { BorrowedFd::borrow_raw(s.as_raw_fd()) })
    }

    fn now_us() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

impl CanTransport for SocketCanTransport {
    fn send(&mut self, frame: &CanFrame) -> Result<(), CanError> {
        let socket = self.socket.as_ref().ok_or(CanError::Closed)?;
        let bytes = wire::encode(frame);

        let written = nix::sys::socket::send(socket.as_raw_fd(), &bytes, MsgFlags::empty())
            .map_err(|e| CanError::Write(e.into()))?;
        if written != CAN_FRAME_LEN {
            return Err(CanError::Write(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", written, CAN_FRAME_LEN),
            )));
        }

        trace!("Sent CAN frame: {}", frame);
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<CanFrame>, CanError> {
        let socket = self.socket.as_ref().ok_or(CanError::Closed)?;

        let mut frame_buf = [0u8; CAN_FRAME_LEN];
        let mut iov = [IoSliceMut::new(&mut frame_buf)];
        let received = match recvmsg::<SockaddrStorage>(
            socket.as_raw_fd(),
            &mut iov,
            None,
            MsgFlags::empty(),
        ) {
            Ok(msg) => msg.bytes,
            // EWOULDBLOCK 在 Linux 上等同于 EAGAIN
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(None),
            Err(e) => return Err(CanError::Io(e.into())),
        };

        let frame = wire::decode(&frame_buf[..received])?.with_timestamp(Self::now_us());
        trace!("Received CAN frame: {}", frame);
        Ok(Some(frame))
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("SocketCAN interface '{}' closed", self.interface);
        }
    }

    fn is_closed(&self) -> bool {
        self.socket.is_none()
    }
}

impl Drop for SocketCanTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socketcan::{EmbeddedFrame, StandardId};
    use std::process::Command;
    use std::time::{Duration, Instant};

    fn can_interface_exists(interface: &str) -> bool {
        Command::new("ip")
            .args(["link", "show", interface])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// 宏：要求 vcan0 接口存在，如果不存在则跳过测试
    macro_rules! require_vcan0 {
        () => {{
            if !can_interface_exists("vcan0") {
                eprintln!("Skipping test: vcan0 interface not available");
                return;
            }
            "vcan0"
        }};
    }

    fn receive_within(transport: &mut SocketCanTransport, timeout: Duration) -> Option<CanFrame> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(frame) = transport.try_receive().unwrap() {
                return Some(frame);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_open_invalid_interface() {
        let err = SocketCanTransport::open("nonexistent_can9").unwrap_err();
        match err {
            CanError::Init { interface, .. } => assert_eq!(interface, "nonexistent_can9"),
            other => panic!("Expected Init error, got {:?}", other),
        }
    }

    #[test]
    fn test_open_and_close_is_idempotent() {
        let interface = require_vcan0!();
        let mut transport = SocketCanTransport::open(interface).unwrap();
        assert_eq!(transport.interface(), "vcan0");
        assert!(transport.as_fd().is_some());

        transport.close();
        assert!(transport.is_closed());
        assert!(transport.as_fd().is_none());
        transport.close();
        assert!(transport.is_closed());

        assert!(matches!(transport.try_receive(), Err(CanError::Closed)));
        assert!(matches!(
            transport.send(&CanFrame::new_standard(0x1, &[])),
            Err(CanError::Closed)
        ));
    }

    #[test]
    fn test_try_receive_empty_returns_none() {
        let interface = require_vcan0!();
        let mut transport = SocketCanTransport::open(interface).unwrap();
        // 非阻塞：立即返回
        let start = Instant::now();
        let _ = transport.try_receive().unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_receive_from_peer_socket() {
        let interface = require_vcan0!();
        let mut transport = SocketCanTransport::open(interface).unwrap();
        while transport.try_receive().unwrap().is_some() {}

        let peer = CanSocket::open(interface).unwrap();
        let id = StandardId::new(0x2B0).unwrap();
        let frame = socketcan::CanFrame::new(id, &[0x11, 0x22, 0x33]).unwrap();
        peer.write_frame(&frame).unwrap();

        let received = receive_within(&mut transport, Duration::from_millis(500))
            .expect("frame from peer socket");
        assert_eq!(received.id(), 0x2B0);
        assert_eq!(received.data(), &[0x11, 0x22, 0x33]);
        assert!(received.timestamp_us() > 0);
    }

    #[test]
    fn test_send_standard_and_extended() {
        let interface = require_vcan0!();
        let mut transport = SocketCanTransport::open(interface).unwrap();
        transport
            .send(&CanFrame::new_standard(0x3A0, &[2, 0x12, 0x34]))
            .unwrap();
        transport
            .send(&CanFrame::new_extended(0x18DA_F110, &[]))
            .unwrap();
    }
}
