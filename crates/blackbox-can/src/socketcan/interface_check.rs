//! CAN 接口预检查
//!
//! 打开 socket 之前用 `if_nametoindex` + `ioctl(SIOCGIFFLAGS)` 确认接口存在且处于 UP 状态，
//! 这样初始化失败时能给出可操作的提示。只读操作，不需要特殊权限。

use crate::CanError;
use libc::{AF_INET, IFF_UP, SIOCGIFFLAGS, SOCK_DGRAM, if_nametoindex, ifreq};
use std::ffi::CString;
use std::io;
use tracing::trace;

/// `IFNAMSIZ - 1`
const MAX_IFACE_NAME_LEN: usize = 15;

/// 检查接口状态
///
/// # 返回值
/// - `Ok(true)`: 接口存在且 IFF_UP
/// - `Ok(false)`: 接口存在但 DOWN
/// - `Err(CanError::Init)`: 接口名非法、接口不存在或 ioctl 失败
pub(crate) fn check_interface_status(interface: &str) -> Result<bool, CanError> {
    let init_err = |reason: String| CanError::Init {
        interface: interface.to_string(),
        reason,
    };

    if interface.is_empty() || interface.len() > MAX_IFACE_NAME_LEN {
        return Err(init_err(format!(
            "interface name must be 1-{} characters",
            MAX_IFACE_NAME_LEN
        )));
    }

    let c_iface =
        CString::new(interface).map_err(|e| init_err(format!("invalid interface name: {}", e)))?;

    let ifindex = unsafe { if_nametoindex(c_iface.as_ptr()) };
    if ifindex == 0 {
        return Err(init_err(format!(
            "interface does not exist ({}); create it with `sudo ip link add dev {} type can`",
            io::Error::last_os_error(),
            interface
        )));
    }

    let mut ifr: ifreq = unsafe { std::mem::zeroed() };
    let name = c_iface.as_bytes_with_nul();
    // 长度已在上面校验，name.len() <= IFNAMSIZ
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name) {
        *dst = *src as libc::c_char;
    }

    struct FdGuard(libc::c_int);
    impl Drop for FdGuard {
        fn drop(&mut self) {
            if self.0 >= 0 {
                unsafe { libc::close(self.0) };
            }
        }
    }

    let sockfd = unsafe { libc::socket(AF_INET, SOCK_DGRAM, 0) };
    if sockfd < 0 {
        return Err(init_err(format!(
            "socket() for ioctl failed: {}",
            io::Error::last_os_error()
        )));
    }
    let _guard = FdGuard(sockfd);

    let result = unsafe { libc::ioctl(sockfd, SIOCGIFFLAGS, &mut ifr as *mut _ as *mut libc::c_void) };
    if result < 0 {
        return Err(init_err(format!(
            "ioctl(SIOCGIFFLAGS) failed: {}",
            io::Error::last_os_error()
        )));
    }

    // ifru_flags 是 ifr_ifru union 的第一个字段（c_short）
    let flags = unsafe { *(std::ptr::addr_of!(ifr.ifr_ifru) as *const libc::c_short) };
    let is_up = (flags as i32 & IFF_UP) != 0;

    trace!(
        "Interface '{}' status: {}",
        interface,
        if is_up { "UP" } else { "DOWN" }
    );
    Ok(is_up)
}
