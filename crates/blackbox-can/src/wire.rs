//! `struct can_frame` 线格式编解码
//!
//! Linux 内核的经典 CAN 帧布局（16 字节，主机字节序）：
//!
//! ```text
//! [0..4]   can_id  (bit 31: EFF, bit 30: RTR, bit 29: ERR)
//! [4]      can_dlc (0-8)
//! [5..8]   padding / reserved
//! [8..16]  data[8]
//! ```
//!
//! 独立于 socket 实现，便于在非 Linux 平台上测试。

use crate::CanError;
use blackbox_protocol::{CAN_MAX_DLC, CanFrame};

/// `sizeof(struct can_frame)`
pub const CAN_FRAME_LEN: usize = 16;

/// 扩展帧标志
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// 远程帧标志
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// 错误帧标志
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;
/// 标准帧 ID 掩码
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// 扩展帧 ID 掩码
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// 编码为内核帧布局
pub fn encode(frame: &CanFrame) -> [u8; CAN_FRAME_LEN] {
    let mut can_id = frame.id();
    if frame.is_extended() {
        can_id |= CAN_EFF_FLAG;
    }

    let mut buf = [0u8; CAN_FRAME_LEN];
    buf[0..4].copy_from_slice(&can_id.to_ne_bytes());
    buf[4] = frame.dlc();
    buf[8..16].copy_from_slice(frame.payload());
    buf
}

/// 从内核帧布局解码
///
/// # 错误
/// - `CanError::Truncated`: 字节数不足 16（静默截断也算错误，而不是"无数据"）
/// - `CanError::InvalidFrame`: 错误帧、远程帧或 DLC > 8
pub fn decode(bytes: &[u8]) -> Result<CanFrame, CanError> {
    if bytes.len() < CAN_FRAME_LEN {
        return Err(CanError::Truncated {
            received: bytes.len(),
            expected: CAN_FRAME_LEN,
        });
    }

    let can_id = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if can_id & CAN_ERR_FLAG != 0 {
        return Err(CanError::InvalidFrame(format!(
            "error frame (class 0x{:X})",
            can_id & CAN_EFF_MASK
        )));
    }
    if can_id & CAN_RTR_FLAG != 0 {
        return Err(CanError::InvalidFrame(
            "remote frames are not supported".to_string(),
        ));
    }

    let dlc = bytes[4];
    if dlc > CAN_MAX_DLC {
        return Err(CanError::InvalidFrame(format!("Invalid DLC: {} (max 8)", dlc)));
    }

    let data = &bytes[8..8 + dlc as usize];
    let frame = if can_id & CAN_EFF_FLAG != 0 {
        CanFrame::new_extended(can_id & CAN_EFF_MASK, data)
    } else {
        CanFrame::new_standard((can_id & CAN_SFF_MASK) as u16, data)
    };
    Ok(frame)
}
