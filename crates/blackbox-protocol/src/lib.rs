//! # Blackbox Protocol
//!
//! 黑匣子控制器的数据模型（无硬件依赖）
//!
//! ## 模块
//!
//! - `analysis`: AI 分析进程返回的结果行解析
//!
//! ## CAN 帧
//!
//! [`CanFrame`] 与 Linux `struct can_frame` 一一对应：ID + DLC (0-8) + 8 字节数据区。

pub mod analysis;

pub use analysis::{AnalysisResult, Hazard};

use thiserror::Error;

/// 标准帧 ID 的最大值（11-bit）
pub const CAN_SFF_MAX_ID: u32 = 0x7FF;

/// 扩展帧 ID 的最大值（29-bit）
pub const CAN_EFF_MAX_ID: u32 = 0x1FFF_FFFF;

/// CAN 2.0 数据区最大长度
pub const CAN_MAX_DLC: u8 = 8;

/// CAN 2.0 帧的统一抽象
///
/// # 在架构中的位置
///
/// ```text
/// Cycle State Machine (blackbox-driver)
///     ↑ 每个周期持有最近一帧
/// CanFrame (此类型)
///     ↑ 与 libc::can_frame 的转换在 CAN 层实现
/// CAN Layer (blackbox-can)
///     ↑ SocketCAN
/// Hardware
/// ```
///
/// # 设计特性
///
/// - **Copy**：零成本复制，帧在接收后即不可变（字段私有，只提供读取方法）
/// - **固定 8 字节**：避免堆分配，只有前 `dlc` 字节有意义
/// - **时间戳**：`timestamp_us` 为接收时刻（微秒，Unix 纪元），0 表示不可用
///
/// ```rust
/// use blackbox_protocol::CanFrame;
///
/// let frame = CanFrame::new_standard(0x2B0, &[1, 2, 3, 4]);
/// assert_eq!(frame.id(), 0x2B0);
/// assert_eq!(frame.dlc(), 4);
/// assert_eq!(frame.data(), &[1, 2, 3, 4]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CanFrame {
    /// CAN ID（不含 EFF/RTR/ERR 标志位）
    id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    payload: [u8; 8],

    /// 有效数据长度 (0-8)
    dlc: u8,

    /// 是否为扩展帧（29-bit ID）
    is_extended: bool,

    /// 接收时间戳（微秒），0 表示不可用
    timestamp_us: u64,
}

impl CanFrame {
    /// 创建标准帧
    ///
    /// ID 超过 11 bit 的部分会被截掉，数据超过 8 字节的部分会被忽略。
    /// 需要校验时使用 [`CanFrame::try_new`]。
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::build(u32::from(id) & CAN_SFF_MAX_ID, data, false)
    }

    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::build(id & CAN_EFF_MAX_ID, data, true)
    }

    /// 带校验的构造器
    ///
    /// # 错误
    /// - `ProtocolError::InvalidCanId`: ID 超出 11/29 bit 范围
    /// - `ProtocolError::InvalidDlc`: 数据超过 8 字节
    pub fn try_new(id: u32, data: &[u8], is_extended: bool) -> Result<Self, ProtocolError> {
        let max_id = if is_extended {
            CAN_EFF_MAX_ID
        } else {
            CAN_SFF_MAX_ID
        };
        if id > max_id {
            return Err(ProtocolError::InvalidCanId { id, is_extended });
        }
        if data.len() > CAN_MAX_DLC as usize {
            return Err(ProtocolError::InvalidDlc { dlc: data.len() });
        }
        Ok(Self::build(id, data, is_extended))
    }

    fn build(id: u32, data: &[u8], is_extended: bool) -> Self {
        let mut payload = [0u8; 8];
        let len = data.len().min(CAN_MAX_DLC as usize);
        payload[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            payload,
            dlc: len as u8,
            is_extended,
            timestamp_us: 0,
        }
    }

    /// 附加接收时间戳
    #[must_use]
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// 获取 CAN ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// 有效数据长度
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.dlc as usize]
    }

    /// 获取完整数据（8 字节固定数组）
    pub fn payload(&self) -> &[u8; 8] {
        &self.payload
    }

    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }
}

impl std::fmt::Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_extended {
            write!(f, "ID=0x{:08X} DLC={} Data=", self.id, self.dlc)?;
        } else {
            write!(f, "ID=0x{:03X} DLC={} Data=", self.id, self.dlc)?;
        }
        for (i, byte) in self.data().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// 协议解析错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid CAN ID: 0x{id:X} (extended: {is_extended})")]
    InvalidCanId { id: u32, is_extended: bool },

    #[error("Invalid DLC: {dlc} (max 8)")]
    InvalidDlc { dlc: usize },

    #[error("Malformed analysis line: {0}")]
    MalformedLine(#[from] serde_json::Error),

    #[error("Analysis line is not a JSON object (got {kind})")]
    NotAnObject { kind: &'static str },
}
