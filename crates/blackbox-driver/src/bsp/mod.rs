//! 板级支持接口（Board Support Package）
//!
//! 摄像头、显示屏和录像管线都是外部协作者，控制核心只依赖这里定义的接口。
//! 真实驱动未链接时使用 [`mock`] 中的实现。

pub mod mock;

use std::path::Path;
use thiserror::Error;

/// 颜色（0xRRGGBB）
pub type Color = u32;

pub const GREEN: Color = 0x00_C8_00;
pub const YELLOW: Color = 0xFF_C8_00;
pub const RED: Color = 0xFF_00_00;
pub const WHITE: Color = 0xFF_FF_FF;

/// BSP 错误类型
#[derive(Error, Debug)]
pub enum BspError {
    #[error("Invalid frame buffer: {width}x{height} RGB24 needs {expected} bytes, got {actual}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Recording already in progress")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// 矩形区域（像素坐标，可以部分超出画面）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// RGB24 帧缓冲
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl FrameBuffer {
    /// 全黑帧
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 3],
        }
    }

    /// 由已有的 RGB24 数据构造
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, BspError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(BspError::InvalidFrame {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// 数据总字节数
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        let [r, g, b] = [self.data[i], self.data[i + 1], self.data[i + 2]];
        Some(u32::from_be_bytes([0, r, g, b]))
    }

    /// 填充矩形（裁剪到画面内）
    pub fn fill_rect(&mut self, rect: Rect, color: Color) {
        let [_, r, g, b] = color.to_be_bytes();
        let x0 = rect.x.clamp(0, self.width as i32) as usize;
        let y0 = rect.y.clamp(0, self.height as i32) as usize;
        let x1 = (i64::from(rect.x) + i64::from(rect.width)).clamp(0, i64::from(self.width)) as usize;
        let y1 =
            (i64::from(rect.y) + i64::from(rect.height)).clamp(0, i64::from(self.height)) as usize;

        let stride = self.width as usize * 3;
        for y in y0..y1 {
            for x in x0..x1 {
                let i = y * stride + x * 3;
                self.data[i..i + 3].copy_from_slice(&[r, g, b]);
            }
        }
    }

    /// 画矩形边框（裁剪到画面内）
    pub fn stroke_rect(&mut self, rect: Rect, thickness: u32, color: Color) {
        let t = thickness.min(rect.width).min(rect.height);
        if t == 0 {
            return;
        }
        let bottom = rect.y + rect.height as i32 - t as i32;
        let right = rect.x + rect.width as i32 - t as i32;
        self.fill_rect(Rect { height: t, ..rect }, color);
        self.fill_rect(Rect { y: bottom, height: t, ..rect }, color);
        self.fill_rect(Rect { width: t, ..rect }, color);
        self.fill_rect(Rect { x: right, width: t, ..rect }, color);
    }
}

/// 摄像头
pub trait Camera {
    /// 获取最新一帧
    fn get_frame(&mut self) -> Result<FrameBuffer, BspError>;

    /// 归还帧（可复用其缓冲区）
    fn release_frame(&mut self, frame: FrameBuffer);
}

/// 显示屏与绘图
pub trait Display {
    fn draw_rectangle(&mut self, frame: &mut FrameBuffer, rect: Rect, thickness: u32, color: Color);

    fn draw_text(
        &mut self,
        frame: &mut FrameBuffer,
        text: &str,
        x: i32,
        y: i32,
        font_size: u32,
        color: Color,
    );

    fn display_frame(&mut self, frame: &FrameBuffer) -> Result<(), BspError>;
}

/// 录像管线
pub trait VideoRecorder {
    /// 开始录制到 `path`
    ///
    /// # 错误
    /// - `BspError::AlreadyRecording`: 已在录制
    fn start_recording(&mut self, path: &Path) -> Result<(), BspError>;

    /// # 错误
    /// - `BspError::NotRecording`: 没有进行中的录制
    fn write_frame(&mut self, frame: &FrameBuffer) -> Result<(), BspError>;

    /// 结束录制；未在录制时为空操作
    fn stop_recording(&mut self);

    fn is_recording(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgb_checks_size() {
        assert!(FrameBuffer::from_rgb(2, 2, vec![0; 12]).is_ok());
        let err = FrameBuffer::from_rgb(2, 2, vec![0; 11]).unwrap_err();
        assert!(matches!(
            err,
            BspError::InvalidFrame {
                expected: 12,
                actual: 11,
                ..
            }
        ));
    }

    #[test]
    fn test_fill_rect_is_clipped() {
        let mut frame = FrameBuffer::new(4, 4);
        frame.fill_rect(
            Rect {
                x: -2,
                y: 2,
                width: 4,
                height: 10,
            },
            RED,
        );
        assert_eq!(frame.pixel(0, 2), Some(RED));
        assert_eq!(frame.pixel(1, 3), Some(RED));
        assert_eq!(frame.pixel(2, 2), Some(0));
        assert_eq!(frame.pixel(0, 1), Some(0));
        assert_eq!(frame.pixel(4, 0), None);
    }

    #[test]
    fn test_stroke_rect_draws_border_only() {
        let mut frame = FrameBuffer::new(6, 6);
        frame.stroke_rect(
            Rect {
                x: 0,
                y: 0,
                width: 6,
                height: 6,
            },
            1,
            GREEN,
        );
        assert_eq!(frame.pixel(0, 0), Some(GREEN));
        assert_eq!(frame.pixel(5, 5), Some(GREEN));
        assert_eq!(frame.pixel(5, 2), Some(GREEN));
        assert_eq!(frame.pixel(2, 2), Some(0));
    }
}
