//! Mock 板级支持实现
//!
//! 没有真实摄像头/屏幕/编码器时使用：摄像头生成测试图案，显示屏只记录日志，
//! 录像器不写文件，只统计帧数。

use super::{BspError, Camera, Color, Display, FrameBuffer, Rect, VideoRecorder};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// 生成测试图案的摄像头（默认 640x480）
#[derive(Debug)]
pub struct MockCamera {
    width: u32,
    height: u32,
    frames: u64,
    released: u64,
}

impl MockCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames: 0,
            released: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn released(&self) -> u64 {
        self.released
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl Camera for MockCamera {
    fn get_frame(&mut self) -> Result<FrameBuffer, BspError> {
        let mut frame = FrameBuffer::new(self.width, self.height);
        // 每帧变化的灰度，便于肉眼确认画面在刷新
        let level = (self.frames % 256) as u8;
        frame.data_mut().fill(level);
        self.frames += 1;
        trace!("Mock camera frame #{}", self.frames);
        Ok(frame)
    }

    fn release_frame(&mut self, _frame: FrameBuffer) {
        self.released += 1;
    }
}

/// 只记录日志的显示屏；绘图直接写入帧缓冲
#[derive(Debug, Default)]
pub struct MockDisplay {
    displayed: u64,
    last_text: Option<String>,
}

impl MockDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn displayed(&self) -> u64 {
        self.displayed
    }

    pub fn last_text(&self) -> Option<&str> {
        self.last_text.as_deref()
    }
}

impl Display for MockDisplay {
    fn draw_rectangle(&mut self, frame: &mut FrameBuffer, rect: Rect, thickness: u32, color: Color) {
        frame.stroke_rect(rect, thickness, color);
    }

    fn draw_text(
        &mut self,
        _frame: &mut FrameBuffer,
        text: &str,
        x: i32,
        y: i32,
        _font_size: u32,
        _color: Color,
    ) {
        trace!("Mock display text at ({}, {}): {}", x, y, text);
        self.last_text = Some(text.to_string());
    }

    fn display_frame(&mut self, frame: &FrameBuffer) -> Result<(), BspError> {
        self.displayed += 1;
        trace!(
            "Mock display frame {}x{} (#{})",
            frame.width(),
            frame.height(),
            self.displayed
        );
        Ok(())
    }
}

/// 已结束的录制会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSession {
    pub path: PathBuf,
    pub frames: u64,
}

/// 不写文件的录像器
#[derive(Debug, Default)]
pub struct MockVideoRecorder {
    current: Option<RecordingSession>,
    finished: Vec<RecordingSession>,
}

impl MockVideoRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished(&self) -> &[RecordingSession] {
        &self.finished
    }

    pub fn current(&self) -> Option<&RecordingSession> {
        self.current.as_ref()
    }
}

impl VideoRecorder for MockVideoRecorder {
    fn start_recording(&mut self, path: &Path) -> Result<(), BspError> {
        if self.current.is_some() {
            return Err(BspError::AlreadyRecording);
        }
        if path.as_os_str().is_empty() {
            return Err(BspError::Device("empty recording path".into()));
        }
        info!("Mock video recording started: {}", path.display());
        self.current = Some(RecordingSession {
            path: path.to_path_buf(),
            frames: 0,
        });
        Ok(())
    }

    fn write_frame(&mut self, _frame: &FrameBuffer) -> Result<(), BspError> {
        let session = self.current.as_mut().ok_or(BspError::NotRecording)?;
        session.frames += 1;
        Ok(())
    }

    fn stop_recording(&mut self) {
        if let Some(session) = self.current.take() {
            debug!(
                "Mock video recording stopped: {} ({} frames)",
                session.path.display(),
                session.frames
            );
            self.finished.push(session);
        }
    }

    fn is_recording(&self) -> bool {
        self.current.is_some()
    }
}
