//! 视频钩子
//!
//! 每个决策取一帧画面，叠加结论后送显示屏；危险事件发生后录制接下来
//! `post_cycles` 个周期的画面。所有 BSP 错误只记录日志，不影响控制循环。

use crate::bsp::{self, Camera, Display, FrameBuffer, Rect, VideoRecorder};
use crate::hooks::{Commands, Decision, DecisionSink};
use blackbox_protocol::Hazard;
use std::path::PathBuf;
use tracing::{info, warn};

pub struct VideoSink<C, D, R> {
    camera: C,
    display: D,
    recorder: R,
    out_dir: PathBuf,
    post_cycles: u32,
    remaining: u32,
}

impl<C: Camera, D: Display, R: VideoRecorder> VideoSink<C, D, R> {
    /// 创建录像输出目录
    pub fn new(
        camera: C,
        display: D,
        recorder: R,
        out_dir: impl Into<PathBuf>,
        post_cycles: u32,
    ) -> std::io::Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)?;
        Ok(Self {
            camera,
            display,
            recorder,
            out_dir,
            post_cycles,
            remaining: 0,
        })
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    fn overlay(&mut self, frame: &mut FrameBuffer, decision: &Decision) {
        let hazard = decision.hazard();
        let color = match hazard {
            Hazard::None => bsp::GREEN,
            Hazard::Low => bsp::YELLOW,
            Hazard::High | Hazard::Other(_) => bsp::RED,
        };
        let border = Rect {
            x: 0,
            y: 0,
            width: frame.width(),
            height: frame.height(),
        };
        self.display.draw_rectangle(frame, border, 4, color);

        let text = format!(
            "#{} {} CAN 0x{:03X}",
            decision.cycle,
            hazard,
            decision.frame.id()
        );
        self.display.draw_text(frame, &text, 10, 10, 16, bsp::WHITE);
    }

    fn record(&mut self, frame: &FrameBuffer, decision: &Decision) {
        if decision.hazard().is_hazardous() {
            self.remaining = self.post_cycles;
            if !self.recorder.is_recording() {
                let path = self
                    .out_dir
                    .join(format!("event_{}.mp4", decision.resolved_at_us / 1000));
                match self.recorder.start_recording(&path) {
                    Ok(()) => info!("Video recording started: {}", path.display()),
                    Err(e) => warn!("Failed to start video recording: {}", e),
                }
            }
        }

        if !self.recorder.is_recording() {
            return;
        }
        if let Err(e) = self.recorder.write_frame(frame) {
            warn!("Failed to write video frame: {}", e);
        }
        if self.remaining == 0 {
            self.recorder.stop_recording();
            info!("Video recording stopped");
        } else {
            self.remaining -= 1;
        }
    }
}

impl<C: Camera, D: Display, R: VideoRecorder> DecisionSink for VideoSink<C, D, R> {
    fn on_decision(&mut self, decision: &Decision) -> Commands {
        let mut frame = match self.camera.get_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Camera frame unavailable: {}", e);
                return Commands::new();
            },
        };

        self.overlay(&mut frame, decision);
        if let Err(e) = self.display.display_frame(&frame) {
            warn!("Failed to display frame: {}", e);
        }
        self.record(&frame, decision);
        self.camera.release_frame(frame);
        Commands::new()
    }

    fn close(&mut self) {
        if self.recorder.is_recording() {
            self.recorder.stop_recording();
            info!("Video recording stopped on shutdown");
        }
    }

    fn name(&self) -> &'static str {
        "video"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsp::mock::{MockCamera, MockDisplay, MockVideoRecorder};
    use blackbox_protocol::{AnalysisResult, CanFrame};

    fn decision(cycle: u64, hazard: &str) -> Decision {
        Decision {
            cycle,
            result: AnalysisResult::parse(&format!(r#"{{"hazard":"{}"}}"#, hazard)).unwrap(),
            frame: CanFrame::new_standard(0x2B0, &[]),
            resolved_at_us: (cycle + 1) * 1_000_000,
        }
    }

    fn sink(
        dir: &std::path::Path,
        post_cycles: u32,
    ) -> VideoSink<MockCamera, MockDisplay, MockVideoRecorder> {
        VideoSink::new(
            MockCamera::new(32, 16),
            MockDisplay::new(),
            MockVideoRecorder::new(),
            dir,
            post_cycles,
        )
        .unwrap()
    }

    #[test]
    fn test_every_decision_is_displayed_with_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink(dir.path(), 2);
        sink.on_decision(&decision(0, "none"));
        sink.on_decision(&decision(1, "none"));

        assert_eq!(sink.display().displayed(), 2);
        assert_eq!(sink.display().last_text(), Some("#1 none CAN 0x2B0"));
        assert_eq!(sink.camera().released(), 2);
        assert!(!sink.recorder().is_recording());
        assert!(sink.recorder().finished().is_empty());
    }

    #[test]
    fn test_hazard_records_post_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink(dir.path(), 2);
        for (cycle, hazard) in ["none", "high", "none", "none", "none"].iter().enumerate() {
            sink.on_decision(&decision(cycle as u64, hazard));
        }

        let sessions = sink.recorder().finished();
        assert_eq!(sessions.len(), 1);
        // 危险帧 + 之后 2 个周期
        assert_eq!(sessions[0].frames, 3);
        assert_eq!(sessions[0].path, dir.path().join("event_2000.mp4"));
    }

    #[test]
    fn test_repeated_hazard_extends_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink(dir.path(), 1);
        for (cycle, hazard) in ["high", "high", "none", "none"].iter().enumerate() {
            sink.on_decision(&decision(cycle as u64, hazard));
        }
        let sessions = sink.recorder().finished();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].frames, 3);
    }

    #[test]
    fn test_close_stops_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink(dir.path(), 10);
        sink.on_decision(&decision(0, "low"));
        assert!(sink.recorder().is_recording());
        sink.close();
        assert!(!sink.recorder().is_recording());
        assert_eq!(sink.recorder().finished()[0].frames, 1);
    }
}
