//! 事件窗口录制（Event-Window Recording）
//!
//! 危险事件发生时，保存事件时刻前后一段时间内的决策记录。
//!
//! # 结构
//!
//! ```text
//! Controller ──on_decision──▶ RecordingSink ──try_send──▶ [bounded queue] ──▶ recorder thread
//!                                                                              │
//!                                                             EventRecorder (时间环形缓冲)
//!                                                                              │
//!                                                         <out_dir>/<event_id>/decisions.jsonl
//! ```
//!
//! - **Bounded Queue**: 队列满时丢弃新记录并计数，控制线程永不阻塞
//! - **单会话**: 事件进行中时新的触发被忽略
//! - **窗口**: 触发时刻 `t0` 起，收到 `t >= t0 + post` 的记录时提取 `[t0 - pre, t0 + post]`
//!
//! # 使用示例
//!
//! ```rust
//! use blackbox_driver::recording::{EventRecorder, WindowConfig};
//! use std::time::Duration;
//!
//! let mut recorder = EventRecorder::new(WindowConfig {
//!     pre: Duration::from_secs(1),
//!     post: Duration::from_secs(1),
//!     retention: Duration::from_secs(10),
//! });
//! recorder.push(0, serde_json::json!({"n": 0}));
//! recorder.trigger("high", 500_000);
//! assert!(recorder.push(1_500_000, serde_json::json!({"n": 1})).is_some());
//! ```

use crate::hooks::{Commands, Decision, DecisionSink};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 事件目录中的记录文件名
pub const RECORD_FILE: &str = "decisions.jsonl";

/// 时间窗口参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub pre: Duration,
    pub post: Duration,
    /// 环形缓冲保留的最长时间
    pub retention: Duration,
}

/// 带时间戳的记录
#[derive(Debug, Clone, PartialEq)]
pub struct TimedRecord {
    pub timestamp_us: u64,
    pub record: Value,
}

/// 提取出的事件窗口（按时间排序）
#[derive(Debug, Clone, PartialEq)]
pub struct EventWindow {
    pub event_id: String,
    pub t0_us: u64,
    pub records: Vec<TimedRecord>,
}

#[derive(Debug)]
struct ActiveEvent {
    event_id: String,
    t0_us: u64,
}

/// 基于时间戳的事件窗口录制器
///
/// 纯内存数据结构，不做 I/O；由调用方决定如何持久化 [`EventWindow`]。
#[derive(Debug)]
pub struct EventRecorder {
    window: WindowConfig,
    buffer: VecDeque<TimedRecord>,
    active: Option<ActiveEvent>,
}

impl EventRecorder {
    pub fn new(window: WindowConfig) -> Self {
        Self {
            window,
            buffer: VecDeque::new(),
            active: None,
        }
    }

    fn us(d: Duration) -> u64 {
        d.as_micros() as u64
    }

    /// 追加一条记录
    ///
    /// # 返回
    ///
    /// 如果这条记录让进行中的事件越过了 post 边界，返回提取出的窗口
    pub fn push(&mut self, timestamp_us: u64, record: Value) -> Option<EventWindow> {
        self.buffer.push_back(TimedRecord {
            timestamp_us,
            record,
        });
        self.prune(timestamp_us);

        let post_end = self
            .active
            .as_ref()
            .map(|e| e.t0_us.saturating_add(Self::us(self.window.post)))?;
        if timestamp_us >= post_end {
            self.finalize()
        } else {
            None
        }
    }

    /// 在 `now_us` 开始一个事件
    ///
    /// # 返回
    ///
    /// 已有事件进行中时忽略本次触发并返回 `false`
    pub fn trigger(&mut self, tag: &str, now_us: u64) -> bool {
        if self.active.is_some() {
            trace!("Event already active, ignoring trigger '{}'", tag);
            return false;
        }

        let event_id = if tag.is_empty() {
            format!("event_{}", now_us / 1000)
        } else {
            format!("event_{}_{}", now_us / 1000, sanitize(tag))
        };
        debug!("Event '{}' triggered", event_id);
        self.active = Some(ActiveEvent {
            event_id,
            t0_us: now_us,
        });
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 提前结束进行中的事件（关闭时使用），窗口只包含已有的记录
    pub fn flush(&mut self) -> Option<EventWindow> {
        self.active.as_ref()?;
        self.finalize()
    }

    fn prune(&mut self, now_us: u64) {
        let cutoff = now_us.saturating_sub(Self::us(self.window.retention));
        while self
            .buffer
            .front()
            .is_some_and(|r| r.timestamp_us < cutoff)
        {
            self.buffer.pop_front();
        }
    }

    fn finalize(&mut self) -> Option<EventWindow> {
        let event = self.active.take()?;
        let from = event.t0_us.saturating_sub(Self::us(self.window.pre));
        let to = event.t0_us.saturating_add(Self::us(self.window.post));

        let mut records: Vec<TimedRecord> = self
            .buffer
            .iter()
            .filter(|r| (from..=to).contains(&r.timestamp_us))
            .cloned()
            .collect();
        if records.is_empty() {
            debug!("Event '{}' has an empty window, dropped", event.event_id);
            return None;
        }
        records.sort_by_key(|r| r.timestamp_us);

        Some(EventWindow {
            event_id: event.event_id,
            t0_us: event.t0_us,
            records,
        })
    }
}

fn sanitize(tag: &str) -> String {
    tag.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// 把窗口写到 `<out_dir>/<event_id>/decisions.jsonl`
pub fn write_window(out_dir: &Path, window: &EventWindow) -> io::Result<PathBuf> {
    let dir = out_dir.join(&window.event_id);
    fs::create_dir_all(&dir)?;
    let path = dir.join(RECORD_FILE);

    let mut writer = BufWriter::new(File::create(&path)?);
    for record in &window.records {
        serde_json::to_writer(&mut writer, &record.record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(path)
}

/// 控制线程到录制线程的消息
#[derive(Debug)]
struct RecordMessage {
    timestamp_us: u64,
    record: Value,
    trigger: Option<String>,
}

/// 录制统计（跨线程共享）
#[derive(Debug, Default)]
pub struct RecordingStats {
    /// 成功入队的记录数
    pub queued: AtomicU64,
    /// 队列满而丢弃的记录数
    pub dropped: AtomicU64,
    /// 已保存的事件数
    pub events_saved: AtomicU64,
}

/// 录制钩子（Actor 模式 + Bounded Queue）
///
/// 每个决策入队一条记录；危险等级不是 `None` 的决策同时触发事件。
pub struct RecordingSink {
    tx: Option<Sender<RecordMessage>>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<RecordingStats>,
    close_wait: Duration,
}

impl RecordingSink {
    /// 创建输出目录并启动录制线程
    pub fn new(
        out_dir: impl Into<PathBuf>,
        window: WindowConfig,
        queue_capacity: usize,
    ) -> io::Result<Self> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir)?;

        let (tx, rx) = bounded(queue_capacity.max(1));
        let stats = Arc::new(RecordingStats::default());
        let worker_stats = stats.clone();
        let worker = std::thread::Builder::new()
            .name("blackbox-recorder".into())
            .spawn(move || recorder_loop(rx, EventRecorder::new(window), out_dir, worker_stats))?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            stats,
            close_wait: Duration::from_secs(5),
        })
    }

    /// 关闭时等待录制线程的上限（默认 5 秒）
    #[must_use]
    pub fn with_close_wait(mut self, wait: Duration) -> Self {
        self.close_wait = wait;
        self
    }

    pub fn stats(&self) -> &Arc<RecordingStats> {
        &self.stats
    }

    pub fn dropped_count(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// 关闭队列并在 `wait` 内等待录制线程写完
    pub fn shutdown(&mut self, wait: Duration) {
        drop(self.tx.take());
        let Some(worker) = self.worker.take() else {
            return;
        };

        let deadline = Instant::now() + wait;
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if worker.is_finished() {
            if worker.join().is_err() {
                error!("Recorder thread panicked");
            }
        } else {
            warn!("Recorder thread did not finish within {:?}, detaching", wait);
        }

        info!(
            "Recording stopped: {} queued, {} dropped, {} events saved",
            self.stats.queued.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
            self.stats.events_saved.load(Ordering::Relaxed)
        );
    }
}

impl DecisionSink for RecordingSink {
    fn on_decision(&mut self, decision: &Decision) -> Commands {
        let Some(tx) = &self.tx else {
            return Commands::new();
        };

        let record = match serde_json::to_value(decision.to_record()) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to serialize decision record: {}", e);
                return Commands::new();
            },
        };
        let hazard = decision.hazard();
        let message = RecordMessage {
            timestamp_us: decision.resolved_at_us,
            record,
            trigger: hazard.is_hazardous().then(|| hazard.label().to_string()),
        };

        match tx.try_send(message) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
            },
            Err(TrySendError::Full(_)) => {
                // 丢弃新记录，保留队列中的旧记录
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            },
            Err(TrySendError::Disconnected(_)) => {
                warn!("Recorder thread exited, recording disabled");
                self.tx = None;
            },
        }
        Commands::new()
    }

    fn close(&mut self) {
        self.shutdown(self.close_wait);
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        drop(self.tx.take());
    }
}

fn recorder_loop(
    rx: Receiver<RecordMessage>,
    mut recorder: EventRecorder,
    out_dir: PathBuf,
    stats: Arc<RecordingStats>,
) {
    let save = |window: EventWindow| match write_window(&out_dir, &window) {
        Ok(path) => {
            stats.events_saved.fetch_add(1, Ordering::Relaxed);
            info!(
                "Saved event '{}' ({} records) to {}",
                window.event_id,
                window.records.len(),
                path.display()
            );
        },
        Err(e) => error!("Failed to save event '{}': {}", window.event_id, e),
    };

    // 发送端全部关闭后 recv 返回 Err，循环结束
    while let Ok(message) = rx.recv() {
        if let Some(window) = recorder.push(message.timestamp_us, message.record) {
            save(window);
        }
        if let Some(tag) = message.trigger {
            recorder.trigger(&tag, message.timestamp_us);
        }
    }

    if let Some(window) = recorder.flush() {
        debug!("Flushing partial event '{}' on shutdown", window.event_id);
        save(window);
    }
}
