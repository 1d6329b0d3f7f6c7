//! 周期状态机与控制循环
//!
//! 单线程事件核心：把 CAN 传输、分析通道和周期心跳三路异步输入合并到一个状态机。
//!
//! ```text
//!          send_request
//!   Idle ───────────────▶ AwaitingBoth ──(ai_result + can_frame)──▶ Resolved
//!    ▲                                                                  │
//!    └──────────────────── sink 调用一次，状态清空 ◀────────────────────┘
//! ```
//!
//! # 每次迭代
//!
//! 1. `Idle` 时发送请求，进入 `AwaitingBoth`
//! 2. 在多路复用器上等待（心跳超时）
//! 3. 分析通道就绪：读出所有完整的行，最后一个合法结果覆盖之前未消费的结果；
//!    CAN 就绪：读一帧，覆盖之前的帧
//! 4. 两半都到齐：同步调用钩子，发送钩子返回的命令帧，清空状态回到 `Idle`
//!
//! 同一次唤醒内先处理分析通道，再处理 CAN。超时只是心跳，不会重发请求。

use crate::channel::AnalysisLink;
use crate::error::BlackboxError;
use crate::hooks::{Decision, DecisionSink};
use crate::mux::{MultiplexError, Multiplexer, ReadinessSource, Source};
use blackbox_can::{CanFrame, CanTransport};
use blackbox_protocol::AnalysisResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, trace, warn};

/// ctrlc 在独立线程中置位关闭标志，EINTR 可能先于标志到达
const SIGNAL_GRACE: Duration = Duration::from_millis(100);

/// 周期阶段（由 [`CycleState`] 推导）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// 没有未完成的请求
    Idle,
    /// 请求已发出，等待分析结果和 CAN 帧
    AwaitingBoth,
    /// 两半都已到齐，等待交给钩子
    Resolved,
}

/// 一个分析周期的部分结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleState {
    pub request_outstanding: bool,
    pub ai_result: Option<AnalysisResult>,
    pub can_frame: Option<CanFrame>,
}

impl CycleState {
    pub fn phase(&self) -> CyclePhase {
        match (self.ai_result.is_some(), self.can_frame.is_some()) {
            (true, true) => CyclePhase::Resolved,
            _ if self.request_outstanding => CyclePhase::AwaitingBoth,
            _ => CyclePhase::Idle,
        }
    }

    /// 存入分析结果；返回是否覆盖了未消费的旧结果
    pub fn store_result(&mut self, result: AnalysisResult) -> bool {
        self.ai_result.replace(result).is_some()
    }

    /// 存入 CAN 帧；返回是否覆盖了旧帧
    pub fn store_frame(&mut self, frame: CanFrame) -> bool {
        self.can_frame.replace(frame).is_some()
    }

    /// 两半都到齐时取出，并把状态清空
    pub fn take_complete(&mut self) -> Option<(AnalysisResult, CanFrame)> {
        if self.phase() != CyclePhase::Resolved {
            return None;
        }
        let result = self.ai_result.take()?;
        let frame = self.can_frame.take()?;
        self.request_outstanding = false;
        Some((result, frame))
    }
}

/// 运行统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub requests_sent: u64,
    pub cycles_resolved: u64,
    /// 超时返回（没有任何源就绪）的次数
    pub idle_ticks: u64,
    pub discarded_lines: u64,
    pub discarded_frames: u64,
    pub overwritten_results: u64,
    pub overwritten_frames: u64,
    pub commands_sent: u64,
    pub command_failures: u64,
}

/// 单次迭代的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// 等待超时，没有任何源就绪
    Timeout,
    /// 有源就绪，但周期尚未完成
    Pending,
    /// 完成了一个周期
    Resolved { cycle: u64 },
}

/// 控制器参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// 每个周期发送的请求命令
    pub command: String,
    /// 就绪等待的心跳间隔
    pub tick: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            command: "analyze".to_string(),
            tick: Duration::from_secs(1),
        }
    }
}

/// 控制器：独占传输句柄、分析通道、多路复用器和钩子
pub struct Controller<T, A, M, S> {
    transport: T,
    channel: A,
    mux: M,
    sink: S,
    config: ControllerConfig,
    state: CycleState,
    stats: CycleStats,
    next_cycle: u64,
    shut_down: bool,
}

impl<T, A, M, S> Controller<T, A, M, S>
where
    T: CanTransport + ReadinessSource,
    A: AnalysisLink + ReadinessSource,
    M: Multiplexer,
    S: DecisionSink,
{
    pub fn new(transport: T, channel: A, mux: M, sink: S, config: ControllerConfig) -> Self {
        Self {
            transport,
            channel,
            mux,
            sink,
            config,
            state: CycleState::default(),
            stats: CycleStats::default(),
            next_cycle: 0,
            shut_down: false,
        }
    }

    pub fn state(&self) -> &CycleState {
        &self.state
    }

    pub fn phase(&self) -> CyclePhase {
        self.state.phase()
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn channel(&self) -> &A {
        &self.channel
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// 执行一次迭代
    ///
    /// # 错误
    /// 只返回致命错误；单行/单帧错误在内部记录并丢弃
    pub fn step(&mut self) -> Result<StepOutcome, BlackboxError> {
        if self.state.phase() == CyclePhase::Idle {
            self.channel
                .send_request(&self.config.command)
                .map_err(BlackboxError::Channel)?;
            self.state.request_outstanding = true;
            self.stats.requests_sent += 1;
            debug!("Cycle {}: analysis requested", self.next_cycle);
        }

        let ready = {
            let sources = [
                (Source::Channel, self.channel.readiness_fd()),
                (Source::Transport, self.transport.readiness_fd()),
            ];
            self.mux.wait(&sources, self.config.tick)?
        };

        if ready.is_empty() {
            self.stats.idle_ticks += 1;
            trace!(
                "Cycle {}: heartbeat, phase {:?}",
                self.next_cycle,
                self.state.phase()
            );
            return Ok(StepOutcome::Timeout);
        }

        if ready.channel {
            self.drain_channel()?;
        }
        if ready.transport {
            self.read_transport()?;
        }

        match self.state.take_complete() {
            Some((result, frame)) => Ok(self.resolve(result, frame)),
            None => Ok(StepOutcome::Pending),
        }
    }

    fn drain_channel(&mut self) -> Result<(), BlackboxError> {
        loop {
            match self.channel.try_read_line() {
                Ok(Some(line)) => match AnalysisResult::parse(&line) {
                    Ok(result) => {
                        trace!("Analysis result: {}", result.raw());
                        if self.state.store_result(result) {
                            self.stats.overwritten_results += 1;
                            debug!("Unconsumed analysis result replaced");
                        }
                    },
                    Err(e) => {
                        self.stats.discarded_lines += 1;
                        warn!("Discarding malformed analysis line {:?}: {}", line, e);
                    },
                },
                Ok(None) => return Ok(()),
                Err(e) if e.is_recoverable() => {
                    self.stats.discarded_lines += 1;
                    warn!("Discarding analysis line: {}", e);
                },
                Err(e) => return Err(BlackboxError::Channel(e)),
            }
        }
    }

    fn read_transport(&mut self) -> Result<(), BlackboxError> {
        match self.transport.try_receive() {
            Ok(Some(frame)) => {
                trace!("CAN frame: {}", frame);
                if self.state.store_frame(frame) {
                    self.stats.overwritten_frames += 1;
                }
                Ok(())
            },
            Ok(None) => {
                trace!("CAN readiness without a frame");
                Ok(())
            },
            Err(e) if e.is_recoverable() => {
                self.stats.discarded_frames += 1;
                warn!("Discarding CAN frame: {}", e);
                Ok(())
            },
            Err(e) => Err(BlackboxError::Transport(e)),
        }
    }

    fn resolve(&mut self, result: AnalysisResult, frame: CanFrame) -> StepOutcome {
        let cycle = self.next_cycle;
        self.next_cycle += 1;
        self.stats.cycles_resolved += 1;

        let decision = Decision {
            cycle,
            result,
            frame,
            resolved_at_us: now_us(),
        };
        debug!("Cycle {} resolved", cycle);

        for command in self.sink.on_decision(&decision) {
            match self.transport.send(&command) {
                Ok(()) => self.stats.commands_sent += 1,
                Err(e) => {
                    self.stats.command_failures += 1;
                    warn!("Failed to send command frame {}: {}", command, e);
                },
            }
        }

        StepOutcome::Resolved { cycle }
    }

    /// 运行直到致命错误或 `shutdown` 被置位，然后有序关闭
    ///
    /// 关闭标志置位后被信号打断的等待视为正常退出。
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), BlackboxError> {
        info!(
            "Controller running (command '{}', tick {:?})",
            self.config.command, self.config.tick
        );

        let result = loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested");
                break Ok(());
            }

            match self.step() {
                Ok(_) => {},
                Err(BlackboxError::Multiplex(MultiplexError::Interrupted))
                    if shutdown_requested(shutdown) =>
                {
                    info!("Shutdown requested");
                    break Ok(());
                },
                Err(e) => {
                    error!("Fatal error: {}", e);
                    break Err(e);
                },
            }
        };

        self.shutdown();
        result
    }

    /// 有序关闭：钩子、CAN 传输、分析通道（等待子进程退出）
    ///
    /// 未完成的周期被丢弃。幂等。
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if self.state.phase() != CyclePhase::Idle {
            debug!("Dropping partial cycle {}", self.next_cycle);
        }
        self.state = CycleState::default();

        self.sink.close();
        self.transport.close();
        self.channel.close();

        let s = &self.stats;
        info!(
            "Controller stopped: {} requests, {} cycles, {} idle ticks, {} lines / {} frames discarded, {} commands sent ({} failed)",
            s.requests_sent,
            s.cycles_resolved,
            s.idle_ticks,
            s.discarded_lines,
            s.discarded_frames,
            s.commands_sent,
            s.command_failures
        );
    }
}

fn shutdown_requested(flag: &AtomicBool) -> bool {
    if flag.load(Ordering::SeqCst) {
        return true;
    }
    std::thread::sleep(SIGNAL_GRACE);
    flag.load(Ordering::SeqCst)
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
