//! 控制器测试用的 Mock 组件
//!
//! 传输、分析链路和钩子都通过 `Rc<RefCell<_>>` 共享状态，测试在控制器持有所有权时
//! 仍然可以观察它们。[`ScriptedMux`] 按脚本逐次"到达"数据并返回对应的就绪集合。

#![allow(dead_code)]

use blackbox_can::{CanError, CanFrame, CanTransport};
use blackbox_driver::{
    AnalysisLink, ChannelError, Commands, Controller, ControllerConfig, Decision, DecisionSink,
    MultiplexError, Multiplexer, ReadinessSource, ReadySet, Source,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::BorrowedFd;
use std::rc::Rc;
use std::time::Duration;

// ==================== Transport ====================

#[derive(Debug, Default)]
pub struct TransportState {
    pub inbound: VecDeque<Result<CanFrame, CanError>>,
    pub sent: Vec<CanFrame>,
    pub fail_send: bool,
    pub closes: u32,
    pub closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockTransport(pub Rc<RefCell<TransportState>>);

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<CanFrame> {
        self.0.borrow().sent.clone()
    }

    pub fn closes(&self) -> u32 {
        self.0.borrow().closes
    }
}

impl CanTransport for MockTransport {
    fn send(&mut self, frame: &CanFrame) -> Result<(), CanError> {
        let mut state = self.0.borrow_mut();
        if state.closed {
            return Err(CanError::Closed);
        }
        if state.fail_send {
            return Err(CanError::Write(std::io::Error::from(
                std::io::ErrorKind::WouldBlock,
            )));
        }
        state.sent.push(*frame);
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<CanFrame>, CanError> {
        let mut state = self.0.borrow_mut();
        if state.closed {
            return Err(CanError::Closed);
        }
        state.inbound.pop_front().transpose()
    }

    fn close(&mut self) {
        let mut state = self.0.borrow_mut();
        if !state.closed {
            state.closed = true;
            state.closes += 1;
        }
    }

    fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }
}

impl ReadinessSource for MockTransport {
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

// ==================== Analysis link ====================

#[derive(Debug, Default)]
pub struct LinkState {
    pub requests: Vec<String>,
    pub inbound: VecDeque<Result<String, ChannelError>>,
    pub fail_write: bool,
    pub closes: u32,
    pub closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockLink(pub Rc<RefCell<LinkState>>);

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> usize {
        self.0.borrow().requests.len()
    }

    pub fn closes(&self) -> u32 {
        self.0.borrow().closes
    }
}

impl AnalysisLink for MockLink {
    fn send_request(&mut self, command: &str) -> Result<(), ChannelError> {
        let mut state = self.0.borrow_mut();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if state.fail_write {
            return Err(ChannelError::Write(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }
        state.requests.push(command.to_string());
        Ok(())
    }

    fn try_read_line(&mut self) -> Result<Option<String>, ChannelError> {
        let mut state = self.0.borrow_mut();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        state.inbound.pop_front().transpose()
    }

    fn close(&mut self) {
        let mut state = self.0.borrow_mut();
        if !state.closed {
            state.closed = true;
            state.closes += 1;
        }
    }

    fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }
}

impl ReadinessSource for MockLink {
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

// ==================== Multiplexer ====================

/// 一次等待期间"到达"的数据
#[derive(Debug)]
pub enum Arrival {
    /// 超时，没有任何数据
    Nothing,
    /// 分析进程输出若干行
    Lines(Vec<String>),
    /// 一帧 CAN
    Frame(CanFrame),
    /// CAN 读取出错
    FrameError(CanError),
    /// 分析通道读取出错
    LineError(ChannelError),
    /// 同一次唤醒内两路都有数据
    Both(Vec<String>, CanFrame),
    /// 等待被信号打断
    Interrupt,
}

impl Arrival {
    pub fn line(line: &str) -> Self {
        Arrival::Lines(vec![line.to_string()])
    }
}

/// 按脚本返回就绪集合；脚本耗尽后返回 `Interrupted`
pub struct ScriptedMux {
    script: VecDeque<Arrival>,
    link: MockLink,
    transport: MockTransport,
    pub waits: Rc<RefCell<Vec<Duration>>>,
}

impl ScriptedMux {
    pub fn new(link: &MockLink, transport: &MockTransport, script: Vec<Arrival>) -> Self {
        Self {
            script: script.into(),
            link: link.clone(),
            transport: transport.clone(),
            waits: Rc::default(),
        }
    }

    fn push_lines(&self, lines: Vec<String>) {
        self.link.0.borrow_mut().inbound.extend(lines.into_iter().map(Ok));
    }
}

impl Multiplexer for ScriptedMux {
    fn wait(
        &mut self,
        sources: &[(Source, Option<BorrowedFd<'_>>)],
        timeout: Duration,
    ) -> Result<ReadySet, MultiplexError> {
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].0, Source::Channel);
        assert_eq!(sources[1].0, Source::Transport);
        self.waits.borrow_mut().push(timeout);

        match self.script.pop_front() {
            None | Some(Arrival::Interrupt) => Err(MultiplexError::Interrupted),
            Some(Arrival::Nothing) => Ok(ReadySet::NONE),
            Some(Arrival::Lines(lines)) => {
                self.push_lines(lines);
                Ok(ReadySet::channel())
            },
            Some(Arrival::LineError(e)) => {
                self.link.0.borrow_mut().inbound.push_back(Err(e));
                Ok(ReadySet::channel())
            },
            Some(Arrival::Frame(frame)) => {
                self.transport.0.borrow_mut().inbound.push_back(Ok(frame));
                Ok(ReadySet::transport())
            },
            Some(Arrival::FrameError(e)) => {
                self.transport.0.borrow_mut().inbound.push_back(Err(e));
                Ok(ReadySet::transport())
            },
            Some(Arrival::Both(lines, frame)) => {
                self.push_lines(lines);
                self.transport.0.borrow_mut().inbound.push_back(Ok(frame));
                Ok(ReadySet::both())
            },
        }
    }
}

// ==================== Sink ====================

#[derive(Debug, Default)]
pub struct SinkState {
    pub decisions: Vec<Decision>,
    pub closes: u32,
}

/// 记录所有决策，并对每个决策返回固定的命令帧
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    pub state: Rc<RefCell<SinkState>>,
    pub reply: Vec<CanFrame>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replying(reply: Vec<CanFrame>) -> Self {
        Self {
            reply,
            ..Self::default()
        }
    }

    pub fn decisions(&self) -> Vec<Decision> {
        self.state.borrow().decisions.clone()
    }

    pub fn closes(&self) -> u32 {
        self.state.borrow().closes
    }
}

impl DecisionSink for CollectingSink {
    fn on_decision(&mut self, decision: &Decision) -> Commands {
        self.state.borrow_mut().decisions.push(decision.clone());
        self.reply.iter().copied().collect()
    }

    fn close(&mut self) {
        self.state.borrow_mut().closes += 1;
    }

    fn name(&self) -> &'static str {
        "collect"
    }
}

// ==================== Helpers ====================

pub type TestController = Controller<MockTransport, MockLink, ScriptedMux, CollectingSink>;

/// 测试夹具：控制器 + 所有 Mock 的共享句柄
pub struct Harness {
    pub controller: TestController,
    pub transport: MockTransport,
    pub link: MockLink,
    pub sink: CollectingSink,
    pub waits: Rc<RefCell<Vec<Duration>>>,
}

impl Harness {
    pub fn new(script: Vec<Arrival>) -> Self {
        Self::with_sink(script, CollectingSink::new())
    }

    pub fn with_sink(script: Vec<Arrival>, sink: CollectingSink) -> Self {
        let transport = MockTransport::new();
        let link = MockLink::new();
        let mux = ScriptedMux::new(&link, &transport, script);
        let waits = mux.waits.clone();
        let controller = Controller::new(
            transport.clone(),
            link.clone(),
            mux,
            sink.clone(),
            ControllerConfig {
                command: "analyze".to_string(),
                tick: Duration::from_millis(1000),
            },
        );
        Self {
            controller,
            transport,
            link,
            sink,
            waits,
        }
    }
}

pub fn frame(id: u16) -> CanFrame {
    CanFrame::new_standard(id, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88])
}
