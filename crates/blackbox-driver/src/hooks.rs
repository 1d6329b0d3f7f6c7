//! 决策钩子（Decision Sinks）
//!
//! 每个完成的周期产生一个 [`Decision`]（分析结果 + CAN 帧），由控制线程同步地交给
//! [`DecisionSink`]。钩子可以记录日志、产生执行器命令帧或把记录送去录制。
//!
//! # 设计原则
//!
//! - **非阻塞**: 钩子运行在控制线程中，耗时操作必须交给后台线程（见 [`crate::recording`]）
//! - **命令帧由控制器发送**: 钩子只返回要发送的帧，传输句柄始终由控制器独占
//!
//! # 使用示例
//!
//! ```rust
//! use blackbox_driver::hooks::{ActuatorSink, LoggingSink, SinkChain};
//!
//! let mut sinks = SinkChain::new();
//! sinks.add_sink(Box::new(LoggingSink::new()));
//! sinks.add_sink(Box::new(ActuatorSink::new(0x3A0)));
//! assert_eq!(sinks.len(), 2);
//! ```

use blackbox_protocol::{AnalysisResult, CanFrame, Hazard};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{info, warn};

/// 钩子返回的命令帧（通常 0-1 帧，不分配堆内存）
pub type Commands = SmallVec<[CanFrame; 2]>;

/// 一个完成周期的决策输入
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// 周期序号（从 0 开始）
    pub cycle: u64,
    pub result: AnalysisResult,
    pub frame: CanFrame,
    /// 周期完成时刻（微秒，Unix 纪元）
    pub resolved_at_us: u64,
}

impl Decision {
    /// 危险等级；缺失 `hazard` 字段按 `None` 处理
    pub fn hazard(&self) -> Hazard {
        self.result.hazard().unwrap_or(Hazard::None)
    }

    /// 录制用的记录
    pub fn to_record(&self) -> DecisionRecord {
        DecisionRecord {
            cycle: self.cycle,
            timestamp_us: self.resolved_at_us,
            hazard: self.hazard().label().to_string(),
            can: self.frame,
            analysis: self.result.to_value(),
        }
    }
}

/// 写入 `decisions.jsonl` 的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub cycle: u64,
    pub timestamp_us: u64,
    pub hazard: String,
    pub can: CanFrame,
    pub analysis: serde_json::Value,
}

/// 决策钩子 Trait
///
/// # 性能要求
///
/// - 在控制线程中同步调用，不得无限期阻塞
/// - I/O 请使用有界队列 + 后台线程
pub trait DecisionSink {
    /// 每个完成的周期调用一次
    ///
    /// # 返回
    ///
    /// 需要由控制器发送到 CAN 总线的命令帧
    fn on_decision(&mut self, decision: &Decision) -> Commands;

    /// 控制器关闭时调用（可选）
    fn close(&mut self) {}

    /// 用于日志的名称
    fn name(&self) -> &'static str;
}

impl<S: DecisionSink + ?Sized> DecisionSink for Box<S> {
    fn on_decision(&mut self, decision: &Decision) -> Commands {
        (**self).on_decision(decision)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// 钩子链
///
/// 按注册顺序依次调用所有钩子，合并它们返回的命令帧。
#[derive(Default)]
pub struct SinkChain {
    sinks: Vec<Box<dyn DecisionSink>>,
}

impl SinkChain {
    #[must_use]
    pub const fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(&mut self, sink: Box<dyn DecisionSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }
}

impl DecisionSink for SinkChain {
    fn on_decision(&mut self, decision: &Decision) -> Commands {
        let mut commands = Commands::new();
        for sink in &mut self.sinks {
            commands.extend(sink.on_decision(decision));
        }
        commands
    }

    fn close(&mut self) {
        for sink in &mut self.sinks {
            sink.close();
        }
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

/// 日志钩子：每个决策一条 `info!`
#[derive(Debug, Default)]
pub struct LoggingSink {
    decisions: u64,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decisions(&self) -> u64 {
        self.decisions
    }
}

impl DecisionSink for LoggingSink {
    fn on_decision(&mut self, decision: &Decision) -> Commands {
        self.decisions += 1;
        if decision.result.is_failure() {
            warn!(
                "Cycle {}: analysis failed ({}), CAN {}",
                decision.cycle,
                decision.result.raw(),
                decision.frame
            );
        } else {
            info!(
                "Cycle {}: hazard={} status={} CAN {}",
                decision.cycle,
                decision.hazard(),
                decision.result.status().unwrap_or("-"),
                decision.frame
            );
        }
        Commands::new()
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// 执行器钩子：每个决策产生一帧命令
///
/// 载荷：`[hazard_level, source_id_hi, source_id_lo]`，其中 source_id 为触发帧 ID 的低 16 位。
/// 分析失败的周期不产生命令。
#[derive(Debug)]
pub struct ActuatorSink {
    command_id: u16,
}

impl ActuatorSink {
    /// `command_id` 超过 11 bit 的部分会被截掉
    pub fn new(command_id: u16) -> Self {
        Self { command_id }
    }

    pub fn command_frame(&self, decision: &Decision) -> CanFrame {
        let source = (decision.frame.id() & 0xFFFF) as u16;
        let [hi, lo] = source.to_be_bytes();
        CanFrame::new_standard(self.command_id, &[decision.hazard().level(), hi, lo])
    }
}

impl DecisionSink for ActuatorSink {
    fn on_decision(&mut self, decision: &Decision) -> Commands {
        let mut commands = Commands::new();
        if !decision.result.is_failure() {
            commands.push(self.command_frame(decision));
        }
        commands
    }

    fn name(&self) -> &'static str {
        "actuator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(line: &str, frame: CanFrame) -> Decision {
        Decision {
            cycle: 7,
            result: AnalysisResult::parse(line).unwrap(),
            frame,
            resolved_at_us: 1_000_000,
        }
    }

    struct FixedSink(Option<CanFrame>, &'static str);

    impl DecisionSink for FixedSink {
        fn on_decision(&mut self, _decision: &Decision) -> Commands {
            self.0.into_iter().collect()
        }

        fn name(&self) -> &'static str {
            self.1
        }
    }

    #[test]
    fn test_decision_hazard_defaults_to_none() {
        let d = decision(r#"{"status":"success"}"#, CanFrame::new_standard(0x2B0, &[]));
        assert_eq!(d.hazard(), Hazard::None);

        let d = decision(r#"{"hazard":"high"}"#, CanFrame::new_standard(0x2B0, &[]));
        assert_eq!(d.hazard(), Hazard::High);
    }

    #[test]
    fn test_decision_record_serialization() {
        let d = decision(
            r#"{"hazard":"low","score":0.5}"#,
            CanFrame::new_standard(0x2B0, &[1, 2]),
        );
        let value = serde_json::to_value(d.to_record()).unwrap();
        assert_eq!(value["cycle"], 7);
        assert_eq!(value["timestamp_us"], 1_000_000);
        assert_eq!(value["hazard"], "low");
        assert_eq!(value["can"]["id"], 0x2B0);
        assert_eq!(value["can"]["dlc"], 2);
        assert_eq!(value["analysis"]["score"], 0.5);
    }

    #[test]
    fn test_actuator_command_payload() {
        let mut sink = ActuatorSink::new(0x3A0);
        let d = decision(r#"{"hazard":"high"}"#, CanFrame::new_standard(0x2B0, &[0; 8]));
        let commands = sink.on_decision(&d);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].id(), 0x3A0);
        assert_eq!(commands[0].data(), &[2, 0x02, 0xB0]);
    }

    #[test]
    fn test_actuator_uses_low_16_bits_of_extended_id() {
        let sink = ActuatorSink::new(0x3A0);
        let d = decision(
            r#"{"hazard":"none"}"#,
            CanFrame::new_extended(0x18DA_F110, &[]),
        );
        assert_eq!(sink.command_frame(&d).data(), &[0, 0xF1, 0x10]);
    }

    #[test]
    fn test_actuator_skips_failed_analysis() {
        let mut sink = ActuatorSink::new(0x3A0);
        let d = decision(
            r#"{"status":"fail","reason":"no frame"}"#,
            CanFrame::new_standard(0x2B0, &[]),
        );
        assert!(sink.on_decision(&d).is_empty());
    }

    #[test]
    fn test_chain_merges_commands_in_order() {
        let mut chain = SinkChain::new();
        assert!(chain.is_empty());
        chain.add_sink(Box::new(FixedSink(
            Some(CanFrame::new_standard(0x1, &[])),
            "a",
        )));
        chain.add_sink(Box::new(LoggingSink::new()));
        chain.add_sink(Box::new(FixedSink(
            Some(CanFrame::new_standard(0x2, &[])),
            "b",
        )));
        assert_eq!(chain.names(), vec!["a", "log", "b"]);

        let d = decision(r#"{"hazard":"none"}"#, CanFrame::new_standard(0x2B0, &[]));
        let commands = chain.on_decision(&d);
        let ids: Vec<u32> = commands.iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec![0x1, 0x2]);
    }

    #[test]
    fn test_logging_sink_counts() {
        let mut sink = LoggingSink::new();
        let d = decision(r#"{"hazard":"none"}"#, CanFrame::new_standard(0x2B0, &[]));
        assert!(sink.on_decision(&d).is_empty());
        assert!(sink.on_decision(&d).is_empty());
        assert_eq!(sink.decisions(), 2);
    }
}
