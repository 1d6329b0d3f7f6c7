//! AI 分析结果解析
//!
//! 分析进程对每个请求返回一行 JSON 文本，例如：
//!
//! ```text
//! {"status": "success", "hazard": "none", "frame_shape": [720, 1280, 3]}
//! {"status": "fail", "reason": "Could not get frame from GStreamer"}
//! ```
//!
//! 控制器只关心少数字段（`status`、`hazard`），其余内容原样保留，供录制使用。

use crate::ProtocolError;
use serde_json::{Map, Value};
use std::str::FromStr;

/// 危险等级
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hazard {
    None,
    Low,
    High,
    /// 无法识别的等级（保留原字符串）
    Other(String),
}

impl Hazard {
    fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "none" | "clear" => Hazard::None,
            "low" | "warning" => Hazard::Low,
            "high" | "danger" | "collision" => Hazard::High,
            _ => Hazard::Other(label.to_string()),
        }
    }

    /// 写入执行器命令帧的等级编码
    pub fn level(&self) -> u8 {
        match self {
            Hazard::None => 0,
            Hazard::Low => 1,
            Hazard::High => 2,
            Hazard::Other(_) => 0xFF,
        }
    }

    /// 是否需要触发事件（未识别的等级按危险处理）
    pub fn is_hazardous(&self) -> bool {
        !matches!(self, Hazard::None)
    }

    pub fn label(&self) -> &str {
        match self {
            Hazard::None => "none",
            Hazard::Low => "low",
            Hazard::High => "high",
            Hazard::Other(label) => label,
        }
    }
}

impl std::fmt::Display for Hazard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// 分析进程的一条应答
///
/// 内部是一个 JSON 对象；非对象（数组、数字等）视为格式错误。
/// 原始文本保留在 `raw` 中，便于日志和录制。
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    fields: Map<String, Value>,
    raw: String,
}

impl AnalysisResult {
    /// 解析一行应答
    ///
    /// # 错误
    /// - `ProtocolError::MalformedLine`: 不是合法 JSON
    /// - `ProtocolError::NotAnObject`: 合法 JSON 但不是对象
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let trimmed = line.trim();
        match serde_json::from_str::<Value>(trimmed)? {
            Value::Object(fields) => Ok(Self {
                fields,
                raw: trimmed.to_string(),
            }),
            other => Err(ProtocolError::NotAnObject {
                kind: json_kind(&other),
            }),
        }
    }

    /// `status` 字段（`"success"` / `"fail"`）
    pub fn status(&self) -> Option<&str> {
        self.fields.get("status").and_then(Value::as_str)
    }

    /// 分析进程报告失败（仍然是对该请求的有效应答）
    pub fn is_failure(&self) -> bool {
        self.status() == Some("fail")
    }

    /// `hazard` 字段；缺失或非字符串时返回 `None`
    pub fn hazard(&self) -> Option<Hazard> {
        self.fields
            .get("hazard")
            .and_then(Value::as_str)
            .map(Hazard::from_label)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// 原始应答文本（去除首尾空白）
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// 转换为 JSON 值（用于录制）
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl FromStr for AnalysisResult {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
