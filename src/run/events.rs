//! Payloads of the two structured event dialects a test process may emit.
//!
//! Both arrive as `[head, payload]` JSON lines. The tuple dialect carries a
//! test id in the head and an automation-framework event object; the named
//! dialect carries a mocha-style reporter event name.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// `_status` values that mark an event as failed.
pub const STATUS_FAILED: i64 = 6;
pub const STATUS_FAILED_TIMEOUT: i64 = 7;

/// Test result code reported in a run-end return value.
pub const RESULT_PASSED: i64 = 1;

/// Kind of a tuple-dialect event, from its `_event_type` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KtEventKind {
    Error,
    RunStart,
    RunEnd,
    StepStart,
    Other(i64),
}

impl KtEventKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            30 => KtEventKind::Error,
            32 => KtEventKind::RunStart,
            33 => KtEventKind::RunEnd,
            34 => KtEventKind::StepStart,
            other => KtEventKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogMessage {
    #[serde(rename = "_msg_list", default)]
    pub msg_list: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KtException {
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub screen: String,
    #[serde(rename = "stracktrace", default)]
    pub stack_trace: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KtEvent {
    #[serde(rename = "_name", default)]
    pub name: String,
    #[serde(rename = "_log_msg", default)]
    pub log_msg: LogMessage,
    #[serde(rename = "_event_type")]
    pub event_type: i64,
    #[serde(rename = "_status", default)]
    pub status: i64,
    #[serde(rename = "_attempts", default)]
    pub attempts: u32,
    #[serde(rename = "_execution_time", default)]
    pub execution_time: f64,
    #[serde(rename = "_start_time", default)]
    pub start_time: f64,
    #[serde(rename = "_exceptions", default)]
    pub exceptions: Vec<KtException>,
    #[serde(rename = "_request", default)]
    pub request: Value,
    #[serde(rename = "_return_values", default)]
    pub return_values: Vec<String>,
}

impl KtEvent {
    pub fn kind(&self) -> KtEventKind {
        KtEventKind::from_code(self.event_type)
    }

    pub fn is_failed(&self) -> bool {
        self.status == STATUS_FAILED || self.status == STATUS_FAILED_TIMEOUT
    }

    /// `[status, time]` from the first return value of a run-end event.
    pub fn run_result(&self) -> crate::Result<(i64, f64)> {
        let raw = self.return_values.first().ok_or_else(|| {
            crate::Error::Internal(format!("run-end event for '{}' has no return value", self.name))
        })?;
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartStats {
    #[serde(default)]
    pub total: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndStats {
    #[serde(default)]
    pub suites: u32,
    #[serde(default)]
    pub tests: u32,
    #[serde(default)]
    pub passes: u32,
    #[serde(default)]
    pub pending: u32,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// Payload shared by `testStart`, `pass` and `fail`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MochaTest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub full_title: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub current_retry: u32,
    #[serde(default)]
    pub speed: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub err: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
    /// `Some(Value::Null)` when the key is present with `null`.
    #[serde(default, deserialize_with = "present")]
    pub expected: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub actual: Option<Value>,
    #[serde(rename = "expectedJSON", default, deserialize_with = "present")]
    pub expected_json: Option<Value>,
    #[serde(rename = "actualJSON", default, deserialize_with = "present")]
    pub actual_json: Option<Value>,
    #[serde(default)]
    pub snapshot_path: Option<String>,
}

/// Only reached for keys that exist, so `null` stays a value.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone)]
pub enum MochaEvent {
    Start(StartStats),
    TestStart(MochaTest),
    Pass(MochaTest),
    Fail(MochaTest),
    End(EndStats),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Tuple,
    Named,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Tuple => f.write_str("tuple"),
            Dialect::Named => f.write_str("named"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Kt { id: String, event: KtEvent },
    Mocha(MochaEvent),
}

impl RunnerEvent {
    pub fn dialect(&self) -> Dialect {
        match self {
            RunnerEvent::Kt { .. } => Dialect::Tuple,
            RunnerEvent::Mocha(_) => Dialect::Named,
        }
    }
}

const MOCHA_EVENTS: &[&str] = &["start", "testStart", "pass", "fail", "end"];

/// Decide which dialect a `[head, payload]` event belongs to.
///
/// Payloads carrying `_event_type` are tuple-dialect regardless of the head.
/// Otherwise a known reporter event name selects the named dialect. Anything
/// else is `Ok(None)` and should be treated as plain output.
pub fn classify(head: &str, payload: &Value) -> crate::Result<Option<RunnerEvent>> {
    if payload.get("_event_type").is_some() {
        let event: KtEvent = serde_json::from_value(payload.clone())?;
        return Ok(Some(RunnerEvent::Kt { id: head.to_string(), event }));
    }
    if !MOCHA_EVENTS.contains(&head) {
        return Ok(None);
    }

    let event = match head {
        "start" => MochaEvent::Start(serde_json::from_value(payload.clone())?),
        "testStart" => MochaEvent::TestStart(serde_json::from_value(payload.clone())?),
        "pass" => MochaEvent::Pass(serde_json::from_value(payload.clone())?),
        "fail" => MochaEvent::Fail(serde_json::from_value(payload.clone())?),
        _ => MochaEvent::End(serde_json::from_value(payload.clone())?),
    };
    Ok(Some(RunnerEvent::Mocha(event)))
}
