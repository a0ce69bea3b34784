use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use super::host::{TestMessage, TestRunHost};
use crate::locations::Location;
use crate::tree::{NodeId, PendingTest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Queued,
    Running,
    Pass,
    Fail,
    Skip,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Queued => "queued",
            TestStatus::Running => "running",
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Skip => "skip",
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDetail {
    pub id: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<TestMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration_ms: u64,
}

/// Everything a [`RecordingHost`] observed during a run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub summary: TestSummary,
    pub tests: Vec<TestDetail>,
    pub output: String,
    pub raw_output_requested: bool,
    pub ended: bool,
}

impl RunReport {
    pub fn test(&self, id: &str) -> Option<&TestDetail> {
        self.tests.iter().find(|t| t.id == id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TestDetail> {
        self.tests.iter().filter(|t| t.status == TestStatus::Fail)
    }
}

#[derive(Default)]
struct State {
    details: BTreeMap<NodeId, TestDetail>,
    output: String,
    raw_output_requested: bool,
    ended: bool,
    elapsed_ms: u64,
}

/// A [`TestRunHost`] that records results, optionally echoing run output
/// to stdout as it arrives.
pub struct RecordingHost {
    ids: HashMap<NodeId, String>,
    state: Mutex<State>,
    echo: bool,
    started_at: Instant,
}

impl RecordingHost {
    pub fn new(tests: &BTreeMap<String, PendingTest>) -> Self {
        Self {
            ids: tests.iter().map(|(id, t)| (t.item, id.clone())).collect(),
            state: Mutex::new(State::default()),
            echo: false,
            started_at: Instant::now(),
        }
    }

    pub fn echo_to_stdout(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn report(&self) -> RunReport {
        let state = self.lock();
        let tests: Vec<TestDetail> = state.details.values().cloned().collect();
        let count = |status: TestStatus| tests.iter().filter(|t| t.status == status).count() as u32;
        let duration_ms = if state.ended {
            state.elapsed_ms
        } else {
            self.started_at.elapsed().as_millis() as u64
        };
        RunReport {
            summary: TestSummary {
                passed: count(TestStatus::Pass),
                failed: count(TestStatus::Fail),
                skipped: count(TestStatus::Skip),
                duration_ms,
            },
            tests,
            output: state.output.clone(),
            raw_output_requested: state.raw_output_requested,
            ended: state.ended,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking host call leaves the state usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, item: NodeId, status: TestStatus, duration_ms: Option<f64>, message: Option<TestMessage>) {
        let Some(id) = self.ids.get(&item) else {
            tracing::warn!("Result for unknown test item {:?}", item);
            return;
        };
        self.lock().details.insert(
            item,
            TestDetail {
                id: id.clone(),
                status,
                duration_ms,
                message,
            },
        );
    }
}

impl TestRunHost for RecordingHost {
    fn enqueued(&self, item: NodeId) {
        self.set(item, TestStatus::Queued, None, None);
    }

    fn started(&self, item: NodeId) {
        self.set(item, TestStatus::Running, None, None);
    }

    fn passed(&self, item: NodeId, duration_ms: Option<f64>) {
        self.set(item, TestStatus::Pass, duration_ms, None);
    }

    fn failed(&self, item: NodeId, message: TestMessage, duration_ms: Option<f64>) {
        self.set(item, TestStatus::Fail, duration_ms, Some(message));
    }

    fn skipped(&self, item: NodeId) {
        self.set(item, TestStatus::Skip, None, None);
    }

    fn append_output(&self, text: &str, _location: Option<&Location>, _item: Option<NodeId>) {
        self.lock().output.push_str(text);
        if self.echo {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
    }

    fn end(&self) {
        let mut state = self.lock();
        state.ended = true;
        state.elapsed_ms = self.started_at.elapsed().as_millis() as u64;
    }

    fn show_raw_output(&self) {
        self.lock().raw_output_requested = true;
    }
}

/// Write a run report as JSON into `dir`. Returns the file path.
pub fn write_details(report: &RunReport, dir: &Path) -> crate::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let run_id = uuid::Uuid::new_v4().to_string().split('-').next().unwrap_or("unknown").to_string();
    let date = chrono::Utc::now().format("%Y-%m-%d");
    let path = dir.join(format!("{}-{}.json", run_id, date));

    let details = serde_json::json!({
        "summary": report.summary,
        "tests": report.tests,
        "failures": report.failures().collect::<Vec<_>>(),
        "output": report.output,
    });
    std::fs::write(&path, serde_json::to_string_pretty(&details)?)?;

    Ok(path)
}

/// Default directory for run reports.
pub fn default_report_dir() -> PathBuf {
    std::env::temp_dir().join("testbridge").join("runs")
}
