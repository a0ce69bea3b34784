use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::{Arc, LazyLock};

use futures::future::{BoxFuture, FutureExt, Shared};
use owo_colors::OwoColorize;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::locations::{
    force_crlf, replace_all_locations, sourcemap_stack, try_derive_stack_location, Location,
    SourceMapStore,
};
use crate::tree::{NodeId, PendingTest, Position, Range};
use super::events::{classify, Dialect, KtEvent, KtEventKind, MochaEvent, MochaTest, RunnerEvent, RESULT_PASSED};
use super::host::{TestMessage, TestRunHost};
use super::scanner::{OutputScanner, ScannerEvent};

const CRLF: &str = "\r\n";

/// Separates a snapshot test's expected output from its snapshot path.
pub const SNAPSHOT_COMMENT: &str = "\n\n// snapshot: ";
pub const SNAPSHOT_CONTEXT_VALUE: &str = "isSelfhostSnapshotMessage";

static CONSOLE_SOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(.+)", source: (file:///.*?)+ \(([0-9]+)\)"#).expect("Invalid console source pattern")
});

struct OutputLine {
    text: String,
    location: Option<Location>,
    item: Option<NodeId>,
}

enum QueuedOutput {
    Ready(OutputLine),
    Deferred(JoinHandle<OutputLine>),
}

/// Single consumer that appends output in the order it was queued, waiting
/// on deferred lines as it reaches them.
fn spawn_output_worker(host: Arc<dyn TestRunHost>) -> (mpsc::UnboundedSender<QueuedOutput>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueuedOutput>();
    let worker = tokio::spawn(async move {
        while let Some(queued) = rx.recv().await {
            let line = match queued {
                QueuedOutput::Ready(line) => line,
                QueuedOutput::Deferred(handle) => match handle.await {
                    Ok(line) => line,
                    Err(e) => OutputLine {
                        text: format!("{}{}", e, CRLF),
                        location: None,
                        item: None,
                    },
                },
            };
            host.append_output(&line.text, line.location.as_ref(), line.item);
        }
    });
    (tx, worker)
}

type SharedText = Shared<BoxFuture<'static, String>>;

/// Start `fut` now and hand out a future of its result that can be awaited
/// from several places.
fn spawn_shared<F>(fut: F) -> SharedText
where
    F: Future<Output = String> + Send + 'static,
{
    tokio::spawn(fut)
        .map(|r| r.unwrap_or_else(|e| e.to_string()))
        .boxed()
        .shared()
}

enum Flow {
    Continue,
    Stop,
}

struct Reconciler {
    tests: BTreeMap<String, PendingTest>,
    skipped: BTreeSet<NodeId>,
    resolved: HashSet<NodeId>,
    host: Arc<dyn TestRunHost>,
    store: Arc<SourceMapStore>,
    output: mpsc::UnboundedSender<QueuedOutput>,
    blockers: JoinSet<()>,
    current_test: Option<PendingTest>,
    last_test: Option<PendingTest>,
    ran_any_test: bool,
    dialect: Option<Dialect>,
}

impl Reconciler {
    fn enqueue(&self, text: String, location: Option<Location>, item: Option<NodeId>) {
        let _ = self.output.send(QueuedOutput::Ready(OutputLine { text, location, item }));
    }

    fn enqueue_text(&self, text: String) {
        self.enqueue(text, None, None);
    }

    fn enqueue_deferred<F>(&self, fut: F)
    where
        F: Future<Output = OutputLine> + Send + 'static,
    {
        let _ = self.output.send(QueuedOutput::Deferred(tokio::spawn(fut)));
    }

    fn start(&mut self, test: &PendingTest) {
        self.skipped.remove(&test.item);
        self.host.started(test.item);
        self.ran_any_test = true;
        self.current_test = Some(test.clone());
    }

    /// Record a terminal status for `item`. Returns false when the item
    /// already has one, unless `reopen` allows a later failure to replace it.
    fn claim(&mut self, item: NodeId, reopen: bool) -> bool {
        self.skipped.remove(&item);
        if self.resolved.insert(item) || reopen {
            true
        } else {
            tracing::debug!("Ignoring second result for {}", item);
            false
        }
    }

    fn handle(&mut self, event: ScannerEvent) -> crate::Result<Flow> {
        match event {
            ScannerEvent::Output(line) => {
                self.handle_text(line);
                Ok(Flow::Continue)
            }
            ScannerEvent::RunnerError(message) => {
                self.enqueue_text(format!("{}{}", message, CRLF));
                Ok(Flow::Stop)
            }
            ScannerEvent::Tagged { head, payload, line } => {
                let Some(event) = classify(&head, &payload)? else {
                    self.handle_text(line);
                    return Ok(Flow::Continue);
                };

                let dialect = event.dialect();
                match self.dialect {
                    None => self.dialect = Some(dialect),
                    Some(locked) if locked != dialect => {
                        tracing::warn!("Ignoring {} event '{}' in a {} run", dialect, head, locked);
                        self.enqueue_text(format!(
                            "Ignoring {}-dialect event '{}' in a {}-dialect run{}",
                            dialect, head, locked, CRLF
                        ));
                        return Ok(Flow::Continue);
                    }
                    Some(_) => {}
                }

                match event {
                    RunnerEvent::Kt { id, event } => {
                        self.handle_kt(&id, &event)?;
                        Ok(Flow::Continue)
                    }
                    RunnerEvent::Mocha(event) => Ok(self.handle_mocha(event)),
                }
            }
        }
    }

    fn handle_text(&mut self, line: String) {
        let Some(caps) = CONSOLE_SOURCE_RE.captures(&line) else {
            self.enqueue_text(format!("{}{}", line, CRLF));
            return;
        };

        let message = caps.get(1).map_or("", |m| m.as_str()).to_string();
        let uri = caps.get(2).map_or("", |m| m.as_str()).to_string();
        let line_no: Option<u32> = caps.get(3).and_then(|m| m.as_str().parse().ok());
        let store = Arc::clone(&self.store);
        let item = self.current_test.as_ref().map(|t| t.item);

        self.enqueue_deferred(async move {
            let location = async {
                match line_no {
                    Some(n) => store.get_source_location(&uri, n, 1).await,
                    None => None,
                }
            };
            let (location, text) = tokio::join!(location, replace_all_locations(&store, &message));
            OutputLine {
                text: text + CRLF,
                location,
                item,
            }
        });
    }

    fn handle_kt(&mut self, id: &str, event: &KtEvent) -> crate::Result<()> {
        let Some(test) = self.tests.get(id).cloned() else {
            tracing::debug!("No pending test for event from '{}'", id);
            return Ok(());
        };

        let prefix = format!("{} ", format!("[{}]", id).bright_blue());
        let spacer = " ".repeat(5 + id.chars().count());
        let mut step = " ".to_string();

        match event.kind() {
            KtEventKind::RunStart => self.start(&test),
            KtEventKind::RunEnd => {
                let (status, time) = event.run_result()?;
                if self.claim(test.item, false) {
                    if status == RESULT_PASSED {
                        self.host.passed(test.item, Some(time));
                    } else {
                        self.host.failed(test.item, TestMessage::new("Test Failed"), Some(time));
                    }
                }
                return Ok(());
            }
            KtEventKind::StepStart => step = "↳".on_white().to_string(),
            KtEventKind::Error => return Ok(()),
            KtEventKind::Other(_) => {}
        }

        if event.is_failed() {
            step = "X".bright_white().on_red().to_string();
        }

        let messages = &event.log_msg.msg_list;
        let first = messages.first().map(String::as_str).unwrap_or("");
        self.enqueue(
            format!("{}{} {}  {}-{}{}", prefix, step, first, event.event_type, event.status, CRLF),
            None,
            Some(test.item),
        );

        if event.is_failed() {
            if let Some(exception) = event.exceptions.first() {
                self.enqueue(format!("{}{}{}", spacer, exception.msg, CRLF), None, Some(test.item));
            }
        }

        for message in messages.iter().skip(1) {
            self.enqueue(format!("{}{} {}{}", spacer, step, message, CRLF), None, Some(test.item));
        }
        Ok(())
    }

    fn handle_mocha(&mut self, event: MochaEvent) -> Flow {
        match event {
            MochaEvent::Start(stats) => {
                tracing::debug!("Runner reports {} tests", stats.total);
            }
            MochaEvent::TestStart(t) => {
                self.ran_any_test = true;
                match self.tests.get(&t.full_title).cloned() {
                    Some(test) => self.start(&test),
                    None => {
                        tracing::debug!("No pending test named '{}'", t.full_title);
                        self.current_test = None;
                    }
                }
            }
            MochaEvent::Pass(t) => {
                self.enqueue_text(format!(" {} {}{}", "√".green(), t.full_title, CRLF));
                if let Some(test) = self.tests.remove(&t.full_title) {
                    if self.claim(test.item, false) {
                        self.host.passed(test.item, t.duration);
                    }
                    self.last_test = Some(test);
                }
            }
            MochaEvent::Fail(t) => self.handle_fail(t),
            MochaEvent::End(stats) => {
                tracing::debug!(
                    "Runner finished: {} passed, {} failed, {} pending",
                    stats.passes, stats.failures, stats.pending
                );
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn handle_fail(&mut self, t: MochaTest) {
        let id = t.full_title.clone();
        let mut target = self.tests.get(&id).cloned();
        let mut reassigned = false;
        // Hook failures go to the last finished test, or the first still pending
        if target.is_none() && id.contains("hook for") {
            target = self
                .last_test
                .clone()
                .or_else(|| self.tests.values().next().cloned());
            reassigned = target.is_some();
        }

        self.enqueue_text(format!("{}{}", format!(" x {}", id).red(), CRLF));

        let raw_err = t
            .stack
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| t.err.clone())
            .unwrap_or_default();
        let replaced = {
            let store = Arc::clone(&self.store);
            let text = force_crlf(&raw_err);
            spawn_shared(async move { replace_all_locations(&store, &text).await })
        };
        if !raw_err.is_empty() {
            let replaced = replaced.clone();
            let item = target.as_ref().map(|t| t.item);
            self.enqueue_deferred(async move {
                OutputLine {
                    text: replaced.await,
                    location: None,
                    item,
                }
            });
        }

        let Some(test) = target else { return };
        self.tests.remove(&id);
        self.last_test = Some(test.clone());
        if !self.claim(test.item, reassigned) {
            return;
        }

        let has_diff = match (&t.actual, &t.expected) {
            (Some(actual), Some(expected)) => !(is_undefined(actual) && is_undefined(expected)),
            _ => false,
        };
        let first_line = match (&test.uri, test.range) {
            (Some(uri), Some(range)) => Some(Location {
                uri: uri.clone(),
                range: Range::new(range.start, Position::new(range.start.line, 100)),
            }),
            _ => None,
        };

        let host = Arc::clone(&self.host);
        let store = Arc::clone(&self.store);
        self.blockers.spawn(async move {
            let location =
                try_derive_stack_location(&store, &raw_err, test.uri.as_deref(), test.range.as_ref()).await;
            let mut message = if has_diff {
                diff_message(&t)
            } else {
                match t.stack.as_deref().filter(|s| !s.is_empty()) {
                    Some(stack) => TestMessage::new(sourcemap_stack(&store, stack).await),
                    None => TestMessage::new(replaced.await),
                }
            };
            message.location = location.or(first_line);
            host.failed(test.item, message, t.duration);
        });
    }
}

fn is_undefined(value: &Value) -> bool {
    value.as_str() == Some("[undefined]")
}

fn output_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Wrap an assertion diff in a markdown code block when it has one.
fn try_make_markdown(message: &str) -> (String, bool) {
    let mut lines: Vec<&str> = message.split('\n').collect();
    let Some(start) = lines.iter().position(|l| l.contains("+ actual")) else {
        return (message.to_string(), false);
    };
    lines[start] = "```diff";
    lines.push("```");
    (lines.join("\n"), true)
}

fn diff_message(t: &MochaTest) -> TestMessage {
    let (text, is_markdown) = try_make_markdown(t.err.as_deref().unwrap_or(""));
    let mut message = TestMessage {
        message: text,
        is_markdown,
        actual_output: t.actual.as_ref().map(output_to_string),
        expected_output: t.expected.as_ref().map(output_to_string),
        ..Default::default()
    };
    if let Some(path) = &t.snapshot_path {
        message.context_value = Some(SNAPSHOT_CONTEXT_VALUE.to_string());
        let expected = message.expected_output.take().unwrap_or_default();
        message.expected_output = Some(format!("{}{}{}", expected, SNAPSHOT_COMMENT, path));
    }
    message.metadata = Some(json!({
        "expectedValue": t.expected_json,
        "actualValue": t.actual_json,
    }));
    message
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    let closed = cancel.wait_for(|c| *c).await.is_err();
    if closed {
        // No sender left, so the run can no longer be cancelled
        std::future::pending::<()>().await;
    }
}

/// Drive one test run: consume `scanner` events, report results for the
/// pending `tests` to `host`, and finalize.
///
/// The run stops on the runner's end event, a runner error, the end of the
/// event stream, or `cancel` turning true. Queued output and deferred
/// failure reports are drained before the scanner is disposed. Tests that
/// never reached a result are reported skipped and `end` is called exactly
/// once. Errors while handling an event are written to the run log.
pub async fn scan_test_output(
    tests: BTreeMap<String, PendingTest>,
    host: Arc<dyn TestRunHost>,
    mut scanner: OutputScanner,
    mut cancel: watch::Receiver<bool>,
    store: Arc<SourceMapStore>,
) {
    for test in tests.values() {
        host.enqueued(test.item);
    }
    tracing::info!("Reconciling test output for {} pending tests", tests.len());

    let items: Vec<NodeId> = tests.values().map(|t| t.item).collect();
    let (output, worker) = spawn_output_worker(Arc::clone(&host));
    let mut run = Reconciler {
        skipped: tests.values().map(|t| t.item).collect(),
        tests,
        resolved: HashSet::new(),
        host: Arc::clone(&host),
        store,
        output,
        blockers: JoinSet::new(),
        current_test: None,
        last_test: None,
        ran_any_test: false,
        dialect: None,
    };

    let cancelled_early = *cancel.borrow();
    if !cancelled_early {
        let cancelled = wait_for_cancel(&mut cancel);
        tokio::pin!(cancelled);

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut cancelled => {
                    tracing::info!("Test run cancelled");
                    break;
                }
                event = scanner.next_event() => event,
            };
            let Some(event) = event else { break };

            match run.handle(event) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => run.enqueue_text(format!("{}{}", e, CRLF)),
            }
        }
    }

    let Reconciler {
        skipped,
        resolved,
        ran_any_test,
        mut blockers,
        output,
        ..
    } = run;
    drop(output);

    if let Err(e) = worker.await {
        host.append_output(&format!("{}{}", e, CRLF), None, None);
    }
    while let Some(result) = blockers.join_next().await {
        if let Err(e) = result {
            host.append_output(&format!("{}{}", e, CRLF), None, None);
        }
    }

    if !cancelled_early && !ran_any_test {
        host.show_raw_output();
    }

    scanner.dispose();
    // Started tests cut off before a result are skipped along with the rest
    let interrupted: Vec<NodeId> = items
        .into_iter()
        .filter(|i| !resolved.contains(i) && !skipped.contains(i))
        .collect();
    for item in skipped.iter().chain(&interrupted) {
        host.skipped(*item);
    }
    host.end();
    tracing::info!(
        "Test run finished, {} skipped, {} interrupted",
        skipped.len(),
        interrupted.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locations::store::tests::write_generated;
    use crate::run::scanner::classify_line;
    use crate::tree::{ContentSource, FsContentSource, TestCase, TestNode, TestTree};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Enqueued(NodeId),
        Started(NodeId),
        Passed(NodeId, Option<f64>),
        Failed(NodeId, TestMessage, Option<f64>),
        Skipped(NodeId),
        Output(String, Option<Location>, Option<NodeId>),
        End,
        ShowRaw,
    }

    #[derive(Default)]
    struct MockHost(Mutex<Vec<Call>>);

    impl MockHost {
        fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().clone()
        }

        fn outputs(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Output(text, ..) => Some(text),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| pred(c)).count()
        }

        fn push(&self, call: Call) {
            self.0.lock().unwrap().push(call);
        }
    }

    impl TestRunHost for MockHost {
        fn enqueued(&self, item: NodeId) {
            self.push(Call::Enqueued(item));
        }
        fn started(&self, item: NodeId) {
            self.push(Call::Started(item));
        }
        fn passed(&self, item: NodeId, duration_ms: Option<f64>) {
            self.push(Call::Passed(item, duration_ms));
        }
        fn failed(&self, item: NodeId, message: TestMessage, duration_ms: Option<f64>) {
            self.push(Call::Failed(item, message, duration_ms));
        }
        fn skipped(&self, item: NodeId) {
            self.push(Call::Skipped(item));
        }
        fn append_output(&self, text: &str, location: Option<&Location>, item: Option<NodeId>) {
            self.push(Call::Output(text.to_string(), location.cloned(), item));
        }
        fn end(&self) {
            self.push(Call::End);
        }
        fn show_raw_output(&self) {
            self.push(Call::ShowRaw);
        }
    }

    const TEST_URI: &str = "file:///src/foo.ts";

    /// Pending tests named `names`, declared in [`TEST_URI`] lines 0..=10.
    fn pending(names: &[&str]) -> (TestTree, BTreeMap<String, PendingTest>) {
        let mut tree = TestTree::new();
        let mut map = BTreeMap::new();
        for name in names {
            let range = Range::new(Position::new(0, 0), Position::new(10, 0));
            let item = tree.create_item(
                *name,
                *name,
                Some(TEST_URI.to_string()),
                TestNode::Case(TestCase { name: name.to_string(), range }),
            );
            map.insert(
                name.to_string(),
                PendingTest { item, uri: Some(TEST_URI.to_string()), range: Some(range) },
            );
        }
        (tree, map)
    }

    fn feed(lines: &[String]) -> OutputScanner {
        let (tx, rx) = mpsc::unbounded_channel();
        for line in lines {
            tx.send(classify_line(line)).unwrap();
        }
        OutputScanner::from_events(rx)
    }

    fn store() -> Arc<SourceMapStore> {
        Arc::new(SourceMapStore::new(Arc::new(FsContentSource)))
    }

    async fn run(tests: BTreeMap<String, PendingTest>, lines: &[String]) -> Arc<MockHost> {
        let host = Arc::new(MockHost::default());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        scan_test_output(tests, host.clone(), feed(lines), cancel_rx, store()).await;
        host
    }

    fn kt(id: &str, event_type: i64, status: i64, messages: &[&str], extra: Value) -> String {
        let mut payload = json!({
            "_name": id,
            "_log_msg": {"_msg_list": messages},
            "_event_type": event_type,
            "_status": status,
        });
        if let (Some(obj), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
            obj.extend(extra.clone());
        }
        json!([id, payload]).to_string()
    }

    fn mocha(name: &str, payload: Value) -> String {
        json!([name, payload]).to_string()
    }

    #[tokio::test]
    async fn test_run_end_marks_passed_without_log_line() {
        let (_tree, tests) = pending(&["T1"]);
        let item = tests["T1"].item;
        let lines = vec![
            kt("T1", 32, 0, &["Starting"], json!({})),
            kt("T1", 33, 3, &["Done"], json!({"_return_values": ["[1, 1234]"]})),
        ];
        let host = run(tests, &lines).await;

        assert!(host.calls().contains(&Call::Passed(item, Some(1234.0))));
        let outputs = host.outputs();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].contains("[T1]"));
        assert!(outputs[0].ends_with(" Starting  32-0\r\n"));
        assert_eq!(host.count(|c| *c == Call::End), 1);
        assert_eq!(host.count(|c| matches!(c, Call::Skipped(_))), 0);
        assert_eq!(host.count(|c| *c == Call::ShowRaw), 0);
    }

    #[tokio::test]
    async fn test_run_end_failure() {
        let (_tree, tests) = pending(&["T1"]);
        let item = tests["T1"].item;
        let lines = vec![kt("T1", 33, 6, &[], json!({"_return_values": ["[3, 50]"]}))];
        let host = run(tests, &lines).await;

        assert!(host
            .calls()
            .contains(&Call::Failed(item, TestMessage::new("Test Failed"), Some(50.0))));
    }

    #[tokio::test]
    async fn test_failed_step_logs_exception_and_extra_lines() {
        let (_tree, tests) = pending(&["T7"]);
        let lines = vec![kt(
            "T7",
            31,
            6,
            &["Click login", "retrying"],
            json!({"_exceptions": [{"msg": "element missing", "screen": "", "stracktrace": []}]}),
        )];
        let host = run(tests, &lines).await;

        let outputs = host.outputs();
        assert_eq!(outputs.len(), 3);
        assert!(outputs[0].contains("X") && outputs[0].contains("Click login  31-6"));
        assert_eq!(outputs[1], format!("{}element missing\r\n", " ".repeat(7)));
        assert!(outputs[2].starts_with(&" ".repeat(7)) && outputs[2].ends_with(" retrying\r\n"));
    }

    #[tokio::test]
    async fn test_error_events_and_unknown_ids_are_silent() {
        let (_tree, tests) = pending(&["T1"]);
        let lines = vec![
            kt("T1", 30, 0, &["internal"], json!({})),
            kt("T999", 32, 0, &["other"], json!({})),
        ];
        let host = run(tests, &lines).await;
        assert!(host.outputs().is_empty());
        // Nothing started: raw output is surfaced and the test is skipped
        assert_eq!(host.count(|c| *c == Call::ShowRaw), 1);
        assert_eq!(host.count(|c| matches!(c, Call::Skipped(_))), 1);
    }

    #[tokio::test]
    async fn test_named_dialect_flow() {
        let (_tree, tests) = pending(&["a passes", "b fails", "c never runs"]);
        let (a, b, c) = (tests["a passes"].item, tests["b fails"].item, tests["c never runs"].item);
        let lines = vec![
            mocha("start", json!({"total": 3})),
            mocha("testStart", json!({"title": "passes", "fullTitle": "a passes"})),
            mocha("pass", json!({"title": "passes", "fullTitle": "a passes", "duration": 5})),
            mocha("testStart", json!({"title": "fails", "fullTitle": "b fails"})),
            mocha("fail", json!({
                "title": "fails",
                "fullTitle": "b fails",
                "duration": 7,
                "err": "expected 1 to equal 2\n+ actual - expected\n-2\n+1",
                "stack": null,
                "expected": 2,
                "actual": 1,
                "expectedJSON": 2,
                "actualJSON": 1
            })),
            mocha("end", json!({"tests": 3, "passes": 1, "failures": 1})),
            "after end".to_string(),
        ];
        let host = run(tests, &lines).await;
        let calls = host.calls();

        assert!(calls.contains(&Call::Started(a)));
        assert!(calls.contains(&Call::Passed(a, Some(5.0))));
        let failed = calls
            .iter()
            .find_map(|c| match c {
                Call::Failed(item, msg, d) if *item == b => Some((msg.clone(), *d)),
                _ => None,
            })
            .unwrap();
        assert_eq!(failed.1, Some(7.0));
        assert!(failed.0.is_markdown);
        assert!(failed.0.message.contains("```diff"));
        assert_eq!(failed.0.expected_output.as_deref(), Some("2"));
        assert_eq!(failed.0.actual_output.as_deref(), Some("1"));
        assert_eq!(failed.0.metadata, Some(json!({"expectedValue": 2, "actualValue": 1})));
        // No frames to resolve: falls back to the test's first line
        let location = failed.0.location.unwrap();
        assert_eq!(location.uri, TEST_URI);
        assert_eq!(location.range.end, Position::new(0, 100));

        assert!(calls.contains(&Call::Skipped(c)));
        assert_eq!(host.count(|c| matches!(c, Call::Skipped(_))), 1);
        assert_eq!(calls.last(), Some(&Call::End));
        assert!(!host.outputs().iter().any(|o| o.contains("after end")));
    }

    #[tokio::test]
    async fn test_hook_failure_goes_to_last_test() {
        let (_tree, tests) = pending(&["s one", "s two"]);
        let one = tests["s one"].item;
        let lines = vec![
            mocha("testStart", json!({"fullTitle": "s one"})),
            mocha("pass", json!({"fullTitle": "s one", "duration": 1})),
            mocha("fail", json!({"fullTitle": "\"after each\" hook for \"one\"", "err": "cleanup broke"})),
        ];
        let host = run(tests, &lines).await;

        let failed: Vec<_> = host
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Failed(item, msg, _) => Some((item, msg.message)),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![(one, "cleanup broke".to_string())]);
        assert!(host.outputs().iter().any(|o| o.contains("cleanup broke")));
    }

    #[tokio::test]
    async fn test_hook_failure_before_any_test_goes_to_first_pending() {
        let (_tree, tests) = pending(&["s one", "s two"]);
        let one = tests["s one"].item;
        let two = tests["s two"].item;
        let lines = vec![mocha("fail", json!({"fullTitle": "\"before all\" hook for \"one\"", "err": "setup"}))];
        let host = run(tests, &lines).await;

        assert_eq!(host.count(|c| matches!(c, Call::Failed(i, ..) if *i == one)), 1);
        assert!(host.calls().contains(&Call::Skipped(two)));
        assert!(!host.calls().contains(&Call::Skipped(one)));
    }

    #[tokio::test]
    async fn test_failure_stack_is_source_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let generated = write_generated(dir.path(), "foo.js", TEST_URI);
        let (_tree, tests) = pending(&["t"]);
        let item = tests["t"].item;
        let stack = format!("Error: nope\n    at Context ({}:10:5)", generated);
        let lines = vec![
            mocha("testStart", json!({"fullTitle": "t"})),
            mocha("fail", json!({"fullTitle": "t", "err": "nope", "stack": stack})),
        ];
        let host = run(tests, &lines).await;

        let message = host
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::Failed(i, msg, _) if i == item => Some(msg),
                _ => None,
            })
            .unwrap();
        assert!(message.message.contains("file:///src/foo.ts#L4:3"));
        let location = message.location.unwrap();
        assert_eq!(location.uri, TEST_URI);
        assert_eq!(location.range.start, Position::new(3, 2));

        // The log line uses the plain replaced form
        assert!(host
            .outputs()
            .iter()
            .any(|o| o == "Error: nope\r\n    at Context (file:///src/foo.ts:4:3)"));
    }

    #[tokio::test]
    async fn test_output_order_preserved_across_deferred_lines() {
        let dir = tempfile::tempdir().unwrap();
        let generated = write_generated(dir.path(), "foo.js", TEST_URI);
        let (_tree, tests) = pending(&["t"]);
        let item = tests["t"].item;
        let lines = vec![
            mocha("testStart", json!({"fullTitle": "t"})),
            format!(r#""hello at {}:10:5", source: {} (10)"#, generated, generated),
            "plain after".to_string(),
        ];
        let host = run(tests, &lines).await;

        let outputs: Vec<_> = host
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Output(text, location, owner) => Some((text, location, owner)),
                _ => None,
            })
            .collect();
        assert_eq!(outputs[0].0, "hello at file:///src/foo.ts:4:3\r\n");
        assert_eq!(outputs[0].1.as_ref().map(|l| l.uri.as_str()), Some(TEST_URI));
        assert_eq!(outputs[0].2, Some(item));
        assert_eq!(outputs[1].0, "plain after\r\n");
    }

    #[tokio::test]
    async fn test_cancellation_skips_pending_without_waiting() {
        let (_tree, tests) = pending(&["x", "y"]);
        let (x, y) = (tests["x"].item, tests["y"].item);
        let host = Arc::new(MockHost::default());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        // Keep the sender alive so the stream never ends on its own
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let scanner = OutputScanner::from_events(events_rx);

        let handle = tokio::spawn(scan_test_output(tests, host.clone(), scanner, cancel_rx, store()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        let calls = host.calls();
        assert!(calls.contains(&Call::Skipped(x)));
        assert!(calls.contains(&Call::Skipped(y)));
        assert_eq!(host.count(|c| *c == Call::End), 1);
    }

    /// Delays every read, keeping location lookups in flight.
    struct SlowSource(Duration);

    #[async_trait::async_trait]
    impl ContentSource for SlowSource {
        async fn get_content(&self, path: &std::path::Path) -> crate::Result<String> {
            tokio::time::sleep(self.0).await;
            FsContentSource.get_content(path).await
        }
    }

    #[tokio::test]
    async fn test_cancellation_waits_for_pending_failure_location() {
        let dir = tempfile::tempdir().unwrap();
        let generated = write_generated(dir.path(), "foo.js", TEST_URI);
        let (_tree, tests) = pending(&["t"]);
        let item = tests["t"].item;
        let stack = format!("Error: nope\n    at Context ({}:10:5)", generated);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        for line in [
            mocha("testStart", json!({"fullTitle": "t"})),
            mocha("fail", json!({"fullTitle": "t", "err": "nope", "stack": stack})),
        ] {
            events_tx.send(classify_line(&line)).unwrap();
        }

        let host = Arc::new(MockHost::default());
        let store = Arc::new(SourceMapStore::new(Arc::new(SlowSource(Duration::from_millis(300)))));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(scan_test_output(
            tests,
            host.clone(),
            OutputScanner::from_events(events_rx),
            cancel_rx,
            store,
        ));

        while !host.calls().contains(&Call::Started(item)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(host.count(|c| matches!(c, Call::Failed(..))), 0);
        cancel_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        let calls = host.calls();
        let failed_at = calls
            .iter()
            .position(|c| matches!(c, Call::Failed(i, ..) if *i == item))
            .expect("failure reported");
        let end_at = calls.iter().position(|c| *c == Call::End).unwrap();
        assert!(failed_at < end_at);
        let Call::Failed(_, message, _) = &calls[failed_at] else { unreachable!() };
        let location = message.location.as_ref().unwrap();
        assert_eq!(location.uri, TEST_URI);
        assert_eq!(location.range.start, Position::new(3, 2));
        assert!(!calls.contains(&Call::Skipped(item)));
        drop(events_tx);
    }

    #[tokio::test]
    async fn test_null_actual_value_still_builds_diff() {
        let (_tree, tests) = pending(&["t"]);
        let item = tests["t"].item;
        let lines = vec![
            mocha("testStart", json!({"fullTitle": "t"})),
            mocha("fail", json!({
                "fullTitle": "t",
                "err": "expected null to equal 1",
                "stack": null,
                "expected": 1,
                "actual": null
            })),
        ];
        let host = run(tests, &lines).await;

        let message = host
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::Failed(i, msg, _) if i == item => Some(msg),
                _ => None,
            })
            .unwrap();
        assert_eq!(message.actual_output.as_deref(), Some("null"));
        assert_eq!(message.expected_output.as_deref(), Some("1"));
        assert_eq!(message.message, "expected null to equal 1");
    }

    #[tokio::test]
    async fn test_already_cancelled_run_still_finalizes() {
        let (_tree, tests) = pending(&["x"]);
        let host = Arc::new(MockHost::default());
        let (_cancel_tx, cancel_rx) = watch::channel(true);
        let lines = vec![mocha("testStart", json!({"fullTitle": "x"}))];
        scan_test_output(tests, host.clone(), feed(&lines), cancel_rx, store()).await;

        assert_eq!(host.count(|c| matches!(c, Call::Started(_))), 0);
        assert_eq!(host.count(|c| matches!(c, Call::Skipped(_))), 1);
        assert_eq!(host.count(|c| *c == Call::ShowRaw), 0);
        assert_eq!(host.calls().last(), Some(&Call::End));
    }

    #[tokio::test]
    async fn test_runner_error_ends_run() {
        let (_tree, tests) = pending(&["x"]);
        let lines = vec![
            "Traceback (most recent call last):".to_string(),
        ];
        let (tx, rx) = mpsc::unbounded_channel();
        for line in &lines {
            tx.send(classify_line(line)).unwrap();
        }
        tx.send(ScannerEvent::RunnerError("Test process exited with code 1".to_string())).unwrap();
        tx.send(ScannerEvent::Output("late".to_string())).unwrap();

        let host = Arc::new(MockHost::default());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        scan_test_output(tests, host.clone(), OutputScanner::from_events(rx), cancel_rx, store()).await;

        assert_eq!(
            host.outputs(),
            vec![
                "Traceback (most recent call last):\r\n".to_string(),
                "Test process exited with code 1\r\n".to_string(),
            ]
        );
        assert_eq!(host.count(|c| *c == Call::ShowRaw), 1);
        assert_eq!(host.count(|c| matches!(c, Call::Skipped(_))), 1);
    }

    #[tokio::test]
    async fn test_second_dialect_is_ignored_with_diagnostic() {
        let (_tree, tests) = pending(&["T1", "m"]);
        let t1 = tests["T1"].item;
        let m = tests["m"].item;
        let lines = vec![
            kt("T1", 32, 0, &["go"], json!({})),
            mocha("testStart", json!({"fullTitle": "m"})),
            mocha("pass", json!({"fullTitle": "m"})),
        ];
        let host = run(tests, &lines).await;

        assert!(host.calls().contains(&Call::Started(t1)));
        assert!(!host.calls().contains(&Call::Started(m)));
        assert_eq!(
            host.outputs()
                .iter()
                .filter(|o| o.starts_with("Ignoring named-dialect event"))
                .count(),
            2
        );
        assert!(host.calls().contains(&Call::Skipped(t1)));
        assert!(host.calls().contains(&Call::Skipped(m)));
    }

    #[tokio::test]
    async fn test_malformed_event_is_logged_and_run_continues() {
        let (_tree, tests) = pending(&["T1"]);
        let item = tests["T1"].item;
        let lines = vec![
            kt("T1", 33, 0, &[], json!({"_return_values": ["not json"]})),
            kt("T1", 33, 0, &[], json!({"_return_values": ["[1, 9]"]})),
        ];
        let host = run(tests, &lines).await;

        assert!(host.outputs()[0].starts_with("JSON error"));
        assert!(host.calls().contains(&Call::Passed(item, Some(9.0))));
    }

    #[tokio::test]
    async fn test_every_pending_item_gets_one_terminal_status() {
        let (_tree, tests) = pending(&["a", "b", "c"]);
        let items: Vec<NodeId> = tests.values().map(|t| t.item).collect();
        let lines = vec![
            mocha("testStart", json!({"fullTitle": "a"})),
            mocha("pass", json!({"fullTitle": "a"})),
            mocha("pass", json!({"fullTitle": "a"})),
            mocha("testStart", json!({"fullTitle": "b"})),
            mocha("fail", json!({"fullTitle": "b", "err": "x"})),
            mocha("fail", json!({"fullTitle": "b", "err": "x"})),
        ];
        let host = run(tests, &lines).await;

        for item in items {
            let terminal = host.count(|c| {
                matches!(c, Call::Passed(i, _) | Call::Failed(i, _, _) | Call::Skipped(i) if *i == item)
            });
            assert_eq!(terminal, 1, "item {} has {} terminal statuses", item, terminal);
        }
        assert_eq!(host.count(|c| *c == Call::End), 1);
        assert_eq!(host.count(|c| matches!(c, Call::Enqueued(_))), 3);
    }

    #[test]
    fn test_try_make_markdown() {
        let (text, md) = try_make_markdown("expected\n+ actual - expected\n-a\n+b");
        assert!(md);
        assert_eq!(text, "expected\n```diff\n-a\n+b\n```");

        let (text, md) = try_make_markdown("plain failure");
        assert!(!md);
        assert_eq!(text, "plain failure");
    }

    #[test]
    fn test_snapshot_diff_message() {
        let t = MochaTest {
            err: Some("mismatch".to_string()),
            expected: Some(json!({"a": 1})),
            actual: Some(json!("[undefined]")),
            snapshot_path: Some("/snaps/x.snap".to_string()),
            ..Default::default()
        };
        let message = diff_message(&t);
        assert_eq!(message.context_value.as_deref(), Some(SNAPSHOT_CONTEXT_VALUE));
        assert_eq!(
            message.expected_output.as_deref(),
            Some("{\n  \"a\": 1\n}\n\n// snapshot: /snaps/x.snap")
        );
        assert_eq!(message.actual_output.as_deref(), Some("[undefined]"));
    }
}
