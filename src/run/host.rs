use serde::Serialize;
use serde_json::Value;

use crate::locations::Location;
use crate::tree::NodeId;

/// A failure message attached to a test result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMessage {
    pub message: String,
    /// `message` is markdown rather than plain text.
    pub is_markdown: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Machine-readable expected/actual values for diff tooling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TestMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// The run-result surface a reconciler reports to.
///
/// Items are the [`NodeId`]s of the tree the pending map was built from.
/// Durations are in milliseconds.
pub trait TestRunHost: Send + Sync {
    fn enqueued(&self, _item: NodeId) {}
    fn started(&self, item: NodeId);
    fn passed(&self, item: NodeId, duration_ms: Option<f64>);
    fn failed(&self, item: NodeId, message: TestMessage, duration_ms: Option<f64>);
    fn skipped(&self, item: NodeId);
    fn append_output(&self, text: &str, location: Option<&Location>, item: Option<NodeId>);
    fn end(&self);

    /// Called when a run ends without any test having started.
    fn show_raw_output(&self) {}
}
