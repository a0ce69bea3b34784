//! Discovered test hierarchy.
//!
//! Domain nodes ([`TestNode`]) and the presentation-side item data
//! ([`TestItem`]) live side by side in one arena owned by [`TestTree`].
//! A [`NodeId`] is the stable handle hosts hold on to; it stays valid until
//! the node (or an ancestor) is removed.

pub mod builder;
pub mod content;
pub mod parser;

use std::path::{Path, PathBuf};
use serde::Serialize;

pub use builder::{leaf_test_ids, PendingTest, TreeBuilder};
pub use content::{ContentSource, FsContentSource};
pub use parser::{ClassParser, Declaration, PythonClassParser, SourceSpan};

/// Zero-based line/character position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    /// Builds a range, swapping the ends if they are given in reverse.
    pub fn new(start: Position, end: Position) -> Self {
        if end < start {
            Self { start: end, end: start }
        } else {
            Self { start, end }
        }
    }

    pub fn contains_position(&self, pos: Position) -> bool {
        self.start <= pos && pos <= self.end
    }

    pub fn contains(&self, other: &Range) -> bool {
        self.contains_position(other.start) && self.contains_position(other.end)
    }
}

/// Stable handle of a node in a [`TestTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A directory, or a leaf path that did not look like a test file.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSuite {
    pub name: String,
}

/// A source file that may declare test cases.
#[derive(Debug, Clone, PartialEq)]
pub struct TestFile {
    pub path: PathBuf,
    pub workspace_folder: Option<PathBuf>,
    /// Set once a read and parse of the file succeeded.
    pub has_been_read: bool,
}

impl TestFile {
    pub fn new(path: impl Into<PathBuf>, workspace_folder: Option<PathBuf>) -> Self {
        Self {
            path: path.into(),
            workspace_folder,
            has_been_read: false,
        }
    }

    pub fn uri(&self) -> String {
        crate::locations::file_uri(&self.path)
    }

    pub fn id(&self) -> String {
        self.uri().to_lowercase()
    }

    pub fn label(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// A class declaration recognised as a test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TestNode {
    Suite(TestSuite),
    File(TestFile),
    Case(TestCase),
}

impl TestNode {
    pub fn name(&self) -> String {
        match self {
            TestNode::Suite(s) => s.name.clone(),
            TestNode::File(f) => f.label(),
            TestNode::Case(c) => c.name.clone(),
        }
    }

    /// Identity used to match output events against pending tests.
    ///
    /// This is the bare name: two same-named classes in different files
    /// share a full name.
    pub fn full_name(&self) -> String {
        self.name()
    }

    pub fn range(&self) -> Option<Range> {
        match self {
            TestNode::Case(c) => Some(c.range),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TestNode::Suite(_) => "suite",
            TestNode::File(_) => "file",
            TestNode::Case(_) => "case",
        }
    }
}

/// Host-facing data for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct TestItem {
    pub id: String,
    pub label: String,
    pub uri: Option<String>,
    pub range: Option<Range>,
    pub error: Option<String>,
    pub can_resolve_children: bool,
}

struct Slot {
    item: TestItem,
    node: TestNode,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena of test nodes.
#[derive(Default)]
pub struct TestTree {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    roots: Vec<NodeId>,
}

impl TestTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a detached node. Attach it with [`add_child`](Self::add_child)
    /// or [`add_root`](Self::add_root).
    pub fn create_item(
        &mut self,
        id: impl Into<String>,
        label: impl Into<String>,
        uri: Option<String>,
        node: TestNode,
    ) -> NodeId {
        let can_resolve_children = !matches!(node, TestNode::Case(_));
        let slot = Slot {
            item: TestItem {
                id: id.into(),
                label: label.into(),
                uri,
                range: node.range(),
                error: None,
                can_resolve_children,
            },
            node,
            parent: None,
            children: Vec::new(),
        };

        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                NodeId(index)
            }
            None => {
                self.slots.push(Some(slot));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    /// Attach `child` under `parent`. A sibling with the same item id is
    /// replaced, taking its subtree with it.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        let child_id = self.item(child).map(|i| i.id.clone()).unwrap_or_default();
        let existing = self
            .children(parent)
            .iter()
            .copied()
            .find(|&c| c != child && self.item(c).map(|i| i.id == child_id).unwrap_or(false));
        if let Some(old) = existing {
            self.remove(old);
        }

        self.detach(child);
        if let Some(slot) = self.slot_mut(child) {
            slot.parent = Some(parent);
        }
        if let Some(slot) = self.slot_mut(parent) {
            slot.children.push(child);
        }
    }

    /// Attach `node` at the top level, replacing a root with the same item id.
    pub fn add_root(&mut self, node: NodeId) {
        let node_id = self.item(node).map(|i| i.id.clone()).unwrap_or_default();
        let existing = self
            .roots
            .iter()
            .copied()
            .find(|&r| r != node && self.item(r).map(|i| i.id == node_id).unwrap_or(false));
        if let Some(old) = existing {
            self.remove(old);
        }

        self.detach(node);
        self.roots.push(node);
    }

    /// Remove a node and its whole subtree, releasing their handles.
    pub fn remove(&mut self, id: NodeId) {
        if self.slot(id).is_none() {
            return;
        }
        self.detach(id);

        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(slot) = self.slots.get_mut(next.0).and_then(Option::take) {
                stack.extend(slot.children);
                self.free.push(next.0);
            }
        }
    }

    /// Remove every child of `id`, keeping `id` itself.
    pub fn clear_children(&mut self, id: NodeId) {
        for child in self.children(id).to_vec() {
            self.remove(child);
        }
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.slot(id).is_some()
    }

    pub fn item(&self, id: NodeId) -> Option<&TestItem> {
        self.slot(id).map(|s| &s.item)
    }

    pub fn item_mut(&mut self, id: NodeId) -> Option<&mut TestItem> {
        self.slot_mut(id).map(|s| &mut s.item)
    }

    pub fn node(&self, id: NodeId) -> Option<&TestNode> {
        self.slot(id).map(|s| &s.node)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut TestNode> {
        self.slot_mut(id).map(|s| &mut s.node)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.slot(id).and_then(|s| s.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.slot(id).map(|s| s.children.as_slice()).unwrap_or(&[])
    }

    /// Children of `parent`, or the roots when `parent` is `None`.
    pub fn collection(&self, parent: Option<NodeId>) -> &[NodeId] {
        match parent {
            Some(p) => self.children(p),
            None => &self.roots,
        }
    }

    pub fn find_by_label(&self, parent: Option<NodeId>, label: &str) -> Option<NodeId> {
        self.collection(parent)
            .iter()
            .copied()
            .find(|&c| self.item(c).map(|i| i.label == label).unwrap_or(false))
    }

    /// Find the file node bound to `path`.
    pub fn find_file(&self, path: &Path) -> Option<NodeId> {
        self.slots.iter().enumerate().find_map(|(index, slot)| match slot {
            Some(Slot { node: TestNode::File(f), .. }) if f.path == path => Some(NodeId(index)),
            _ => None,
        })
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializable snapshot of the subtree under `id`.
    pub fn snapshot(&self, id: NodeId) -> Option<TreeSnapshot> {
        let slot = self.slot(id)?;
        Some(TreeSnapshot {
            id: slot.item.id.clone(),
            label: slot.item.label.clone(),
            kind: slot.node.kind(),
            range: slot.item.range,
            error: slot.item.error.clone(),
            children: slot
                .children
                .iter()
                .filter_map(|&c| self.snapshot(c))
                .collect(),
        })
    }

    fn detach(&mut self, id: NodeId) {
        let parent = self.slot(id).and_then(|s| s.parent);
        match parent {
            Some(p) => {
                if let Some(slot) = self.slot_mut(p) {
                    slot.children.retain(|&c| c != id);
                }
            }
            None => self.roots.retain(|&r| r != id),
        }
        if let Some(slot) = self.slot_mut(id) {
            slot.parent = None;
        }
    }

    fn slot(&self, id: NodeId) -> Option<&Slot> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: NodeId) -> Option<&mut Slot> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    pub id: String,
    pub label: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeSnapshot>,
}
