use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use walkdir::{DirEntry, WalkDir};

use crate::config::BridgeSettings;
use crate::locations::file_uri;
use super::*;

/// A test case awaiting a result in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTest {
    pub item: NodeId,
    pub uri: Option<String>,
    pub range: Option<Range>,
}

/// Compile a simple file glob (`*.py`) into a regex source.
///
/// Only the first `*` and the first `.` are rewritten.
pub fn glob_to_regex(pattern: &str) -> String {
    pattern.replacen('*', r"\w+", 1).replacen('.', "[.]", 1)
}

/// Display range of a declaration, converting its 1-indexed first line.
pub fn declaration_range(span: Option<&SourceSpan>) -> Range {
    let span = span.copied().unwrap_or_default();
    let start = Position::new(
        span.first_line.map(|l| l.saturating_sub(1)).unwrap_or(1),
        span.first_column.unwrap_or(0),
    );
    let end = Position::new(
        span.last_line.unwrap_or(1),
        span.last_column.unwrap_or(1),
    );
    Range::new(start, end)
}

/// Discovers and refreshes test nodes in a [`TestTree`].
pub struct TreeBuilder {
    source: Arc<dyn ContentSource>,
    parser: Arc<dyn ClassParser>,
    workspace_root: Option<PathBuf>,
    test_folder: String,
    test_case_marker: String,
    excluded_dir_markers: Vec<String>,
    file_pattern: Regex,
}

impl TreeBuilder {
    pub fn new(settings: &BridgeSettings) -> crate::Result<Self> {
        Ok(Self {
            source: Arc::new(FsContentSource),
            parser: Arc::new(PythonClassParser),
            workspace_root: None,
            test_folder: settings.test_folder.clone(),
            test_case_marker: settings.test_case_marker.clone(),
            excluded_dir_markers: settings.excluded_dir_markers.clone(),
            file_pattern: Regex::new(&glob_to_regex(&settings.test_file_glob))?,
        })
    }

    pub fn with_content_source(mut self, source: Arc<dyn ContentSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn ClassParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn content_source(&self) -> Arc<dyn ContentSource> {
        Arc::clone(&self.source)
    }

    /// Whether a registered leaf path should become a file node.
    pub fn is_test_file_path(&self, path: &str) -> bool {
        self.file_pattern
            .find(path)
            .map(|m| m.start() > 0)
            .unwrap_or(false)
    }

    /// Owned form of [`Self::is_test_file_path`] for change filters.
    pub fn test_file_matcher(&self) -> impl Fn(&Path) -> bool + Send + Sync + 'static {
        let pattern = self.file_pattern.clone();
        move |path: &Path| {
            pattern
                .find(&path.to_string_lossy())
                .is_some_and(|m| m.start() > 0)
        }
    }

    fn admits(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() {
            !name.starts_with('.')
                && !self
                    .excluded_dir_markers
                    .iter()
                    .any(|m| name.contains(m.as_str()))
        } else {
            !name.starts_with('_') && !name.starts_with('.')
        }
    }

    /// Build the suite for `dir`, with every admitted subdirectory and file
    /// below it. Files are read and parsed before this returns. The returned
    /// node is detached; attach it with [`TestTree::add_root`] or
    /// [`TestTree::add_child`].
    pub async fn build_tree(&self, tree: &mut TestTree, dir: &Path) -> crate::Result<NodeId> {
        if !dir.is_dir() {
            return Err(crate::Error::NotADirectory(dir.display().to_string()));
        }

        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dir.display().to_string());
        let root = tree.create_item(
            file_uri(dir),
            dir_name.clone(),
            Some(file_uri(dir)),
            TestNode::Suite(TestSuite { name: dir_name }),
        );

        let mut suites: HashMap<PathBuf, NodeId> = HashMap::from([(dir.to_path_buf(), root)]);
        let mut files = Vec::new();

        for entry in WalkDir::new(dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| self.admits(e))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry under {}: {}", dir.display(), e);
                    continue;
                }
            };
            let path = entry.path();
            let Some(parent) = path.parent().and_then(|p| suites.get(p)).copied() else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().to_string();

            if entry.file_type().is_dir() {
                let suite = tree.create_item(
                    file_uri(path),
                    name.clone(),
                    Some(file_uri(path)),
                    TestNode::Suite(TestSuite { name }),
                );
                tree.add_child(parent, suite);
                suites.insert(path.to_path_buf(), suite);
            } else if entry.file_type().is_file() {
                let file = TestFile::new(path, self.workspace_root.clone());
                let id = tree.create_item(file.id(), file.label(), Some(file.uri()), TestNode::File(file));
                tree.add_child(parent, id);
                files.push(id);
            }
        }

        tracing::debug!("Discovered {} files under {}", files.len(), dir.display());
        for file in files {
            self.update_from_disk(tree, file).await;
        }

        Ok(root)
    }

    /// Re-read a file node from its content source. A failed read is
    /// recorded on the item and leaves existing children in place.
    pub async fn update_from_disk(&self, tree: &mut TestTree, file: NodeId) {
        let path = match tree.node(file) {
            Some(TestNode::File(f)) => f.path.clone(),
            _ => return,
        };

        match self.source.get_content(&path).await {
            Ok(content) => {
                if let Some(item) = tree.item_mut(file) {
                    item.error = None;
                }
                self.update_from_contents(tree, file, &content);
            }
            Err(e) => {
                tracing::warn!("Error providing tests for {}: {}", path.display(), e);
                if let Some(item) = tree.item_mut(file) {
                    item.error = Some(e.to_string());
                }
            }
        }
    }

    /// Replace the case children of a file node with the test classes found
    /// in `content`. Returns the retained declarations, or `None` when the
    /// content failed to parse (children are then left untouched).
    pub fn update_from_contents(
        &self,
        tree: &mut TestTree,
        file: NodeId,
        content: &str,
    ) -> Option<Vec<Declaration>> {
        let uri = match tree.node(file) {
            Some(TestNode::File(f)) => f.uri(),
            _ => return None,
        };

        let declarations = match self.parser.parse(content) {
            Ok(d) => d,
            Err(e) => {
                if let Some(item) = tree.item_mut(file) {
                    item.error = Some(e.to_string());
                }
                return None;
            }
        };

        let tests: Vec<Declaration> = declarations
            .into_iter()
            .filter(|d| d.extends(&self.test_case_marker))
            .collect();

        tree.clear_children(file);
        for decl in &tests {
            let range = declaration_range(decl.location.as_ref());
            let case = tree.create_item(
                decl.name.clone(),
                decl.name.clone(),
                Some(uri.clone()),
                TestNode::Case(TestCase { name: decl.name.clone(), range }),
            );
            tree.add_child(file, case);
        }

        if let Some(item) = tree.item_mut(file) {
            item.error = None;
        }
        if let Some(TestNode::File(f)) = tree.node_mut(file) {
            f.has_been_read = true;
        }

        Some(tests)
    }

    /// Find the node for `file` by walking `segments` (its path relative to
    /// the workspace root) label by label, creating missing suites on the
    /// way. Registering the same path twice returns the same node.
    pub fn get_or_create_nested(
        &self,
        tree: &mut TestTree,
        file: TestFile,
        segments: &[String],
    ) -> Option<NodeId> {
        let mut dir = file
            .path
            .ancestors()
            .nth(segments.len())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut parent: Option<NodeId> = None;

        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();

            if let Some(existing) = tree.find_by_label(parent, segment) {
                if last {
                    return Some(existing);
                }
                dir.push(segment);
                parent = Some(existing);
                continue;
            }

            if !last {
                dir.push(segment);
                let suite = tree.create_item(
                    file_uri(&dir),
                    segment.clone(),
                    Some(file_uri(&dir)),
                    TestNode::Suite(TestSuite { name: segment.clone() }),
                );
                attach(tree, parent, suite);
                parent = Some(suite);
                continue;
            }

            let is_test_file = self.is_test_file_path(&file.path.to_string_lossy());
            let (id, label, uri) = (file.id(), file.label(), Some(file.uri()));
            let node = if is_test_file {
                TestNode::File(file)
            } else {
                TestNode::Suite(TestSuite { name: segment.clone() })
            };
            let created = tree.create_item(id, label, uri, node);
            attach(tree, parent, created);
            return Some(created);
        }

        None
    }

    /// Register a path reported by the workspace (file watcher, open
    /// document). Paths outside the test folder, package internals and
    /// compiled files are ignored.
    pub fn get_or_create_file(&self, tree: &mut TestTree, path: &Path) -> Option<NodeId> {
        let path_str = path.to_string_lossy();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if !path_str.contains(&format!("{}/", self.test_folder))
            || name.contains("__")
            || name.ends_with("pyc")
            || self
                .excluded_dir_markers
                .iter()
                .any(|m| path_str.contains(m.as_str()))
        {
            return None;
        }

        let root = self.workspace_root.as_ref()?;
        let relative = path.strip_prefix(root).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();

        let file = TestFile::new(path, Some(root.clone()));
        self.get_or_create_nested(tree, file, &segments)
    }

    /// Drop the node bound to a deleted file. Returns whether one existed.
    pub fn remove_file(&self, tree: &mut TestTree, path: &Path) -> bool {
        match tree.find_file(path) {
            Some(id) => {
                tree.remove(id);
                true
            }
            None => false,
        }
    }

    /// Map every test case under `include` (all roots when empty) by full
    /// name. Files not read yet are read first.
    pub async fn pending_tests(
        &self,
        tree: &mut TestTree,
        include: &[NodeId],
    ) -> BTreeMap<String, PendingTest> {
        let start = if include.is_empty() {
            tree.roots().to_vec()
        } else {
            include.to_vec()
        };
        let mut queue = vec![start];
        let mut pending = BTreeMap::new();

        while let Some(batch) = queue.pop() {
            for id in batch {
                let (unread_file, full_name) = match tree.node(id) {
                    Some(TestNode::File(f)) => (!f.has_been_read, None),
                    Some(node @ TestNode::Case(_)) => (false, Some(node.full_name())),
                    Some(TestNode::Suite(_)) => (false, None),
                    None => continue,
                };

                if let Some(full_name) = full_name {
                    let Some(item) = tree.item(id) else { continue };
                    let test = PendingTest {
                        item: id,
                        uri: item.uri.clone(),
                        range: item.range,
                    };
                    if let Some(previous) = pending.insert(full_name.clone(), test) {
                        tracing::warn!(
                            "Test name '{}' is declared more than once; {} shadows {}",
                            full_name, id, previous.item
                        );
                    }
                    continue;
                }

                if unread_file {
                    self.update_from_disk(tree, id).await;
                }
                queue.push(tree.children(id).to_vec());
            }
        }

        pending
    }
}

fn attach(tree: &mut TestTree, parent: Option<NodeId>, child: NodeId) {
    match parent {
        Some(p) => tree.add_child(p, child),
        None => tree.add_root(child),
    }
}

/// Ids of the leaf items under `include`, the list handed to the runner.
pub fn leaf_test_ids(tree: &TestTree, include: &[NodeId]) -> Vec<String> {
    fn visit(tree: &TestTree, id: NodeId, out: &mut Vec<String>) {
        let Some(item) = tree.item(id) else { return };
        if item.can_resolve_children {
            for &child in tree.children(id) {
                visit(tree, child, out);
            }
        } else {
            out.push(item.id.clone());
        }
    }

    let mut ids = Vec::new();
    for &id in include {
        visit(tree, id, &mut ids);
    }
    ids
}
