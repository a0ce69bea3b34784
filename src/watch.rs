//! Debounced batching of file change notifications for continuous runs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::BridgeSettings;
use crate::tree::{NodeId, TestTree, TreeBuilder};

/// A file that was created, modified or deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub removed: bool,
}

impl FileChange {
    pub fn changed(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), removed: false }
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), removed: true }
    }
}

/// Changes accumulated over one quiet period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub changed: BTreeSet<PathBuf>,
    pub removed: BTreeSet<PathBuf>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    fn record(&mut self, change: FileChange) {
        if change.removed {
            self.changed.remove(&change.path);
            self.removed.insert(change.path);
        } else {
            self.removed.remove(&change.path);
            self.changed.insert(change.path);
        }
    }

    /// Apply the batch to `tree`: removed files are dropped, changed files
    /// are registered and re-read. Returns the file nodes to re-run.
    pub async fn apply(&self, builder: &TreeBuilder, tree: &mut TestTree) -> Vec<NodeId> {
        for path in &self.removed {
            builder.remove_file(tree, path);
        }

        let mut files = Vec::new();
        for path in &self.changed {
            let Some(file) = builder.get_or_create_file(tree, path) else {
                continue;
            };
            builder.update_from_disk(tree, file).await;
            files.push(file);
        }
        files
    }
}

/// Feeds file system notifications under a directory into a change channel.
/// Watching stops when this is dropped.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    dir: PathBuf,
}

impl FsWatcher {
    pub fn watch_dir(dir: &Path, tx: mpsc::UnboundedSender<FileChange>) -> crate::Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for change in changes_from_event(&event) {
                        let _ = tx.send(change);
                    }
                }
                Err(e) => tracing::warn!("File watcher error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(dir, RecursiveMode::Recursive)?;
        tracing::info!("Watching {}", dir.display());

        Ok(Self {
            _watcher: watcher,
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Renames surface as modifications; the path decides which side it is on.
fn changes_from_event(event: &Event) -> Vec<FileChange> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| {
                if p.exists() {
                    FileChange::changed(p)
                } else {
                    FileChange::removed(p)
                }
            })
            .collect(),
        EventKind::Remove(_) => event.paths.iter().map(FileChange::removed).collect(),
        _ => Vec::new(),
    }
}

type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Collects [`FileChange`]s and emits a [`ChangeBatch`] once no change has
/// arrived for the debounce period.
pub struct ChangeBatcher {
    debounce: Duration,
    filter: PathFilter,
}

impl ChangeBatcher {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            filter: Arc::new(|_| true),
        }
    }

    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self::new(Duration::from_millis(settings.debounce_ms))
    }

    /// Only paths accepted by `filter` take part in batches.
    pub fn with_filter(mut self, filter: impl Fn(&Path) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    /// Start batching. The task ends when `changes` closes (flushing what is
    /// pending) or when `cancel` turns true (discarding it).
    pub fn spawn(
        self,
        mut changes: mpsc::UnboundedReceiver<FileChange>,
        mut cancel: watch::Receiver<bool>,
    ) -> (mpsc::UnboundedReceiver<ChangeBatch>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let mut batch = ChangeBatch::default();
            let mut deadline: Option<Instant> = None;
            let cancelled = wait_for_cancel(&mut cancel);
            tokio::pin!(cancelled);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancelled => {
                        tracing::debug!("Change batching cancelled");
                        break;
                    }
                    change = changes.recv() => {
                        let Some(change) = change else {
                            if !batch.is_empty() {
                                let _ = tx.send(std::mem::take(&mut batch));
                            }
                            break;
                        };
                        if !(self.filter)(&change.path) {
                            continue;
                        }
                        batch.record(change);
                        deadline = Some(Instant::now() + self.debounce);
                    }
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        deadline = None;
                        if batch.is_empty() {
                            continue;
                        }
                        tracing::debug!(
                            "Emitting change batch: {} changed, {} removed",
                            batch.changed.len(),
                            batch.removed.len()
                        );
                        if tx.send(std::mem::take(&mut batch)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        (rx, handle)
    }
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
