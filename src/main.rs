use std::path::{Path, PathBuf};
use std::sync::Arc;

use owo_colors::OwoColorize;
use tokio::sync::{mpsc, watch};

use testbridge::config::{self, BridgeSettings};
use testbridge::locations::SourceMapStore;
use testbridge::run::report::{default_report_dir, write_details};
use testbridge::run::{scan_test_output, RecordingHost, RunMode, TestRunner};
use testbridge::tree::{leaf_test_ids, NodeId, TestTree, TreeBuilder};
use testbridge::watch::{ChangeBatcher, FsWatcher};
use testbridge::Result;

const USAGE: &str = "Usage: testbridge <tree|run> <repo-dir> [--debug] [--watch] [test ids...]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args: Vec<String> = std::env::args().collect();
    let repo = args.get(2).map(PathBuf::from);

    match (args.get(1).map(|s| s.as_str()), repo) {
        (Some("tree"), Some(repo)) => print_tree(&repo).await,
        (Some("run"), Some(repo)) => {
            let flags = &args[3..];
            let mode = if flags.iter().any(|a| a == "--debug") {
                RunMode::Debug
            } else {
                RunMode::Run
            };
            let continuous = flags.iter().any(|a| a == "--watch");
            let ids: Vec<String> = flags
                .iter()
                .filter(|a| *a != "--debug" && *a != "--watch")
                .cloned()
                .collect();

            let unsuccessful = run_tests(&repo, &ids, mode, continuous).await?;
            if unsuccessful {
                std::process::exit(1);
            }
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    }
}

/// Discover the repository's test folder into `tree`, as its only root.
async fn discover(repo: &Path, tree: &mut TestTree) -> Result<(BridgeSettings, TreeBuilder)> {
    let settings = config::resolve(Some(repo));
    let builder = TreeBuilder::new(&settings)?.with_workspace_root(repo);
    let root = builder.build_tree(tree, &repo.join(&settings.test_folder)).await?;
    tree.add_root(root);
    Ok((settings, builder))
}

async fn print_tree(repo: &Path) -> Result<()> {
    let mut tree = TestTree::new();
    discover(repo, &mut tree).await?;
    let snapshots: Vec<_> = tree.roots().iter().filter_map(|&r| tree.snapshot(r)).collect();
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    Ok(())
}

/// Run the selected tests (all when `ids` is empty), then with `continuous`
/// re-run the files that change until interrupted. Returns whether the last
/// run failed or never started a test.
async fn run_tests(repo: &Path, ids: &[String], mode: RunMode, continuous: bool) -> Result<bool> {
    let mut tree = TestTree::new();
    let (settings, builder) = discover(repo, &mut tree).await?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let include = tree.roots().to_vec();
    let mut unsuccessful = run_once(
        repo, &settings, &builder, &mut tree, &include, ids, mode, cancel_rx.clone(),
    )
    .await?;
    if !continuous {
        return Ok(unsuccessful);
    }

    let (change_tx, change_rx) = mpsc::unbounded_channel();
    let watcher = FsWatcher::watch_dir(&repo.join(&settings.test_folder), change_tx)?;
    let (mut batches, _batching) = ChangeBatcher::from_settings(&settings)
        .with_filter(builder.test_file_matcher())
        .spawn(change_rx, cancel_rx.clone());
    println!("Watching {} for changes", watcher.dir().display());

    while let Some(batch) = batches.recv().await {
        let files = batch.apply(&builder, &mut tree).await;
        if files.is_empty() {
            continue;
        }
        unsuccessful = run_once(
            repo, &settings, &builder, &mut tree, &files, ids, mode, cancel_rx.clone(),
        )
        .await?;
    }

    Ok(unsuccessful)
}

#[allow(clippy::too_many_arguments)]
async fn run_once(
    repo: &Path,
    settings: &BridgeSettings,
    builder: &TreeBuilder,
    tree: &mut TestTree,
    include: &[NodeId],
    ids: &[String],
    mode: RunMode,
    cancel: watch::Receiver<bool>,
) -> Result<bool> {
    let mut pending = builder.pending_tests(tree, include).await;
    let test_ids = if ids.is_empty() {
        leaf_test_ids(tree, include)
    } else {
        pending.retain(|id, _| ids.contains(id));
        ids.iter().filter(|id| pending.contains_key(*id)).cloned().collect()
    };
    if test_ids.is_empty() {
        tracing::info!("No tests selected");
        return Ok(false);
    }

    let runner = TestRunner::new(repo, settings.clone());
    let scanner = runner.spawn(&test_ids, mode)?;

    let host = Arc::new(RecordingHost::new(&pending).echo_to_stdout());
    let store = Arc::new(SourceMapStore::new(builder.content_source()));
    scan_test_output(pending, host.clone(), scanner, cancel, store).await;

    let report = host.report();
    if report.raw_output_requested {
        eprintln!("No test started; check the raw output above.");
    }
    let summary = &report.summary;
    println!(
        "\n{}, {}, {} in {} ms",
        format!("{} passed", summary.passed).green(),
        format!("{} failed", summary.failed).red(),
        format!("{} skipped", summary.skipped).yellow(),
        summary.duration_ms
    );
    match write_details(&report, &default_report_dir()) {
        Ok(path) => println!("Details: {}", path.display()),
        Err(e) => tracing::warn!("Could not write run details: {}", e),
    }

    Ok(summary.failed > 0 || report.raw_output_requested)
}
