pub mod events;
pub mod host;
pub mod reconciler;
pub mod report;
pub mod runner;
pub mod scanner;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::config::BridgeSettings;

pub use host::{TestMessage, TestRunHost};
pub use reconciler::scan_test_output;
pub use report::{RecordingHost, RunReport};
pub use runner::{BinaryPathStrategy, Platform, RunnerProfile, TestCommand};
pub use scanner::{OutputScanner, ScannerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Run,
    /// Launch under debugpy, waiting for a debugger on the configured port.
    Debug,
}

/// Launches the automation framework's entry script for a set of test ids.
pub struct TestRunner {
    repo: PathBuf,
    settings: BridgeSettings,
    profile: RunnerProfile,
}

impl TestRunner {
    pub fn new(repo: impl Into<PathBuf>, settings: BridgeSettings) -> Self {
        Self {
            repo: repo.into(),
            settings,
            profile: RunnerProfile::current(),
        }
    }

    pub fn with_profile(mut self, profile: RunnerProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// `<python> [debug launcher] [default args] <repo>/<entry> -tests <ids>`.
    pub fn command(&self, test_ids: &[String], mode: RunMode) -> crate::Result<TestCommand> {
        let program = self.profile.interpreter(&self.repo, &self.settings.python);

        let mut args = Vec::new();
        if mode == RunMode::Debug {
            args.extend([
                "-m".to_string(),
                "debugpy".to_string(),
                "--listen".to_string(),
                format!("localhost:{}", self.settings.debug_port),
                "--wait-for-client".to_string(),
            ]);
        }
        args.extend(self.profile.default_args.iter().cloned());
        args.push(
            self.repo
                .join(&self.settings.entry_script)
                .to_string_lossy()
                .to_string(),
        );
        args.push("-tests".to_string());
        args.push(serde_json::to_string(test_ids)?);

        let env = HashMap::from([
            ("PYDEVD_DISABLE_FILE_VALIDATION".to_string(), "1".to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ]);

        Ok(TestCommand {
            program,
            args,
            env,
            cwd: self.repo.clone(),
        })
    }

    /// Spawn the runner and return a scanner over its output.
    ///
    /// A process that fails to start still yields a scanner: its only event
    /// is the runner error, so the run finalizes like any other.
    pub fn spawn(&self, test_ids: &[String], mode: RunMode) -> crate::Result<OutputScanner> {
        let cmd = self.command(test_ids, mode)?;
        tracing::info!("Starting test process: {} {}", cmd.program, cmd.args.join(" "));
        if mode == RunMode::Debug {
            tracing::info!(
                "Waiting for a debugger on localhost:{}",
                self.settings.debug_port
            );
        }

        // The parent environment is inherited; the runner variables overlay it
        let spawned = tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(&cmd.env)
            .current_dir(&cmd.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => OutputScanner::new(child),
            Err(e) => {
                let err = crate::Error::SpawnFailed {
                    program: cmd.program.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!("{}", err);
                Ok(OutputScanner::failed(err.to_string()))
            }
        }
    }
}
