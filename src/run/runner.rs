use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Darwin,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Darwin
        } else {
            Platform::Posix
        }
    }
}

/// How the interpreter binary is located.
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryPathStrategy {
    /// Use the configured interpreter name verbatim.
    Configured,
    /// Resolve the configured interpreter through `PATH`.
    SearchPath,
    Fixed(PathBuf),
    /// Interpreter of a virtual environment, relative to the repository.
    VirtualEnv(PathBuf),
}

/// Per-platform differences of the test runner.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerProfile {
    pub platform: Platform,
    /// Interpreter arguments placed before the entry script.
    pub default_args: Vec<String>,
    pub binary_path_strategy: BinaryPathStrategy,
}

impl RunnerProfile {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Windows => Self {
                platform,
                default_args: vec!["-X".to_string(), "utf8".to_string()],
                binary_path_strategy: BinaryPathStrategy::Configured,
            },
            Platform::Posix | Platform::Darwin => Self {
                platform,
                default_args: Vec::new(),
                binary_path_strategy: BinaryPathStrategy::SearchPath,
            },
        }
    }

    pub fn current() -> Self {
        Self::for_platform(Platform::current())
    }

    pub fn with_binary_path_strategy(mut self, strategy: BinaryPathStrategy) -> Self {
        self.binary_path_strategy = strategy;
        self
    }

    /// Interpreter to launch for a repository.
    pub fn interpreter(&self, repo: &Path, configured: &str) -> String {
        match &self.binary_path_strategy {
            BinaryPathStrategy::Configured => configured.to_string(),
            BinaryPathStrategy::SearchPath => resolve_program(configured),
            BinaryPathStrategy::Fixed(path) => path.to_string_lossy().to_string(),
            BinaryPathStrategy::VirtualEnv(dir) => {
                let dir = repo.join(dir);
                let bin = match self.platform {
                    Platform::Windows => dir.join("Scripts").join("python.exe"),
                    Platform::Posix | Platform::Darwin => dir.join("bin").join("python"),
                };
                bin.to_string_lossy().to_string()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
}

/// Resolve a program name to an absolute path via PATH lookup.
pub fn resolve_program(program: &str) -> String {
    if program.contains('/') || program.contains('\\') {
        return program.to_string();
    }
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let full = dir.join(program);
            if full.is_file() {
                return full.to_string_lossy().to_string();
            }
        }
    }
    program.to_string()
}
