use serde::Deserialize;
use std::path::Path;

pub const MIN_DEBOUNCE_MS: u64 = 100;
pub const MAX_DEBOUNCE_MS: u64 = 60_000;

/// All configurable settings with their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSettings {
    /// Folder under the workspace root that holds the test hierarchy.
    pub test_folder: String,
    /// Glob deciding whether a registered leaf path is a test file.
    pub test_file_glob: String,
    /// Directories whose name contains any of these are never descended into.
    pub excluded_dir_markers: Vec<String>,
    /// Base class name that marks a class as a test case.
    pub test_case_marker: String,
    pub entry_script: String,
    pub python: String,
    pub debug_port: u16,
    pub debounce_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            test_folder: "_TestItem".to_string(),
            test_file_glob: "*.py".to_string(),
            excluded_dir_markers: vec!["pycache".to_string(), "AppObjects".to_string()],
            test_case_marker: "TestCase".to_string(),
            entry_script: "main.py".to_string(),
            python: "python3".to_string(),
            debug_port: 5678,
            debounce_ms: 1_000,
        }
    }
}

/// Raw JSON representation. Every field is optional for partial overrides.
#[derive(Debug, Deserialize, Default)]
struct SettingsFile {
    #[serde(rename = "tree.testFolder")]
    test_folder: Option<String>,
    #[serde(rename = "tree.testFileGlob")]
    test_file_glob: Option<String>,
    #[serde(rename = "tree.excludedDirMarkers")]
    excluded_dir_markers: Option<Vec<String>>,
    #[serde(rename = "tree.testCaseMarker")]
    test_case_marker: Option<String>,
    #[serde(rename = "runner.entryScript")]
    entry_script: Option<String>,
    #[serde(rename = "runner.python")]
    python: Option<String>,
    #[serde(rename = "runner.debugPort")]
    debug_port: Option<u32>,
    #[serde(rename = "run.debounceMs")]
    debounce_ms: Option<u64>,
}

/// Resolve settings: defaults → user global → project-local.
pub fn resolve(project_root: Option<&Path>) -> BridgeSettings {
    let global_path = dirs::home_dir()
        .map(|h| h.join(".testbridge/settings.json"));
    let project_path = project_root
        .map(|r| r.join(".testbridge/settings.json"));
    resolve_with_paths(
        global_path.as_deref(),
        project_path.as_deref(),
    )
}

/// Testable resolver that accepts explicit file paths (no home dir dependency).
fn resolve_with_paths(
    global_path: Option<&Path>,
    project_path: Option<&Path>,
) -> BridgeSettings {
    let mut settings = BridgeSettings::default();

    if let Some(path) = global_path {
        apply_file(&mut settings, path);
    }
    if let Some(path) = project_path {
        apply_file(&mut settings, path);
    }

    settings
}

fn apply_file(settings: &mut BridgeSettings, path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else { return };
    let Ok(file) = serde_json::from_str::<SettingsFile>(&content) else {
        tracing::warn!("Invalid settings file, ignoring: {}", path.display());
        return;
    };

    if let Some(v) = non_empty("tree.testFolder", file.test_folder) {
        settings.test_folder = v;
    }
    if let Some(v) = non_empty("tree.testFileGlob", file.test_file_glob) {
        settings.test_file_glob = v;
    }
    if let Some(v) = file.excluded_dir_markers {
        settings.excluded_dir_markers = v.into_iter().filter(|m| !m.is_empty()).collect();
    }
    if let Some(v) = non_empty("tree.testCaseMarker", file.test_case_marker) {
        settings.test_case_marker = v;
    }
    if let Some(v) = non_empty("runner.entryScript", file.entry_script) {
        settings.entry_script = v;
    }
    if let Some(v) = non_empty("runner.python", file.python) {
        settings.python = v;
    }
    if let Some(v) = file.debug_port {
        if (1024..=65_535).contains(&v) {
            settings.debug_port = v as u16;
        } else {
            tracing::warn!(
                "runner.debugPort ({}) out of range (1024..65535), using default",
                v
            );
        }
    }
    if let Some(v) = file.debounce_ms {
        if (MIN_DEBOUNCE_MS..=MAX_DEBOUNCE_MS).contains(&v) {
            settings.debounce_ms = v;
        } else {
            tracing::warn!(
                "run.debounceMs ({}) out of range ({}..{}), using default",
                v, MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS
            );
        }
    }
}

fn non_empty(key: &str, value: Option<String>) -> Option<String> {
    match value {
        Some(v) if v.trim().is_empty() => {
            tracing::warn!("{} is empty, using default", key);
            None
        }
        other => other,
    }
}
