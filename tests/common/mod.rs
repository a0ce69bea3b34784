#![allow(dead_code)]

use std::path::Path;

use serde_json::json;
use tempfile::TempDir;

pub const LOGIN_PY: &str = "from base import TestCase\n\n\nclass LoginTest(TestCase):\n    def run(self):\n        pass\n";

pub const LOGOUT_PY: &str = "class LogoutTest(TestCase):\n    pass\n\n\nclass Helper(object):\n    pass\n";

pub fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// A repository with two test files under `_TestItem/login/` and a `main.py`
/// entry script that `sh` runs in place of the automation framework.
pub fn fixture_repo(runner_script: &str) -> TempDir {
    fixture_repo_with(runner_script, r#"{"runner.python": "sh"}"#)
}

/// [`fixture_repo`] with its own `.testbridge/settings.json`.
pub fn fixture_repo_with(runner_script: &str, settings_json: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("_TestItem/login/login.py"), LOGIN_PY);
    write(&root.join("_TestItem/login/logout.py"), LOGOUT_PY);
    write(&root.join("_TestItem/login/__init__.py"), "");
    write(&root.join("main.py"), runner_script);
    write(&root.join(".testbridge/settings.json"), settings_json);
    dir
}

/// One tuple-dialect line, quoted for `echo` in a shell script.
pub fn kt_echo(id: &str, event_type: i64, status: i64, messages: &[&str], return_value: Option<&str>) -> String {
    let mut payload = json!({
        "_name": id,
        "_event_type": event_type,
        "_status": status,
        "_log_msg": {"_msg_list": messages},
    });
    if let Some(value) = return_value {
        payload["_return_values"] = json!([value]);
    }
    format!("echo '{}'\n", json!([id, payload]))
}
