//! End-to-end tests for the `autoloop` binary.
//!
//! Fake worker CLIs are small shell scripts wired in through
//! `AUTOLOOP_CLAUDE_PATH`, so these only run on unix.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use autoloop::exit_codes;

const ENV_OVERRIDES: [&str; 4] = [
    "AUTOLOOP_CLAUDE_PATH",
    "AUTOLOOP_CODEX_PATH",
    "AUTOLOOP_GEMINI_PATH",
    "AUTOLOOP_OPENCODE_PATH",
];

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

/// Config with a single claude model and no fallback.
fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let path = dir.join("config.toml");
    fs::write(
        &path,
        format!(
            r#"
default_timeout_secs = 30
{extra}

[retry]
base_delay_ms = 1
max_delay_ms = 5
max_retries_per_model = 1

[supervisor]
sigkill_delay_ms = 200
progress_interval_ms = 50
echo_output = false

[models]
fallback = []

[[models.primary]]
name = "sonnet"
cli = "claude"
model = "sonnet"
"#
        ),
    )
    .expect("write config");
    path
}

fn autoloop(claude: &Path, args: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_autoloop"));
    for var in ENV_OVERRIDES {
        cmd.env_remove(var);
    }
    cmd.env("AUTOLOOP_CLAUDE_PATH", claude)
        .args(args)
        .output()
        .expect("run autoloop")
}

#[test]
fn run_succeeds_and_appends_worker_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let claude = write_script(
        temp.path(),
        "claude",
        r#"prompt=$(cat)
echo "args: $*"
echo "prompt: $prompt""#,
    );
    let config = write_config(temp.path(), "");
    let output = temp.path().join("logs/attempts.log");

    let result = autoloop(
        &claude,
        &[
            "--config",
            config.to_str().expect("utf8"),
            "run",
            "--output",
            output.to_str().expect("utf8"),
            "--prompt",
            "add a readme",
        ],
    );

    assert_eq!(result.status.code(), Some(exit_codes::OK), "{result:?}");
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("run: model=sonnet label=claude/sonnet dispatches=1"));
    let log = fs::read_to_string(&output).expect("read log");
    assert!(log.contains("args: --print --dangerously-skip-permissions --model sonnet"));
    assert!(log.contains("prompt: add a readme"));
    assert!(log.contains("[exit 0 after"));
}

#[test]
fn rate_limited_worker_exhausts_with_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let claude = write_script(
        temp.path(),
        "claude",
        "cat > /dev/null\necho 'Error: 429 Too Many Requests' >&2\nexit 1",
    );
    let config = write_config(temp.path(), "");
    let output = temp.path().join("attempts.log");

    let result = autoloop(
        &claude,
        &[
            "--config",
            config.to_str().expect("utf8"),
            "run",
            "--output",
            output.to_str().expect("utf8"),
            "--prompt",
            "task",
        ],
    );

    assert_eq!(result.status.code(), Some(exit_codes::EXHAUSTED));
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("claude/sonnet"), "{stderr}");
    // One retry of the same model, then the only slot is used up.
    let log = fs::read_to_string(&output).expect("read log");
    assert_eq!(log.matches("429 Too Many Requests").count(), 2);
}

#[test]
fn hung_worker_is_terminated_at_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let claude = write_script(temp.path(), "claude", "trap '' TERM\nexec sleep 30");
    let config = write_config(temp.path(), "");
    let output = temp.path().join("attempts.log");

    let result = autoloop(
        &claude,
        &[
            "--config",
            config.to_str().expect("utf8"),
            "run",
            "--output",
            output.to_str().expect("utf8"),
            "--prompt",
            "task",
            "--timeout",
            "1",
        ],
    );

    assert_eq!(result.status.code(), Some(exit_codes::EXHAUSTED));
    let log = fs::read_to_string(&output).expect("read log");
    assert!(log.contains("[timed out after"), "{log}");
}

#[test]
fn binaries_reports_env_override() {
    let temp = tempfile::tempdir().expect("tempdir");
    let claude = write_script(temp.path(), "claude", "exit 0");
    let config = write_config(temp.path(), "");

    let result = autoloop(
        &claude,
        &["--config", config.to_str().expect("utf8"), "binaries"],
    );

    assert_eq!(result.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains(claude.to_str().expect("utf8")), "{stdout}");
    assert!(stdout.contains("AUTOLOOP_CLAUDE_PATH"), "{stdout}");
}

#[test]
fn invalid_config_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let claude = write_script(temp.path(), "claude", "exit 0");
    let config = write_config(temp.path(), "strategy = \"fastest\"");

    let result = autoloop(&claude, &["--config", config.to_str().expect("utf8"), "models"]);

    assert_eq!(result.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("parse"), "{stderr}");
}
