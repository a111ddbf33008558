//! Integration tests for the phaser binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const PLAN: &str = r#"# Rate limiting

## Objective
Throttle outgoing requests.

## Changes
- `src/limiter.rs`: add a token bucket
- `src/client.rs`: call the limiter before sending
"#;

fn phaser(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("phaser");
    cmd.current_dir(dir)
        .env_remove("PHASER_MODEL")
        .env_remove("PHASER_WORKSPACE")
        .env_remove("PHASER_CLAUDE_CMD")
        .env_remove("CLAUDE_CMD");
    cmd
}

fn project_with_plan(plan: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let plans = dir.path().join(".phaser/plans");
    fs::create_dir_all(&plans).unwrap();
    let plan_file = plans.join("rate-limit.md");
    fs::write(&plan_file, plan).unwrap();
    (dir, plan_file)
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        phaser(dir.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("decompose"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        phaser(dir.path()).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        phaser(dir.path()).arg("frobnicate").assert().failure();
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_config_init_then_show() {
        let dir = TempDir::new().unwrap();
        phaser(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created phaser.toml"));
        assert!(dir.path().join(".phaser/phaser.toml").exists());

        phaser(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("fix_attempts = 2"))
            .stdout(predicate::str::contains("loop_threshold = \"blocking\""));
    }

    #[test]
    fn test_config_show_applies_overrides() {
        let dir = TempDir::new().unwrap();
        phaser(dir.path())
            .args(["--model", "sonnet", "config", "show"])
            .env("CLAUDE_CMD", "my-claude")
            .assert()
            .success()
            .stdout(predicate::str::contains("model = \"sonnet\""))
            .stdout(predicate::str::contains("claude_cmd = \"my-claude\""));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".phaser")).unwrap();
        fs::write(dir.path().join(".phaser/phaser.toml"), "[audit]\nloop_threshold = \"urgent\"\n").unwrap();
        phaser(dir.path())
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("phaser.toml"));
    }
}

mod phase_commands {
    use super::*;

    #[test]
    fn test_decompose_writes_state() {
        let (dir, plan) = project_with_plan(PLAN);
        phaser(dir.path())
            .args(["decompose", plan.to_str().unwrap()])
            .assert()
            .success()
            .stdout(predicate::str::contains("Decomposed into"))
            .stdout(predicate::str::contains("phase-02"));

        let state = dir.path().join(".phaser/plans/.phases");
        assert!(state.join("rate-limit.phases.json").exists());
        assert!(state.join("rate-limit.phases.md").exists());

        phaser(dir.path())
            .args(["decompose", "rate-limit"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exist"));
    }

    #[test]
    fn test_status_before_decompose() {
        let (dir, _plan) = project_with_plan(PLAN);
        phaser(dir.path())
            .args(["status", "rate-limit"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No phases"));
    }

    #[test]
    fn test_status_json_and_staleness() {
        let (dir, plan) = project_with_plan(PLAN);
        phaser(dir.path()).args(["decompose", "rate-limit"]).assert().success();

        let output = phaser(dir.path())
            .args(["status", "rate-limit", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(json["plan_id"], "rate-limit");
        assert_eq!(json["plan_file"], "workspace/plans/rate-limit.md");

        fs::write(&plan, format!("{}\n## Risks\nNone.\n", PLAN)).unwrap();
        phaser(dir.path())
            .args(["status", "rate-limit"])
            .assert()
            .success()
            .stdout(predicate::str::contains("stale:"));
    }

    #[test]
    fn test_skip_marks_phase() {
        let (dir, _plan) = project_with_plan(PLAN);
        phaser(dir.path()).args(["decompose", "rate-limit"]).assert().success();
        phaser(dir.path())
            .args(["skip", "rate-limit", "phase-01"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Skipped phase-01"));
        phaser(dir.path())
            .args(["status", "rate-limit"])
            .assert()
            .success()
            .stdout(predicate::str::contains("skipped"));

        phaser(dir.path())
            .args(["skip", "rate-limit", "phase-42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("phase-42"));
    }
}

#[cfg(unix)]
mod run_command {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_claude(dir: &Path, result: &str) -> PathBuf {
        let script = dir.join("fake-claude.sh");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\ncat > /dev/null\necho '{{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"{}\",\"is_error\":false}}'\n",
                result
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[test]
    fn test_run_completes_all_phases() {
        let (dir, _plan) = project_with_plan(PLAN);
        let script = fake_claude(dir.path(), "All good.");
        phaser(dir.path())
            .args(["run", "rate-limit"])
            .env("PHASER_CLAUDE_CMD", &script)
            .assert()
            .success()
            .stdout(predicate::str::contains("phase-01"))
            .stdout(predicate::str::contains("All phases complete."));
    }

    #[test]
    fn test_run_respects_max_phases() {
        let (dir, _plan) = project_with_plan(PLAN);
        let script = fake_claude(dir.path(), "ok");
        phaser(dir.path())
            .args(["run", "rate-limit", "--max-phases", "1"])
            .env("PHASER_CLAUDE_CMD", &script)
            .assert()
            .success()
            .stdout(predicate::str::contains("Stopped after 1 phase(s)."));
    }

    #[test]
    fn test_blocking_audit_fails_run() {
        let (dir, _plan) = project_with_plan(PLAN);
        let script = fake_claude(dir.path(), "[blocking] limiter never called");
        phaser(dir.path())
            .args(["run", "rate-limit"])
            .env("PHASER_CLAUDE_CMD", &script)
            .assert()
            .failure()
            .stderr(predicate::str::contains("audit failed"));
    }

    #[test]
    fn test_missing_agent_fails_phase() {
        let (dir, _plan) = project_with_plan(PLAN);
        phaser(dir.path())
            .args(["run", "rate-limit"])
            .env("PHASER_CLAUDE_CMD", dir.path().join("does-not-exist"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to spawn"));
    }
}
