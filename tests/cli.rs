//! CLI tests for autoforge
//!
//! These exercise the commands that do not need a generation provider.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const PHASES_MD: &str = "# Build Phases\n\n## Phase 0 — Genesis\nObjective: scaffold the project\n- Cargo.toml\n- src/main.rs\n\n## Phase 1 — Data Layer\n- models\n";

fn autoforge(state: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("autoforge");
    cmd.env_remove("AUTOFORGE_STATE_DIR")
        .arg("--state-dir")
        .arg(state.path().join("state"));
    cmd
}

fn contracts_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("phases.md"), PHASES_MD).unwrap();
    fs::write(dir.path().join("stack.md"), "Rust, axum, sqlite\n").unwrap();
    dir
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let state = TempDir::new().unwrap();
        autoforge(&state)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("resume"))
            .stdout(predicate::str::contains("recover"));
    }

    #[test]
    fn test_version() {
        let state = TempDir::new().unwrap();
        autoforge(&state).arg("--version").assert().success();
    }

    #[test]
    fn test_run_requires_a_target() {
        let state = TempDir::new().unwrap();
        let contracts = contracts_dir();
        autoforge(&state)
            .arg("run")
            .arg("--contracts")
            .arg(contracts.path())
            .assert()
            .failure();
    }
}

mod phases {
    use super::*;

    #[test]
    fn test_phases_lists_declared_phases() {
        let state = TempDir::new().unwrap();
        let contracts = contracts_dir();
        autoforge(&state)
            .arg("phases")
            .arg("--contracts")
            .arg(contracts.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("Genesis"))
            .stdout(predicate::str::contains("Data Layer"))
            .stdout(predicate::str::contains("2 phases"));
    }

    #[test]
    fn test_phases_missing_dir_fails() {
        let state = TempDir::new().unwrap();
        autoforge(&state)
            .arg("phases")
            .arg("--contracts")
            .arg(state.path().join("nowhere"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}

mod config {
    use super::*;

    #[test]
    fn test_config_init_writes_file() {
        let state = TempDir::new().unwrap();
        autoforge(&state)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("wrote"));
        let written = fs::read_to_string(state.path().join("state/autoforge.toml")).unwrap();
        assert!(written.contains("[orchestrator]"));

        autoforge(&state)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_defaults() {
        let state = TempDir::new().unwrap();
        autoforge(&state)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("valid"));
    }

    #[test]
    fn test_config_show_renders_toml() {
        let state = TempDir::new().unwrap();
        autoforge(&state)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_phase_attempts"));
    }
}

mod status {
    use super::*;

    #[test]
    fn test_status_with_no_builds() {
        let state = TempDir::new().unwrap();
        autoforge(&state)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No builds"));
    }

    #[test]
    fn test_status_unknown_id_fails() {
        let state = TempDir::new().unwrap();
        autoforge(&state)
            .args(["status", "deadbeef"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No build matches"));
    }

    #[test]
    fn test_recover_with_nothing_to_do() {
        let state = TempDir::new().unwrap();
        autoforge(&state)
            .arg("recover")
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to recover"));
    }
}
