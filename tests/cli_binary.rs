use assert_cmd::Command;
use predicates::prelude::*;

fn integration_enabled() -> bool {
    std::env::var("ROVER_INTEGRATION").is_ok()
}

#[allow(deprecated)]
fn cmd() -> Command {
    Command::cargo_bin("rover").unwrap()
}

// --- Help & version ---

#[test]
fn help_flag() {
    if !integration_enabled() {
        return;
    }
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("scanner"));
}

#[test]
fn version_flag() {
    if !integration_enabled() {
        return;
    }
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("rover"));
}

#[test]
fn scan_help_mentions_dry_run() {
    if !integration_enabled() {
        return;
    }
    cmd()
        .args(["scan", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dry-run"));
}

#[test]
fn fix_requires_at_least_one_id() {
    if !integration_enabled() {
        return;
    }
    cmd()
        .arg("fix")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("required"));
}

// --- Pure listings that need no agent ---

#[test]
fn agents_lists_the_built_in_catalog() {
    if !integration_enabled() {
        return;
    }
    cmd()
        .arg("agents")
        .assert()
        .success()
        .stdout(predicate::str::contains("security"))
        .stdout(predicate::str::contains("correctness"));
}

#[test]
fn issues_bare_listing_is_empty_in_a_fresh_repo() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(&tmp)
        .arg("issues")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn issues_view_missing_ticket_errors() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(&tmp)
        .args(["issues", "view", "ISSUE-404"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ticket not found"));
}

#[test]
fn issues_remove_missing_ticket_is_a_noop() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(&tmp)
        .args(["issues", "remove", "ISSUE-404"])
        .assert()
        .success();
}

// --- Review subcommand against an empty project ---

#[test]
fn review_list_is_empty_in_a_fresh_repo() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(&tmp)
        .args(["review", "list"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn review_submit_missing_record_errors() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(&tmp)
        .args(["review", "submit", "ISSUE-404"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("fix record not found"));
}

#[test]
fn review_clean_missing_record_errors() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(&tmp)
        .args(["review", "clean", "ISSUE-404"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("fix record not found"));
}

// --- Remember ---

#[test]
fn remember_appends_a_memory_line() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(&tmp)
        .args(["remember", "prefer tabs over spaces"])
        .assert()
        .success();

    let memory = std::fs::read_to_string(tmp.path().join(".rover/memory.md")).unwrap();
    assert!(memory.contains("prefer tabs over spaces"));
}

// --- Config file errors ---

#[test]
fn config_file_not_found() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(&tmp)
        .args(["--config", "/nonexistent.toml", "agents"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config file not found"));
}

#[test]
fn invalid_toml_config() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let cfg_dir = tmp.path().join(".rover");
    std::fs::create_dir_all(&cfg_dir).unwrap();
    std::fs::write(cfg_dir.join("config.toml"), "not valid {{{{ toml").unwrap();
    cmd()
        .current_dir(&tmp)
        .arg("agents")
        .assert()
        .failure()
        .stderr(predicate::str::contains("config parse error"));
}
