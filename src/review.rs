//! The Review Manager: list/submit/clean for fixes that have finished the
//! iterate-review loop and are sitting in a worktree waiting on a human.
//! Submission and cleanup both shell out to `git`/`gh` the same way the
//! Fix Orchestrator shells out to `git` for diffs.

use std::path::Path;

use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{FixRecord, FixStateFile, FixStatus, IssueStore};
use crate::storage::{JsonStore, fix_state_path, issue_store_path};
use crate::submission::Submitter;
use crate::worktree::WorktreeManager;

/// List fixes still worth looking at: a missing worktree means whatever
/// was in it is gone, so it's dropped — except `merged` records, which are
/// kept as history regardless of whether the worktree was ever cleaned up.
pub fn list(target: &Path, config: &Config) -> Result<Vec<FixRecord>> {
    let store: JsonStore<FixStateFile> = JsonStore::new(fix_state_path(target));
    let state = store.load()?;
    let wm = worktree_manager(target, config);

    Ok(state
        .fixes
        .into_iter()
        .filter(|f| f.status == FixStatus::Merged || wm.exists(Path::new(&f.worktree_path)))
        .collect())
}

fn worktree_manager(target: &Path, config: &Config) -> WorktreeManager {
    WorktreeManager::new(
        target.to_path_buf(),
        WorktreeManager::default_dir(target),
        config.base_branch.clone(),
    )
}

/// Render the auto-generated PR title per spec §4.G: `fix(ISSUE-NNN): <summary>`.
fn pr_title(record: &FixRecord) -> String {
    format!("fix({}): {}", record.issue_id, record.issue_summary)
}

/// Render the PR body: summary, commit log since the base branch, a test
/// plan checklist, and the original ticket folded into a collapsible block.
fn pr_body(record: &FixRecord, base_branch: &str) -> String {
    let log = commit_log(Path::new(&record.worktree_path), base_branch);

    format!(
        "## Summary\n\n{}\n\n## Commits\n\n{}\n\n## Test Plan\n\n- [ ] Reviewed the diff\n- [ ] Ran the project's test suite\n\n<details>\n<summary>Original issue</summary>\n\n{}\n\n</details>\n",
        record.issue_summary,
        if log.is_empty() { "(no commits found)".to_string() } else { log },
        record.issue_content,
    )
}

fn commit_log(worktree: &Path, base_branch: &str) -> String {
    let output = std::process::Command::new("git")
        .args(["log", "--oneline", &format!("origin/{base_branch}..HEAD")])
        .current_dir(worktree)
        .output();
    match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).trim().to_string(),
        _ => String::new(),
    }
}

/// Push `issue_id`'s fix branch and open a PR for it. A record already at
/// `pr_created` or `merged` is a no-op: the PR exists, nothing to push or
/// mutate.
pub fn submit_one(target: &Path, config: &Config, issue_id: &str, draft: bool) -> Result<FixRecord> {
    let state_store: JsonStore<FixStateFile> = JsonStore::new(fix_state_path(target));
    let state = state_store.load()?;
    let record = state
        .fixes
        .iter()
        .find(|f| f.issue_id == issue_id)
        .cloned()
        .ok_or_else(|| Error::FixRecordNotFound(issue_id.to_string()))?;

    if record.status == FixStatus::PrCreated || record.status == FixStatus::Merged {
        return Err(Error::Submission(format!(
            "PR already exists for {issue_id}"
        )));
    }

    let title = pr_title(&record);
    let body = pr_body(&record, &config.base_branch);

    let submitter = Submitter::new();
    let result = submitter.submit(
        target,
        &record.branch_name,
        &config.base_branch,
        &title,
        &body,
        draft,
    )?;

    let updated = state_store.modify(|state| {
        let entry = state
            .fixes
            .iter_mut()
            .find(|f| f.issue_id == issue_id)
            .expect("record just loaded above");
        entry.status = FixStatus::PrCreated;
        entry.pr_url = Some(result.pr_url.clone());
        entry.pr_number = Some(result.pr_number);
        entry.completed_at = Some(chrono::Utc::now().to_rfc3339());
        entry.clone()
    })?;

    let issue_store: JsonStore<IssueStore> = JsonStore::new(issue_store_path(target));
    issue_store.modify(|data| data.issues.retain(|i| i.candidate.id != issue_id))?;

    info!(issue = issue_id, pr_url = %result.pr_url, "submitted fix for review");
    Ok(updated)
}

/// Submit every fix that is ready (not already submitted or merged).
/// Individual failures don't stop the rest; they're returned alongside
/// successes so the caller can report per-issue outcomes.
pub fn submit_all(target: &Path, config: &Config, draft: bool) -> Result<Vec<(String, Result<FixRecord>)>> {
    let state_store: JsonStore<FixStateFile> = JsonStore::new(fix_state_path(target));
    let state = state_store.load()?;

    let ready: Vec<String> = state
        .fixes
        .iter()
        .filter(|f| f.status != FixStatus::PrCreated && f.status != FixStatus::Merged)
        .map(|f| f.issue_id.clone())
        .collect();

    Ok(ready
        .into_iter()
        .map(|id| {
            let outcome = submit_one(target, config, &id, draft);
            (id, outcome)
        })
        .collect())
}

/// Remove a fix's worktree without submitting it. The ticket file is left
/// alone; only the worktree and the FixRecord go away.
pub fn clean_one(target: &Path, config: &Config, issue_id: &str) -> Result<()> {
    let state_store: JsonStore<FixStateFile> = JsonStore::new(fix_state_path(target));
    let state = state_store.load()?;
    let record = state
        .fixes
        .iter()
        .find(|f| f.issue_id == issue_id)
        .ok_or_else(|| Error::FixRecordNotFound(issue_id.to_string()))?;

    let wm = worktree_manager(target, config);
    let worktree_path = Path::new(&record.worktree_path).to_path_buf();
    if wm.exists(&worktree_path) {
        wm.remove(&worktree_path)?;
    }

    state_store.modify(|state| state.fixes.retain(|f| f.issue_id != issue_id))?;
    info!(issue = issue_id, "cleaned fix worktree");
    Ok(())
}

/// Clean every fix that is safe to remove (anything not already merged).
pub fn clean_all(target: &Path, config: &Config) -> Result<Vec<(String, Result<()>)>> {
    let state_store: JsonStore<FixStateFile> = JsonStore::new(fix_state_path(target));
    let state = state_store.load()?;

    let ids: Vec<String> = state
        .fixes
        .iter()
        .filter(|f| f.status != FixStatus::Merged)
        .map(|f| f.issue_id.clone())
        .collect();

    Ok(ids
        .into_iter()
        .map(|id| {
            let outcome = clean_one(target, config, &id);
            (id, outcome)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(id: &str, status: FixStatus, worktree: &str) -> FixRecord {
        FixRecord {
            issue_id: id.to_string(),
            branch_name: format!("fix/{id}"),
            worktree_path: worktree.to_string(),
            status,
            iterations: 1,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            completed_at: None,
            error: None,
            issue_content: "full ticket body".to_string(),
            issue_summary: "off by one".to_string(),
            pr_url: None,
            pr_number: None,
        }
    }

    fn sample_config() -> Config {
        Config {
            runner: "claude".to_string(),
            base_branch: "main".to_string(),
            agent_binary: "claude".to_string(),
            agent_model: None,
            agent_timeout: None,
            voter_count: 3,
            approval_threshold: 2,
            dedup_threshold: 5,
            scan_concurrency: 4,
            fix_concurrency: 2,
            max_iterations: 10,
            verbose: false,
        }
    }

    #[test]
    fn test_list_drops_records_whose_worktree_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<FixStateFile> = JsonStore::new(fix_state_path(dir.path()));
        store
            .save(&FixStateFile {
                fixes: vec![sample_record(
                    "ISSUE-001",
                    FixStatus::ReadyForReview,
                    "/nonexistent/worktree",
                )],
            })
            .unwrap();

        let listed = list(dir.path(), &sample_config()).unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn test_list_keeps_merged_records_regardless_of_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<FixStateFile> = JsonStore::new(fix_state_path(dir.path()));
        store
            .save(&FixStateFile {
                fixes: vec![sample_record("ISSUE-001", FixStatus::Merged, "/nonexistent/worktree")],
            })
            .unwrap();

        let listed = list(dir.path(), &sample_config()).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_pr_title_format() {
        let record = sample_record("ISSUE-007", FixStatus::ReadyForReview, "/tmp/wt");
        assert_eq!(pr_title(&record), "fix(ISSUE-007): off by one");
    }

    #[test]
    fn test_submit_one_rejects_already_submitted() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<FixStateFile> = JsonStore::new(fix_state_path(dir.path()));
        store
            .save(&FixStateFile {
                fixes: vec![sample_record("ISSUE-001", FixStatus::PrCreated, "/tmp/wt")],
            })
            .unwrap();

        let err = submit_one(dir.path(), &sample_config(), "ISSUE-001", false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_submit_one_missing_record_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = submit_one(dir.path(), &sample_config(), "ISSUE-404", false).unwrap_err();
        assert!(matches!(err, Error::FixRecordNotFound(_)));
    }

    #[test]
    fn test_clean_one_missing_record_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = clean_one(dir.path(), &sample_config(), "ISSUE-404").unwrap_err();
        assert!(matches!(err, Error::FixRecordNotFound(_)));
    }

    #[test]
    fn test_clean_one_removes_record_when_worktree_already_gone() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<FixStateFile> = JsonStore::new(fix_state_path(dir.path()));
        store
            .save(&FixStateFile {
                fixes: vec![sample_record(
                    "ISSUE-001",
                    FixStatus::ReadyForReview,
                    "/nonexistent/worktree",
                )],
            })
            .unwrap();

        clean_one(dir.path(), &sample_config(), "ISSUE-001").unwrap();
        let state = store.load().unwrap();
        assert!(state.fixes.is_empty());
    }
}
