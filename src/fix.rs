//! The Fix Orchestrator: per-issue worker pool driving an isolated worktree
//! through an iterate-review loop, detecting the LLM's terminal sentinel
//! markers in streamed output and persisting a `FixRecord`/`FixTrace` pair
//! per issue as it goes.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::json_parse;
use crate::model::{
    ApprovedIssue, FindingSeverity, FixRecord, FixStateFile, FixStatus, FixTrace, IssueStore,
    ReviewAnalysis, ReviewItem, TraceEntry,
};
use crate::prompts::PromptEngine;
use crate::runner::{AgentRunner, Phase, RunResult};
use crate::storage::{JsonStore, fix_state_path, fix_trace_path, issue_store_path};
use crate::tickets;
use crate::worktree::{WorktreeInfo, WorktreeManager};

const MAX_CALL_RETRIES: u32 = 2;

/// Terminal sentinels the LLM is asked to emit (spec's fix/review prompts).
const MARKER_ALREADY_FIXED: &str = "ALREADY_FIXED";
const MARKER_REVIEW_NOT_APPLICABLE: &str = "REVIEW_NOT_APPLICABLE";
const MARKER_COMMIT_COMPLETE: &str = "COMMIT_COMPLETE";
const MARKER_BLOCKED: &str = "BLOCKED";

/// Scan streamed output for a terminal marker. `BLOCKED` wins over
/// `COMMIT_COMPLETE` when both somehow appear, since it signals the agent
/// could not actually finish.
fn detect_terminal_marker(text: &str) -> Option<&'static str> {
    if text.contains(MARKER_ALREADY_FIXED) {
        Some(MARKER_ALREADY_FIXED)
    } else if text.contains(MARKER_REVIEW_NOT_APPLICABLE) {
        Some(MARKER_REVIEW_NOT_APPLICABLE)
    } else if text.contains(MARKER_BLOCKED) {
        Some(MARKER_BLOCKED)
    } else if text.contains(MARKER_COMMIT_COMPLETE) {
        Some(MARKER_COMMIT_COMPLETE)
    } else {
        None
    }
}

/// Outcome of `run_fix_one`, per spec §4.E's per-issue result. Distinct from
/// [`FixStatus`], which tracks the persisted record's lifecycle — this is
/// the transient per-call result handed back to the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    AlreadyFixed,
    Complete,
    IterationLimit,
    Error,
}

#[derive(Debug, Clone)]
pub struct FixResult {
    pub issue_id: String,
    pub outcome: FixOutcome,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub iterations: u32,
    pub error: Option<String>,
}

struct AspectSpec {
    name: &'static str,
    instructions: &'static str,
}

/// Always-run review lenses. Completeness only makes sense when the
/// original issue text is available to check against — in Rover every fix
/// is tied to a ticket, so issue content is always available and all three
/// run.
const ASPECTS: &[AspectSpec] = &[
    AspectSpec {
        name: "architecture",
        instructions: "Evaluate structural concerns: layering, coupling, and whether the change fits how the surrounding module is organized.",
    },
    AspectSpec {
        name: "bugs",
        instructions: "Look only for implementation and runtime errors the fix introduced or failed to address.",
    },
    AspectSpec {
        name: "completeness",
        instructions: "Check that every requirement in the issue ticket below is actually addressed by the diff, not just the symptom it described.",
    },
];

/// Run fixes for `issue_ids` with up to `concurrency` workers pulling from a
/// shared queue (`min(concurrency, len(issue_ids))` active at once), per
/// spec §4.E's concurrency model.
pub async fn run_fix_all<R: AgentRunner + Clone + Sync + Send + 'static>(
    runner: &R,
    prompts: &PromptEngine,
    config: &Config,
    target: &Path,
    issue_ids: &[String],
) -> Result<Vec<FixResult>> {
    let worker_count = config.fix_concurrency.min(issue_ids.len().max(1)).max(1);
    let semaphore = std::sync::Arc::new(Semaphore::new(worker_count));
    let mut set: JoinSet<FixResult> = JoinSet::new();

    for issue_id in issue_ids {
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let runner = runner.clone();
        let prompts = prompts.clone();
        let config = config.clone();
        let target = target.to_path_buf();
        let issue_id = issue_id.clone();

        set.spawn(async move {
            let _permit = permit;
            match run_fix_one(&runner, &prompts, &config, &target, &issue_id).await {
                Ok(result) => result,
                Err(e) => FixResult {
                    issue_id: issue_id.clone(),
                    outcome: FixOutcome::Error,
                    branch_name: None,
                    worktree_path: None,
                    iterations: 0,
                    error: Some(e.to_string()),
                },
            }
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => warn!(error = %e, "fix worker task panicked"),
        }
    }
    Ok(results)
}

/// Drive the full per-issue state machine described in spec §4.E: worktree
/// provisioning, initial fix call, review, iterate, bounded by
/// `config.max_iterations`.
pub async fn run_fix_one<R: AgentRunner>(
    runner: &R,
    prompts: &PromptEngine,
    config: &Config,
    target: &Path,
    issue_id: &str,
) -> Result<FixResult> {
    let issue = load_issue(target, issue_id)?;
    let issue_content = ticket_markdown(target, &issue);

    let wm = WorktreeManager::new(
        target.to_path_buf(),
        WorktreeManager::default_dir(target),
        config.base_branch.clone(),
    );
    let worktree = wm.create_for_issue(issue_id)?;

    let trace_store: JsonStore<FixTrace> = JsonStore::new(fix_trace_path(target, issue_id));
    let state_store: JsonStore<FixStateFile> = JsonStore::new(fix_state_path(target));

    let mut session_id: Option<String> = None;
    let mut prior_items: Vec<ReviewItem> = Vec::new();
    let mut iteration: u32 = 0;

    loop {
        iteration += 1;

        let prompt = if iteration == 1 {
            render_fix_prompt(prompts, &worktree.path, &worktree.branch, &issue_content)?
        } else {
            render_iteration_prompt(prompts, &worktree.path, &worktree.branch, &prior_items, &issue_content)?
        };

        let call = match call_with_retry(runner, Phase::Fix, &prompt, &worktree.path, session_id.as_deref()).await {
            Ok(c) => c,
            Err(e) => {
                persist_error(&state_store, issue_id, &worktree, iteration, &e.to_string())?;
                return Ok(FixResult {
                    issue_id: issue_id.to_string(),
                    outcome: FixOutcome::Error,
                    branch_name: Some(worktree.branch.clone()),
                    worktree_path: Some(worktree.path.display().to_string()),
                    iterations: iteration,
                    error: Some(e.to_string()),
                });
            }
        };

        if call.session_id.is_some() {
            session_id = call.session_id.clone();
        }

        let marker = detect_terminal_marker(&call.stdout);
        append_trace(&trace_store, iteration, &call, marker)?;

        if iteration == 1 && marker == Some(MARKER_ALREADY_FIXED) {
            wm.remove(&worktree.path)?;
            remove_from_store(target, issue_id)?;
            info!(issue = issue_id, "issue already fixed, worktree discarded");
            return Ok(FixResult {
                issue_id: issue_id.to_string(),
                outcome: FixOutcome::AlreadyFixed,
                branch_name: None,
                worktree_path: None,
                iterations: iteration,
                error: None,
            });
        }

        if call.exit_code != 0 {
            let msg = format!("fix agent exited with code {}", call.exit_code);
            persist_error(&state_store, issue_id, &worktree, iteration, &msg)?;
            return Ok(FixResult {
                issue_id: issue_id.to_string(),
                outcome: FixOutcome::Error,
                branch_name: Some(worktree.branch.clone()),
                worktree_path: Some(worktree.path.display().to_string()),
                iterations: iteration,
                error: Some(msg),
            });
        }

        if iteration > 1 && marker == Some(MARKER_REVIEW_NOT_APPLICABLE) {
            let diff = git_diff(&worktree.path, &config.base_branch);
            let still_valid = verify_dismissals(runner, prompts, &worktree.branch, &prior_items, &call.stdout, &diff).await?;
            if still_valid.is_empty() {
                persist_ready_for_review(&state_store, issue_id, &worktree, iteration, &issue_content)?;
                return Ok(FixResult {
                    issue_id: issue_id.to_string(),
                    outcome: FixOutcome::Complete,
                    branch_name: Some(worktree.branch.clone()),
                    worktree_path: Some(worktree.path.display().to_string()),
                    iterations: iteration,
                    error: None,
                });
            }
            prior_items = still_valid;
            if iteration >= config.max_iterations {
                persist_ready_for_review(&state_store, issue_id, &worktree, iteration, &issue_content)?;
                return Ok(FixResult {
                    issue_id: issue_id.to_string(),
                    outcome: FixOutcome::IterationLimit,
                    branch_name: Some(worktree.branch.clone()),
                    worktree_path: Some(worktree.path.display().to_string()),
                    iterations: iteration,
                    error: None,
                });
            }
            continue;
        }

        let diff = git_diff(&worktree.path, &config.base_branch);
        let analysis = match run_multi_aspect_review(runner, prompts, &worktree.branch, &worktree.path, &issue_content, &diff).await {
            Ok(a) => a,
            Err(e) => {
                persist_error(&state_store, issue_id, &worktree, iteration, &e.to_string())?;
                return Ok(FixResult {
                    issue_id: issue_id.to_string(),
                    outcome: FixOutcome::Error,
                    branch_name: Some(worktree.branch.clone()),
                    worktree_path: Some(worktree.path.display().to_string()),
                    iterations: iteration,
                    error: Some(e.to_string()),
                });
            }
        };

        if !analysis.has_actionable() {
            persist_ready_for_review(&state_store, issue_id, &worktree, iteration, &issue_content)?;
            return Ok(FixResult {
                issue_id: issue_id.to_string(),
                outcome: FixOutcome::Complete,
                branch_name: Some(worktree.branch.clone()),
                worktree_path: Some(worktree.path.display().to_string()),
                iterations: iteration,
                error: None,
            });
        }

        if iteration >= config.max_iterations {
            persist_ready_for_review(&state_store, issue_id, &worktree, iteration, &issue_content)?;
            return Ok(FixResult {
                issue_id: issue_id.to_string(),
                outcome: FixOutcome::IterationLimit,
                branch_name: Some(worktree.branch.clone()),
                worktree_path: Some(worktree.path.display().to_string()),
                iterations: iteration,
                error: None,
            });
        }

        prior_items = analysis
            .must_fix()
            .into_iter()
            .chain(analysis.should_fix())
            .cloned()
            .collect();
    }
}

fn load_issue(target: &Path, issue_id: &str) -> Result<ApprovedIssue> {
    let store: JsonStore<IssueStore> = JsonStore::new(issue_store_path(target));
    let data = store.load()?;
    data.issues
        .into_iter()
        .find(|i| i.candidate.id == issue_id)
        .ok_or_else(|| Error::TicketNotFound(issue_id.to_string()))
}

fn ticket_markdown(target: &Path, issue: &ApprovedIssue) -> String {
    match &issue.ticket_path {
        Some(path) => std::fs::read_to_string(target.join(path)).unwrap_or_else(|_| tickets::render_ticket(issue)),
        None => tickets::render_ticket(issue),
    }
}

fn remove_from_store(target: &Path, issue_id: &str) -> Result<()> {
    let store: JsonStore<IssueStore> = JsonStore::new(issue_store_path(target));
    store.modify(|data| data.issues.retain(|i| i.candidate.id != issue_id))
}

fn render_fix_prompt(prompts: &PromptEngine, worktree: &Path, branch: &str, issue_content: &str) -> Result<String> {
    let mut vars = HashMap::new();
    vars.insert("worktree_path".to_string(), worktree.display().to_string());
    vars.insert("branch_name".to_string(), branch.to_string());
    vars.insert("issue_content".to_string(), issue_content.to_string());
    prompts.render_phase("fix", &vars)
}

/// Build the "resume and keep iterating" prompt, must_fix items first, then
/// should_fix, per spec §4.E step 5.
fn render_iteration_prompt(
    prompts: &PromptEngine,
    worktree: &Path,
    branch: &str,
    items: &[ReviewItem],
    issue_content: &str,
) -> Result<String> {
    let mut listing = String::new();
    for item in items.iter().filter(|i| i.severity == FindingSeverity::MustFix) {
        listing.push_str(&format!("- [must fix] {}", item.description));
        if let Some(f) = &item.file {
            listing.push_str(&format!(" ({f})"));
        }
        listing.push('\n');
    }
    for item in items.iter().filter(|i| i.severity == FindingSeverity::ShouldFix) {
        listing.push_str(&format!("- [should fix] {}", item.description));
        if let Some(f) = &item.file {
            listing.push_str(&format!(" ({f})"));
        }
        listing.push('\n');
    }

    let mut vars = HashMap::new();
    vars.insert("worktree_path".to_string(), worktree.display().to_string());
    vars.insert("branch_name".to_string(), branch.to_string());
    vars.insert(
        "issue_content".to_string(),
        format!(
            "{issue_content}\n\nThe previous attempt was reviewed and the following remain:\n\n{listing}"
        ),
    );
    prompts.render_phase("fix", &vars)
}

async fn call_with_retry<R: AgentRunner>(
    runner: &R,
    phase: Phase,
    prompt: &str,
    working_dir: &Path,
    resume_session: Option<&str>,
) -> Result<RunResult> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match runner.run(phase, prompt, working_dir, resume_session).await {
            Ok(result) => return Ok(result),
            Err(e) if attempt <= MAX_CALL_RETRIES => {
                warn!(attempt, error = %e, "fix call failed, retrying");
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_multi_aspect_review<R: AgentRunner>(
    runner: &R,
    prompts: &PromptEngine,
    branch: &str,
    worktree: &Path,
    issue_content: &str,
    diff: &str,
) -> Result<ReviewAnalysis> {
    let mut combined = String::new();
    for aspect in ASPECTS {
        let mut vars = HashMap::new();
        vars.insert("branch_name".to_string(), branch.to_string());
        vars.insert("worktree_path".to_string(), worktree.display().to_string());
        vars.insert("aspect_name".to_string(), aspect.name.to_string());
        vars.insert("aspect_instructions".to_string(), aspect.instructions.to_string());
        vars.insert("issue_content".to_string(), issue_content.to_string());
        vars.insert("diff".to_string(), diff.to_string());
        let prompt = prompts.render_phase("review-aspect", &vars)?;

        let result = runner.run(Phase::ReviewAspect, &prompt, worktree, None).await?;
        if result.exit_code != 0 {
            return Err(Error::Transport(format!(
                "{} review exited with code {}",
                aspect.name, result.exit_code
            )));
        }
        combined.push_str(&format!("## {} review\n\n{}\n\n", aspect.name, result.stdout));
    }

    let mut vars = HashMap::new();
    vars.insert("raw_review".to_string(), combined);
    let parse_prompt = prompts.render_phase("review-parse", &vars)?;
    let parsed = runner.run(Phase::ReviewParse, &parse_prompt, worktree, None).await?;
    if parsed.exit_code != 0 {
        return Err(Error::Transport(format!(
            "review parse exited with code {}",
            parsed.exit_code
        )));
    }

    json_parse::parse_tolerant(&parsed.stdout, "review parse output")
}

/// Re-check every previously-flagged item (must_fix and should_fix alike,
/// per the resolved dismissal-verification policy) against the LLM's
/// REVIEW_NOT_APPLICABLE justification. Items the skeptical pass still
/// considers valid are returned for another iteration.
async fn verify_dismissals<R: AgentRunner>(
    runner: &R,
    prompts: &PromptEngine,
    branch: &str,
    items: &[ReviewItem],
    dismissal_reason: &str,
    diff: &str,
) -> Result<Vec<ReviewItem>> {
    let mut still_valid = Vec::new();
    for item in items {
        let mut vars = HashMap::new();
        vars.insert("branch_name".to_string(), branch.to_string());
        vars.insert("finding".to_string(), item.description.clone());
        vars.insert("dismissal_reason".to_string(), dismissal_reason.to_string());
        vars.insert("diff".to_string(), diff.to_string());
        let prompt = prompts.render_phase("dismissal-verify", &vars)?;

        let result = match runner.run(Phase::DismissalVerify, &prompt, Path::new("."), None).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "dismissal verification call failed, keeping finding actionable");
                still_valid.push(item.clone());
                continue;
            }
        };
        if result.exit_code != 0 {
            still_valid.push(item.clone());
            continue;
        }

        #[derive(serde::Deserialize)]
        struct Verdict {
            justified: bool,
        }
        match json_parse::parse_tolerant::<Verdict>(&result.stdout, "dismissal verdict") {
            Ok(v) if v.justified => {}
            _ => still_valid.push(item.clone()),
        }
    }
    Ok(still_valid)
}

fn git_diff(worktree: &Path, base_branch: &str) -> String {
    let output = std::process::Command::new("git")
        .args(["diff", &format!("origin/{base_branch}...HEAD")])
        .current_dir(worktree)
        .output();
    match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).to_string(),
        _ => String::new(),
    }
}

fn append_trace(store: &JsonStore<FixTrace>, iteration: u32, call: &RunResult, marker: Option<&'static str>) -> Result<()> {
    store.modify(|trace| {
        trace.entries.push(TraceEntry {
            iteration,
            session_id: call.session_id.clone(),
            output: call.stdout.clone(),
            exit_code: call.exit_code,
            terminal_marker: marker.map(str::to_string),
            review_outputs: Vec::new(),
            at: chrono::Utc::now().to_rfc3339(),
        });
    })
}

fn persist_error(
    store: &JsonStore<FixStateFile>,
    issue_id: &str,
    worktree: &WorktreeInfo,
    iterations: u32,
    error: &str,
) -> Result<()> {
    upsert_record(store, issue_id, worktree, iterations, FixStatus::Error, Some(error.to_string()), "", "")
}

fn persist_ready_for_review(
    store: &JsonStore<FixStateFile>,
    issue_id: &str,
    worktree: &WorktreeInfo,
    iterations: u32,
    issue_content: &str,
) -> Result<()> {
    let summary = issue_content.lines().next().unwrap_or(issue_id).to_string();
    upsert_record(store, issue_id, worktree, iterations, FixStatus::ReadyForReview, None, issue_content, &summary)
}

fn upsert_record(
    store: &JsonStore<FixStateFile>,
    issue_id: &str,
    worktree: &WorktreeInfo,
    iterations: u32,
    status: FixStatus,
    error: Option<String>,
    issue_content: &str,
    issue_summary: &str,
) -> Result<()> {
    store.modify(|state| {
        if let Some(record) = state.fixes.iter_mut().find(|f| f.issue_id == issue_id) {
            record.status = status;
            record.iterations = iterations;
            record.error = error.clone();
            if status != FixStatus::Error {
                record.completed_at = Some(chrono::Utc::now().to_rfc3339());
            }
        } else {
            state.fixes.push(FixRecord {
                issue_id: issue_id.to_string(),
                branch_name: worktree.branch.clone(),
                worktree_path: worktree.path.display().to_string(),
                status,
                iterations,
                started_at: chrono::Utc::now().to_rfc3339(),
                completed_at: None,
                error,
                issue_content: issue_content.to_string(),
                issue_summary: issue_summary.to_string(),
                pr_url: None,
                pr_number: None,
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_terminal_marker_already_fixed() {
        assert_eq!(
            detect_terminal_marker("some output\nALREADY_FIXED\nmore"),
            Some(MARKER_ALREADY_FIXED)
        );
    }

    #[test]
    fn test_detect_terminal_marker_review_not_applicable() {
        assert_eq!(
            detect_terminal_marker("REVIEW_NOT_APPLICABLE because x"),
            Some(MARKER_REVIEW_NOT_APPLICABLE)
        );
    }

    #[test]
    fn test_detect_terminal_marker_blocked_takes_precedence_over_commit_complete() {
        assert_eq!(
            detect_terminal_marker("BLOCKED\nCOMMIT_COMPLETE"),
            Some(MARKER_BLOCKED)
        );
    }

    #[test]
    fn test_detect_terminal_marker_none_found() {
        assert_eq!(detect_terminal_marker("plain output, no sentinel"), None);
    }

    #[test]
    fn test_render_iteration_prompt_lists_must_fix_before_should_fix() {
        let prompts = PromptEngine::new(None);
        let items = vec![
            ReviewItem {
                severity: FindingSeverity::ShouldFix,
                description: "tidy up naming".to_string(),
                file: None,
            },
            ReviewItem {
                severity: FindingSeverity::MustFix,
                description: "fix the null deref".to_string(),
                file: Some("src/lib.rs".to_string()),
            },
        ];
        let prompt = render_iteration_prompt(&prompts, Path::new("/wt"), "fix/ISSUE-001", &items, "issue body").unwrap();
        let must_pos = prompt.find("fix the null deref").unwrap();
        let should_pos = prompt.find("tidy up naming").unwrap();
        assert!(must_pos < should_pos);
    }
}
