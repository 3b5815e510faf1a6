//! Deterministic clustering followed by LLM-assisted merge, per the
//! consolidate command: group issues that are almost certainly restating the
//! same problem, let an agent write the merged ticket, then rewrite the
//! store and ticket files in one serial pass.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{ApprovedIssue, CandidateIssue, IssueCluster, IssueStore, LineRange, Severity};
use crate::prompts::PromptEngine;
use crate::runner::{AgentRunner, Phase};
use crate::storage::{JsonStore, issue_store_path};
use crate::{json_parse, tickets};

/// Jaccard similarity floor for two titles to be considered restatements of
/// the same issue, once exact file+category and file-only clustering have
/// already run.
const JACCARD_THRESHOLD: f64 = 0.40;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "of", "to", "in", "on", "for", "and", "or", "that", "this",
    "with", "as", "by", "at", "it", "be", "not", "does", "should", "could", "would", "has", "have",
];

fn tokenize(title: &str) -> HashSet<String> {
    let re = Regex::new(r"[^a-z0-9]+").expect("static pattern");
    re.split(&title.to_ascii_lowercase())
        .filter(|t| t.len() > 2 && !STOP_WORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Group open issues into clusters of likely duplicates. Clustering runs in
/// three passes, each absorbing whatever the previous pass left alone:
/// exact (file_path, category) match, then file_path-only match, then
/// title-token Jaccard similarity above [`JACCARD_THRESHOLD`]. A cluster
/// always has at least two members; singletons are never emitted.
pub fn cluster(issues: &[ApprovedIssue]) -> Vec<IssueCluster> {
    let mut remaining: Vec<&ApprovedIssue> = issues.iter().filter(|i| i.is_open()).collect();
    let mut clusters = Vec::new();
    let mut next_id = 1;

    clusters.extend(cluster_by(&mut remaining, &mut next_id, "same file and category", |a, b| {
        a.candidate.file_path == b.candidate.file_path && a.candidate.category == b.candidate.category
    }));

    clusters.extend(cluster_by(&mut remaining, &mut next_id, "same file", |a, b| {
        a.candidate.file_path == b.candidate.file_path
    }));

    let tokens: HashMap<String, HashSet<String>> = remaining
        .iter()
        .map(|i| (i.candidate.id.clone(), tokenize(&i.candidate.title)))
        .collect();
    clusters.extend(cluster_by(&mut remaining, &mut next_id, "similar titles", |a, b| {
        jaccard(&tokens[&a.candidate.id], &tokens[&b.candidate.id]) >= JACCARD_THRESHOLD
    }));

    clusters
}

/// Greedily partition `remaining` using `same_group`, removing every issue
/// that joins a cluster of size >= 2 so later passes only see leftovers.
fn cluster_by<'a>(
    remaining: &mut Vec<&'a ApprovedIssue>,
    next_id: &mut u32,
    reason: &str,
    same_group: impl Fn(&ApprovedIssue, &ApprovedIssue) -> bool,
) -> Vec<IssueCluster> {
    let mut clusters = Vec::new();
    let mut used = vec![false; remaining.len()];

    for i in 0..remaining.len() {
        if used[i] {
            continue;
        }
        let mut group = vec![i];
        for j in (i + 1)..remaining.len() {
            if !used[j] && same_group(remaining[i], remaining[j]) {
                group.push(j);
            }
        }
        if group.len() < 2 {
            continue;
        }
        for &idx in &group {
            used[idx] = true;
        }
        let cluster_id = format!("cluster-{next_id}");
        *next_id += 1;
        clusters.push(IssueCluster {
            id: cluster_id,
            reason: reason.to_string(),
            issues: group.iter().map(|&idx| remaining[idx].candidate.id.clone()).collect(),
        });
    }

    let mut kept = Vec::new();
    for (idx, issue) in remaining.drain(..).enumerate() {
        if !used[idx] {
            kept.push(issue);
        }
    }
    *remaining = kept;

    clusters
}

#[derive(Debug, Deserialize)]
struct MergeOutput {
    title: String,
    description: String,
    severity: Severity,
    file_path: String,
    #[serde(default)]
    line_range: Option<LineRange>,
    category: String,
    recommendation: String,
    #[serde(default)]
    keep_separate: Vec<String>,
}

/// One cluster's merge outcome: either a single replacement issue plus the
/// ids it subsumed, or a no-op when the agent decided nothing should merge.
pub enum MergeOutcome {
    Merged {
        replacement: ApprovedIssue,
        subsumed_ids: Vec<String>,
    },
    KeptSeparate,
}

async fn merge_cluster<R: AgentRunner>(
    runner: &R,
    prompts: &PromptEngine,
    cluster: &IssueCluster,
    store: &IssueStore,
    target: &Path,
) -> Result<MergeOutcome> {
    let members: Vec<&ApprovedIssue> = store
        .issues
        .iter()
        .filter(|i| cluster.issues.contains(&i.candidate.id))
        .collect();

    let cluster_json = serde_json::to_string_pretty(
        &members.iter().map(|i| &i.candidate).collect::<Vec<&CandidateIssue>>(),
    )
    .map_err(|e| Error::Parse {
        context: "cluster serialization".to_string(),
        source: e.to_string(),
    })?;

    let mut vars = std::collections::HashMap::new();
    vars.insert("repo_path".to_string(), target.display().to_string());
    vars.insert("cluster_json".to_string(), cluster_json);
    let prompt = prompts.render_phase("consolidate", &vars)?;

    let result = runner.run(Phase::Consolidate, &prompt, target, None).await?;
    if result.exit_code != 0 {
        return Err(Error::Transport(format!(
            "consolidate agent exited with code {}",
            result.exit_code
        )));
    }

    let parsed: MergeOutput = json_parse::parse_tolerant(&result.stdout, "consolidate output")?;

    if parsed.keep_separate.len() >= cluster.issues.len() {
        return Ok(MergeOutcome::KeptSeparate);
    }

    let subsumed_ids: Vec<String> = cluster
        .issues
        .iter()
        .filter(|id| !parsed.keep_separate.contains(id))
        .cloned()
        .collect();

    if subsumed_ids.len() < 2 {
        return Ok(MergeOutcome::KeptSeparate);
    }

    let new_id = tickets::next_issue_id(target)?;
    let candidate = CandidateIssue {
        id: new_id,
        agent_id: "consolidate".to_string(),
        title: parsed.title,
        description: parsed.description,
        severity: parsed.severity,
        file_path: parsed.file_path,
        line_range: parsed.line_range,
        category: parsed.category,
        recommendation: parsed.recommendation,
        code_snippet: None,
    };

    let replacement = ApprovedIssue {
        candidate,
        votes: Vec::new(),
        approved_at: chrono::Utc::now().to_rfc3339(),
        ticket_path: None,
        status: None,
        consolidated_from: Some(subsumed_ids.clone()),
    };

    Ok(MergeOutcome::Merged {
        replacement,
        subsumed_ids,
    })
}

/// Result of a full consolidation pass, for the CLI to report.
#[derive(Debug, Default)]
pub struct ConsolidateReport {
    pub clusters_found: usize,
    pub merges_applied: usize,
    pub issues_removed: usize,
    pub dry_run: bool,
}

/// Cluster open issues, run the merge agent over each cluster concurrently,
/// then apply every accepted merge in one serial pass so the store and
/// ticket files never observe a half-written state. `dry_run` stops before
/// the serial apply step and only reports what would happen.
pub async fn run<R: AgentRunner + Clone + Sync + Send + 'static>(
    runner: &R,
    prompts: &PromptEngine,
    target: &Path,
    concurrency: usize,
    dry_run: bool,
) -> Result<ConsolidateReport> {
    let store_path = issue_store_path(target);
    let store: JsonStore<IssueStore> = JsonStore::new(&store_path);
    let data = store.load()?;

    let clusters = cluster(&data.issues);
    let mut report = ConsolidateReport {
        clusters_found: clusters.len(),
        dry_run,
        ..Default::default()
    };

    if clusters.is_empty() {
        return Ok(report);
    }

    if dry_run {
        for c in &clusters {
            info!(cluster = %c.id, reason = %c.reason, issues = ?c.issues, "would merge (dry run)");
        }
        return Ok(report);
    }

    let semaphore = std::sync::Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set: JoinSet<Result<MergeOutcome>> = JoinSet::new();

    for c in clusters {
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let runner = runner.clone();
        let prompts = prompts.clone();
        let target = target.to_path_buf();
        let data = data.clone();
        set.spawn(async move {
            let _permit = permit;
            merge_cluster(&runner, &prompts, &c, &data, &target).await
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(outcome)) => outcomes.push(outcome),
            Ok(Err(e)) => warn!(error = %e, "consolidate merge call failed, leaving cluster separate"),
            Err(e) => warn!(error = %e, "consolidate task panicked"),
        }
    }

    store.modify(|data| {
        for outcome in outcomes {
            if let MergeOutcome::Merged {
                replacement,
                subsumed_ids,
            } = outcome
            {
                for id in &subsumed_ids {
                    if let Some(issue) = data.issues.iter().find(|i| &i.candidate.id == id) {
                        let _ = tickets::remove_ticket(&target, issue.candidate.severity, id);
                    }
                }
                data.issues.retain(|i| !subsumed_ids.contains(&i.candidate.id));

                if let Ok(path) = tickets::write_ticket(&target, &replacement) {
                    let mut replacement = replacement;
                    replacement.ticket_path = Some(path);
                    report.merges_applied += 1;
                    report.issues_removed += subsumed_ids.len();
                    data.issues.push(replacement);
                }
            }
        }
    })?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Vote;

    fn issue(id: &str, file: &str, category: &str, title: &str) -> ApprovedIssue {
        ApprovedIssue {
            candidate: CandidateIssue {
                id: id.to_string(),
                agent_id: "correctness".to_string(),
                title: title.to_string(),
                description: "desc".to_string(),
                severity: Severity::High,
                file_path: file.to_string(),
                line_range: None,
                category: category.to_string(),
                recommendation: "fix".to_string(),
                code_snippet: None,
            },
            votes: vec![Vote {
                voter_id: "voter-1".to_string(),
                issue_id: id.to_string(),
                approve: true,
                reasoning: "ok".to_string(),
            }],
            approved_at: "2026-01-01T00:00:00Z".to_string(),
            ticket_path: None,
            status: None,
            consolidated_from: None,
        }
    }

    #[test]
    fn test_tokenize_strips_stop_words_and_short_tokens() {
        let tokens = tokenize("The loop is off by one in the counter");
        assert!(tokens.contains("loop"));
        assert!(tokens.contains("counter"));
        assert!(!tokens.contains("the"));
        assert!(!tokens.contains("is"));
        assert!(!tokens.contains("by"));
    }

    #[test]
    fn test_jaccard_identical_sets_is_one() {
        let a: HashSet<String> = ["loop", "counter"].iter().map(|s| s.to_string()).collect();
        assert_eq!(jaccard(&a, &a), 1.0);
    }

    #[test]
    fn test_jaccard_disjoint_sets_is_zero() {
        let a: HashSet<String> = ["loop"].iter().map(|s| s.to_string()).collect();
        let b: HashSet<String> = ["secret"].iter().map(|s| s.to_string()).collect();
        assert_eq!(jaccard(&a, &b), 0.0);
    }

    #[test]
    fn test_cluster_groups_exact_file_and_category_match() {
        let issues = vec![
            issue("ISSUE-001", "src/lib.rs", "logic", "off by one in loop"),
            issue("ISSUE-002", "src/lib.rs", "logic", "completely different wording"),
            issue("ISSUE-003", "src/other.rs", "logic", "unrelated"),
        ];
        let clusters = cluster(&issues);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].issues.len(), 2);
        assert!(clusters[0].issues.contains(&"ISSUE-001".to_string()));
        assert!(clusters[0].issues.contains(&"ISSUE-002".to_string()));
    }

    #[test]
    fn test_cluster_groups_by_similar_title_across_files() {
        let issues = vec![
            issue("ISSUE-001", "src/a.rs", "logic", "off by one loop counter overflow"),
            issue("ISSUE-002", "src/b.rs", "security", "off by one loop counter overflow bug"),
        ];
        let clusters = cluster(&issues);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].reason, "similar titles");
    }

    #[test]
    fn test_cluster_skips_wont_fix_issues() {
        let mut a = issue("ISSUE-001", "src/lib.rs", "logic", "same bug");
        let mut b = issue("ISSUE-002", "src/lib.rs", "logic", "same bug");
        a.status = Some(crate::model::IssueStatus::WontFix);
        b.status = Some(crate::model::IssueStatus::WontFix);
        assert!(cluster(&[a, b]).is_empty());
    }

    #[test]
    fn test_cluster_leaves_unrelated_issues_unclustered() {
        let issues = vec![
            issue("ISSUE-001", "src/a.rs", "logic", "alpha bravo charlie"),
            issue("ISSUE-002", "src/b.rs", "security", "delta echo foxtrot"),
        ];
        assert!(cluster(&issues).is_empty());
    }
}
