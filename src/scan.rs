//! The Scan Pipeline: Scanner -> Voter pool -> Arbitrator. One `run_agent`
//! call drives all three phases for a single agent against a single target
//! tree, ending with tickets written and the issue store updated.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{AgentSpec, ApprovedIssue, CandidateIssue, IssueStore, Vote};
use crate::prompts::PromptEngine;
use crate::runner::{AgentRunner, Phase};
use crate::storage::issue_store_path;
use crate::{json_parse, storage, tickets};

/// Outcome of one `run_agent` invocation, per spec §4.B's `runAgent` contract.
#[derive(Debug, Clone, Default)]
pub struct AgentResult {
    pub approved: usize,
    pub rejected: usize,
    pub ticket_paths: Vec<String>,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Deserialize, Default)]
struct ScanOutput {
    #[serde(default)]
    issues: Vec<ScannedIssue>,
}

/// Mirrors `CandidateIssue` minus `id`/`agent_id`, which the scanner never
/// supplies — scan-local ids are assigned once the response is parsed.
#[derive(Debug, Deserialize)]
struct ScannedIssue {
    title: String,
    description: String,
    severity: crate::model::Severity,
    file_path: String,
    #[serde(default)]
    line_range: Option<crate::model::LineRange>,
    category: String,
    recommendation: String,
    #[serde(default)]
    code_snippet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VoteOutput {
    approve: bool,
    reasoning: String,
}

/// Read `.rover/memory.md` if present; absent file is not an error, just no
/// extra context for the scanner.
fn read_memory(target: &Path) -> Option<String> {
    std::fs::read_to_string(storage::memory_path(target)).ok()
}

/// The dedup preamble placed ahead of every scan prompt (spec §4.B "Dedup
/// summary"). Below `dedup_threshold` open issues, format them directly;
/// above it, ask the LLM for a condensed fingerprint list grouped by file,
/// falling back to a truncated direct listing if that call fails.
pub async fn dedup_summary<R: AgentRunner>(
    runner: &R,
    store: &IssueStore,
    dedup_threshold: u32,
    target: &Path,
) -> (String, f64) {
    let open: Vec<&ApprovedIssue> = store.issues.iter().filter(|i| i.is_open()).collect();
    if open.is_empty() {
        return ("No existing issues detected yet.".to_string(), 0.0);
    }

    if open.len() as u32 <= dedup_threshold {
        return (direct_summary(&open), 0.0);
    }

    match llm_condensed_summary(runner, &open, target).await {
        Ok((summary, cost)) => (summary, cost),
        Err(e) => {
            warn!(error = %e, "dedup summarization call failed, falling back to direct listing");
            let truncated = &open[..(dedup_threshold as usize).min(open.len())];
            (direct_summary(truncated), 0.0)
        }
    }
}

fn direct_summary(issues: &[&ApprovedIssue]) -> String {
    issues
        .iter()
        .map(|issue| {
            let c = &issue.candidate;
            let lines = c
                .line_range
                .map(|r| format!(":{}-{}", r.start, r.end))
                .unwrap_or_default();
            format!("- [{}] \"{}\" in {}{}", c.category, c.title, c.file_path, lines)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn llm_condensed_summary<R: AgentRunner>(
    runner: &R,
    issues: &[&ApprovedIssue],
    target: &Path,
) -> Result<(String, f64)> {
    let listing = direct_summary(issues);
    let prompt = format!(
        "Condense the following already-known issues into a short fingerprint list \
         grouped by file, so a scanner can avoid re-reporting them. Respond with plain \
         text, no JSON wrapper.\n\n{listing}"
    );
    let result = runner.run(Phase::Scan, &prompt, target, None).await?;
    if result.exit_code != 0 {
        return Err(Error::Transport(format!(
            "dedup summarization exited with code {}",
            result.exit_code
        )));
    }
    Ok((result.stdout.trim().to_string(), result.cost_usd))
}

fn build_agent_prompt(agent: &AgentSpec, dedup: &str, memory: Option<&str>) -> String {
    let mut prompt = String::new();
    prompt.push_str(dedup);
    prompt.push_str("\n\nDO NOT report issues matching any above.\n\n");
    if let Some(mem) = memory.filter(|m| !m.trim().is_empty()) {
        prompt.push_str("User-provided context to ignore:\n");
        prompt.push_str(mem.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str(agent.system_prompt);
    prompt.push_str(&format!(
        "\n\nApply this lens only to files matching: {}\n",
        agent.file_patterns.join(", ")
    ));
    prompt
}

pub struct Scanner<'a, R> {
    runner: &'a R,
    prompts: &'a PromptEngine,
}

impl<'a, R: AgentRunner> Scanner<'a, R> {
    pub fn new(runner: &'a R, prompts: &'a PromptEngine) -> Self {
        Self { runner, prompts }
    }

    /// Run the scanner sub-phase for `agent` against `target`, returning
    /// candidates with scan-local ids assigned (`<agent_id>-<n>`, 1-based)
    /// plus the call's reported cost.
    pub async fn scan(&self, agent: &AgentSpec, target: &Path, dedup: &str) -> Result<(Vec<CandidateIssue>, f64)> {
        let memory = read_memory(target);
        let agent_prompt = build_agent_prompt(agent, dedup, memory.as_deref());

        let mut vars = HashMap::new();
        vars.insert("repo_path".to_string(), target.display().to_string());
        vars.insert("agent_prompt".to_string(), agent_prompt);
        let prompt = self.prompts.render_phase("scan", &vars)?;

        let result = self.runner.run(Phase::Scan, &prompt, target, None).await?;
        if result.exit_code != 0 {
            return Err(Error::Transport(format!(
                "scanner exited with code {}",
                result.exit_code
            )));
        }

        let parsed: ScanOutput = match json_parse::parse_tolerant(&result.stdout, "scanner output") {
            Ok(v) => v,
            Err(e) => {
                warn!(agent = agent.id, error = %e, "scanner output did not parse, treating as zero candidates");
                return Ok((Vec::new(), result.cost_usd));
            }
        };

        let candidates = parsed
            .issues
            .into_iter()
            .enumerate()
            .map(|(idx, issue)| CandidateIssue {
                id: format!("{}-{}", agent.id, idx + 1),
                agent_id: agent.id.to_string(),
                title: issue.title,
                description: issue.description,
                severity: issue.severity,
                file_path: issue.file_path,
                line_range: issue.line_range,
                category: issue.category,
                recommendation: issue.recommendation,
                code_snippet: issue.code_snippet,
            })
            .collect();

        Ok((candidates, result.cost_usd))
    }
}

pub struct VoterPool<'a, R> {
    runner: &'a R,
    prompts: &'a PromptEngine,
    voter_count: u32,
}

impl<'a, R: AgentRunner + Sync + Send + 'static> VoterPool<'a, R> {
    pub fn new(runner: &'a R, prompts: &'a PromptEngine, voter_count: u32) -> Self {
        Self {
            runner,
            prompts,
            voter_count,
        }
    }

    /// Run `voter_count` voters concurrently; each processes every candidate
    /// sequentially. Parse/transport errors on a single ballot degrade to an
    /// implicit `approve=false`, never failing the whole voter. Returns the
    /// combined votes plus the total reported cost across every ballot cast.
    pub async fn vote(&self, candidates: &[CandidateIssue], target: &Path) -> Result<(Vec<Vote>, f64)>
    where
        R: Clone,
    {
        let mut set: JoinSet<(Vec<Vote>, f64)> = JoinSet::new();

        for voter_idx in 1..=self.voter_count {
            let voter_id = format!("voter-{voter_idx}");
            let candidates = candidates.to_vec();
            let runner = self.runner.clone();
            let prompts_engine = self.prompts.clone();
            let target = target.to_path_buf();

            set.spawn(async move {
                let mut votes = Vec::with_capacity(candidates.len());
                let mut cost = 0.0;
                for candidate in &candidates {
                    let (vote, vote_cost) = cast_vote(&runner, &prompts_engine, &voter_id, candidate, &target).await;
                    votes.push(vote);
                    cost += vote_cost;
                }
                (votes, cost)
            });
        }

        let mut all_votes = Vec::new();
        let mut total_cost = 0.0;
        while let Some(res) = set.join_next().await {
            let (votes, cost) = res.map_err(|e| Error::Transport(format!("voter task panicked: {e}")))?;
            all_votes.extend(votes);
            total_cost += cost;
        }
        Ok((all_votes, total_cost))
    }
}

async fn cast_vote<R: AgentRunner>(
    runner: &R,
    prompts: &PromptEngine,
    voter_id: &str,
    candidate: &CandidateIssue,
    target: &Path,
) -> (Vote, f64) {
    let candidate_json = serde_json::to_string_pretty(candidate).unwrap_or_default();
    let mut vars = HashMap::new();
    vars.insert("repo_path".to_string(), target.display().to_string());
    vars.insert("candidate_json".to_string(), candidate_json);

    let outcome: Result<(VoteOutput, f64)> = async {
        let prompt = prompts.render_phase("vote", &vars)?;
        let result = runner.run(Phase::Vote, &prompt, target, None).await?;
        if result.exit_code != 0 {
            return Err(Error::Transport(format!("voter exited with code {}", result.exit_code)));
        }
        let parsed: VoteOutput = json_parse::parse_tolerant(&result.stdout, "voter output")?;
        Ok((parsed, result.cost_usd))
    }
    .await;

    match outcome {
        Ok((v, cost)) => (
            Vote {
                voter_id: voter_id.to_string(),
                issue_id: candidate.id.clone(),
                approve: v.approve,
                reasoning: v.reasoning,
            },
            cost,
        ),
        Err(e) => (
            Vote {
                voter_id: voter_id.to_string(),
                issue_id: candidate.id.clone(),
                approve: false,
                reasoning: format!("vote call failed, treated as reject: {e}"),
            },
            0.0,
        ),
    }
}

pub struct Arbitrator {
    approval_threshold: u32,
}

impl Arbitrator {
    pub fn new(approval_threshold: u32) -> Self {
        Self { approval_threshold }
    }

    /// Group votes by issue, approve iff at least `approval_threshold`
    /// voters said yes. No retries, no LLM call: arbitration is pure
    /// computation over the votes already cast. Writes tickets for every
    /// approved candidate and returns the approved/rejected tallies plus
    /// written ticket paths, unless `dry_run` is set, in which case nothing
    /// is written and no ticket id is consumed.
    pub fn arbitrate(
        &self,
        candidates: &[CandidateIssue],
        votes: &[Vote],
        target: &Path,
        dry_run: bool,
    ) -> Result<(Vec<ApprovedIssue>, usize, Vec<String>)> {
        let mut by_issue: HashMap<&str, Vec<&Vote>> = HashMap::new();
        for vote in votes {
            by_issue.entry(vote.issue_id.as_str()).or_default().push(vote);
        }

        let mut approved = Vec::new();
        let mut rejected_count = 0usize;
        let mut ticket_paths = Vec::new();

        for candidate in candidates {
            let issue_votes: Vec<Vote> = by_issue
                .get(candidate.id.as_str())
                .map(|vs| vs.iter().map(|v| (*v).clone()).collect())
                .unwrap_or_default();

            let approve_count = issue_votes.iter().filter(|v| v.approve).count() as u32;
            let decision = approve_count >= self.approval_threshold;

            if !decision {
                rejected_count += 1;
                continue;
            }

            if dry_run {
                approved.push(ApprovedIssue {
                    candidate: candidate.clone(),
                    votes: issue_votes,
                    approved_at: chrono::Utc::now().to_rfc3339(),
                    ticket_path: None,
                    status: None,
                    consolidated_from: None,
                });
                continue;
            }

            let issue_id = tickets::next_issue_id(target)?;
            let mut candidate_with_id = candidate.clone();
            candidate_with_id.id = issue_id;

            let mut approved_issue = ApprovedIssue {
                candidate: candidate_with_id,
                votes: issue_votes,
                approved_at: chrono::Utc::now().to_rfc3339(),
                ticket_path: None,
                status: None,
                consolidated_from: None,
            };

            let path = tickets::write_ticket(target, &approved_issue)?;
            approved_issue.ticket_path = Some(path.clone());
            ticket_paths.push(path);
            approved.push(approved_issue);
        }

        Ok((approved, rejected_count, ticket_paths))
    }
}

/// Drive all three phases for one agent against `target`, updating the
/// issue store and writing tickets for whatever gets approved.
pub async fn run_agent<R: AgentRunner + Clone + Sync + Send + 'static>(
    runner: &R,
    prompts: &PromptEngine,
    config: &Config,
    agent: &AgentSpec,
    target: &Path,
    dry_run: bool,
) -> Result<AgentResult> {
    let started = std::time::Instant::now();
    info!(agent = agent.id, "scan: starting");

    let store_path = issue_store_path(target);
    let store: crate::storage::JsonStore<IssueStore> = crate::storage::JsonStore::new(&store_path);
    let current = store.load()?;

    let (dedup, dedup_cost) = dedup_summary(runner, &current, config.dedup_threshold, target).await;

    let scanner = Scanner::new(runner, prompts);
    let (candidates, scan_cost) = scanner.scan(agent, target, &dedup).await?;

    if candidates.is_empty() {
        info!(agent = agent.id, "scan: zero candidates");
        return Ok(AgentResult {
            cost_usd: dedup_cost + scan_cost,
            duration_ms: started.elapsed().as_millis() as u64,
            ..Default::default()
        });
    }

    let voters = VoterPool::new(runner, prompts, config.voter_count);
    let (votes, vote_cost) = voters.vote(&candidates, target).await?;

    let arbitrator = Arbitrator::new(config.approval_threshold);
    let (approved, rejected, ticket_paths) = arbitrator.arbitrate(&candidates, &votes, target, dry_run)?;

    if !dry_run {
        store.modify(|data| {
            for issue in &approved {
                if !data.issues.iter().any(|existing| existing.candidate.id == issue.candidate.id) {
                    data.issues.push(issue.clone());
                }
            }
            data.last_scan_at = Some(chrono::Utc::now().to_rfc3339());
        })?;
    }

    info!(
        agent = agent.id,
        approved = approved.len(),
        rejected,
        "scan: complete"
    );

    Ok(AgentResult {
        approved: approved.len(),
        rejected,
        ticket_paths,
        cost_usd: dedup_cost + scan_cost + vote_cost,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LineRange, Severity};

    fn sample_issue(id: &str, title: &str, category: &str, file: &str) -> ApprovedIssue {
        ApprovedIssue {
            candidate: CandidateIssue {
                id: id.to_string(),
                agent_id: "correctness".to_string(),
                title: title.to_string(),
                description: "desc".to_string(),
                severity: Severity::High,
                file_path: file.to_string(),
                line_range: LineRange::new(1, 2),
                category: category.to_string(),
                recommendation: "fix".to_string(),
                code_snippet: None,
            },
            votes: vec![],
            approved_at: "2026-01-01T00:00:00Z".to_string(),
            ticket_path: None,
            status: None,
            consolidated_from: None,
        }
    }

    #[test]
    fn test_direct_summary_formats_one_line_per_issue() {
        let issue = sample_issue("ISSUE-001", "off by one", "logic", "src/lib.rs");
        let refs = vec![&issue];
        let summary = direct_summary(&refs);
        assert_eq!(summary, "- [logic] \"off by one\" in src/lib.rs:1-2");
    }

    #[test]
    fn test_build_agent_prompt_includes_dedup_directive() {
        let agent = AgentSpec {
            id: "correctness",
            name: "Correctness",
            description: "d",
            system_prompt: "look for bugs",
            file_patterns: &["**/*.rs"],
        };
        let prompt = build_agent_prompt(&agent, "- [logic] \"x\" in a.rs", None);
        assert!(prompt.contains("DO NOT report issues matching any above"));
        assert!(prompt.contains("look for bugs"));
        assert!(prompt.contains("**/*.rs"));
    }

    #[test]
    fn test_build_agent_prompt_includes_memory_when_present() {
        let agent = AgentSpec {
            id: "correctness",
            name: "Correctness",
            description: "d",
            system_prompt: "look for bugs",
            file_patterns: &["**/*"],
        };
        let prompt = build_agent_prompt(&agent, "none", Some("ignore generated/*.rs"));
        assert!(prompt.contains("ignore generated/*.rs"));
    }

    #[test]
    fn test_build_agent_prompt_skips_blank_memory() {
        let agent = AgentSpec {
            id: "correctness",
            name: "Correctness",
            description: "d",
            system_prompt: "look for bugs",
            file_patterns: &["**/*"],
        };
        let prompt = build_agent_prompt(&agent, "none", Some("   \n"));
        assert!(!prompt.contains("User-provided context"));
    }

    fn vote(issue_id: &str, voter: &str, approve: bool) -> Vote {
        Vote {
            voter_id: voter.to_string(),
            issue_id: issue_id.to_string(),
            approve,
            reasoning: "r".to_string(),
        }
    }

    fn candidate(id: &str) -> CandidateIssue {
        CandidateIssue {
            id: id.to_string(),
            agent_id: "correctness".to_string(),
            title: "off by one".to_string(),
            description: "desc".to_string(),
            severity: Severity::High,
            file_path: "src/lib.rs".to_string(),
            line_range: LineRange::new(1, 2),
            category: "logic".to_string(),
            recommendation: "fix".to_string(),
            code_snippet: None,
        }
    }

    #[test]
    fn test_arbitrate_approves_at_exactly_the_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = vec![candidate("ISSUE-001")];
        let votes = vec![
            vote("ISSUE-001", "voter-1", true),
            vote("ISSUE-001", "voter-2", true),
            vote("ISSUE-001", "voter-3", false),
        ];
        let arbitrator = Arbitrator::new(2);
        let (approved, rejected, _) = arbitrator.arbitrate(&candidates, &votes, dir.path(), false).unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(rejected, 0);
    }

    #[test]
    fn test_arbitrate_rejects_a_single_approval_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = vec![candidate("ISSUE-001")];
        let votes = vec![
            vote("ISSUE-001", "voter-1", true),
            vote("ISSUE-001", "voter-2", false),
            vote("ISSUE-001", "voter-3", false),
        ];
        let arbitrator = Arbitrator::new(2);
        let (approved, rejected, _) = arbitrator.arbitrate(&candidates, &votes, dir.path(), false).unwrap();
        assert!(approved.is_empty());
        assert_eq!(rejected, 1);
    }

    #[test]
    fn test_arbitrate_rejects_zero_approvals_with_no_llm_involved() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = vec![candidate("ISSUE-001")];
        let votes = vec![
            vote("ISSUE-001", "voter-1", false),
            vote("ISSUE-001", "voter-2", false),
            vote("ISSUE-001", "voter-3", false),
        ];
        let arbitrator = Arbitrator::new(2);
        let (approved, rejected, _) = arbitrator.arbitrate(&candidates, &votes, dir.path(), false).unwrap();
        assert!(approved.is_empty());
        assert_eq!(rejected, 1);
    }

    #[test]
    fn test_arbitrate_dry_run_writes_no_ticket_and_consumes_no_id() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = vec![candidate("ISSUE-001")];
        let votes = vec![
            vote("ISSUE-001", "voter-1", true),
            vote("ISSUE-001", "voter-2", true),
        ];
        let arbitrator = Arbitrator::new(2);
        let (approved, rejected, ticket_paths) =
            arbitrator.arbitrate(&candidates, &votes, dir.path(), true).unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(rejected, 0);
        assert!(ticket_paths.is_empty());
        assert!(approved[0].ticket_path.is_none());
        assert!(!dir.path().join("tickets").exists());
    }
}
