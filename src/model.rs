//! Core data model shared by every component: agent specs, candidate/approved
//! issues, votes, clusters, and the persisted run-state records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Severity of a finding, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn folder(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn all() -> [Severity; 4] {
        [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ]
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.folder())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// A stable, immutable scan policy: system prompt plus file-glob scope.
/// The catalog of these is built once at program start and never mutated.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub system_prompt: &'static str,
    /// Glob patterns; entries prefixed with `!` are excludes.
    pub file_patterns: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn new(start: u32, end: u32) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }
}

impl Serialize for LineRange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Raw {
            start: u32,
            end: u32,
        }
        Raw {
            start: self.start,
            end: self.end,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LineRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            start: u32,
            end: u32,
        }
        let raw = Raw::deserialize(deserializer)?;
        LineRange::new(raw.start, raw.end)
            .ok_or_else(|| serde::de::Error::custom("line range start must be <= end"))
    }
}

/// An unvalidated issue emitted by a Scanner. Transient — lives only within
/// one scan invocation unless it passes voting and becomes an `ApprovedIssue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateIssue {
    pub id: String,
    pub agent_id: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_range: Option<LineRange>,
    pub category: String,
    pub recommendation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
}

/// One voter's verdict on one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: String,
    pub issue_id: String,
    pub approve: bool,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    WontFix,
}

/// A candidate that passed the voting threshold and was ticketed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedIssue {
    #[serde(flatten)]
    pub candidate: CandidateIssue,
    pub votes: Vec<Vote>,
    pub approved_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<IssueStatus>,
    /// Ids of the issues this one replaced, set only on consolidated tickets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidated_from: Option<Vec<String>>,
}

impl ApprovedIssue {
    pub fn is_open(&self) -> bool {
        !matches!(self.status, Some(IssueStatus::WontFix))
    }
}

/// Persisted at `<target>/.rover/issues.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueStore {
    pub version: u32,
    pub issues: Vec<ApprovedIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scan_at: Option<String>,
}

impl Default for IssueStore {
    fn default() -> Self {
        Self {
            version: 1,
            issues: Vec::new(),
            last_scan_at: None,
        }
    }
}

/// Transient grouping produced by deterministic clustering. Always has
/// at least two member issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCluster {
    pub id: String,
    pub reason: String,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunEntry {
    pub agent_id: String,
    pub name: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentRunResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub approved: usize,
    pub rejected: usize,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

/// Persisted at `<target>/.rover/batch-run-state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRunState {
    pub run_id: String,
    pub version: u32,
    pub target_path: String,
    pub requested_agent_ids: Vec<String>,
    pub agents: Vec<AgentRunEntry>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub concurrency: usize,
}

impl BatchRunState {
    pub fn is_complete(&self) -> bool {
        self.agents.iter().all(|a| a.status == AgentStatus::Completed || a.status == AgentStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    InProgress,
    ReadyForReview,
    PrCreated,
    Merged,
    Error,
}

/// Persisted at `<target>/.rover/fix-state.json` as one array `fixes[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRecord {
    pub issue_id: String,
    pub branch_name: String,
    pub worktree_path: String,
    pub status: FixStatus,
    pub iterations: u32,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub issue_content: String,
    pub issue_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixStateFile {
    pub fixes: Vec<FixRecord>,
}

impl Default for FixStateFile {
    fn default() -> Self {
        Self { fixes: Vec::new() }
    }
}

/// One entry in a `FixTrace` append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub iteration: u32,
    pub session_id: Option<String>,
    pub output: String,
    pub exit_code: i32,
    pub terminal_marker: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub review_outputs: Vec<String>,
    pub at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FixTrace {
    pub entries: Vec<TraceEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Blocks,
    Conflicts,
    Enables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: DependencyType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub name: String,
    pub issues: Vec<String>,
}

/// Planner output before markdown/Mermaid rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub dependencies: Vec<Dependency>,
    pub parallel_groups: Vec<ParallelGroup>,
    pub summary: String,
    pub execution_order: Vec<String>,
    pub commands_markdown: String,
}

/// Per-issue review finding as produced by the multi-aspect reviewer's
/// structured parse pass (spec §4.E step 4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    MustFix,
    ShouldFix,
    Suggestion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub severity: FindingSeverity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewAnalysis {
    pub is_clean: bool,
    pub items: Vec<ReviewItem>,
}

impl ReviewAnalysis {
    pub fn must_fix(&self) -> Vec<&ReviewItem> {
        self.items
            .iter()
            .filter(|i| i.severity == FindingSeverity::MustFix)
            .collect()
    }

    pub fn should_fix(&self) -> Vec<&ReviewItem> {
        self.items
            .iter()
            .filter(|i| i.severity == FindingSeverity::ShouldFix)
            .collect()
    }

    pub fn has_actionable(&self) -> bool {
        !self.must_fix().is_empty() || !self.should_fix().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_roundtrips_through_folder_name() {
        for s in Severity::all() {
            assert_eq!(Severity::from_str(s.folder()).unwrap(), s);
        }
    }

    #[test]
    fn severity_from_str_rejects_unknown() {
        assert!(Severity::from_str("urgent").is_err());
    }

    #[test]
    fn line_range_rejects_inverted_bounds() {
        assert!(LineRange::new(10, 5).is_none());
        assert!(LineRange::new(5, 10).is_some());
        assert!(LineRange::new(5, 5).is_some());
    }

    #[test]
    fn line_range_deserialize_rejects_inverted_bounds() {
        let err = serde_json::from_str::<LineRange>(r#"{"start": 10, "end": 1}"#).unwrap_err();
        assert!(err.to_string().contains("start must be"));
    }

    #[test]
    fn approved_issue_wont_fix_is_not_open() {
        let candidate = CandidateIssue {
            id: "x-1".into(),
            agent_id: "security".into(),
            title: "t".into(),
            description: "d".into(),
            severity: Severity::High,
            file_path: "src/lib.rs".into(),
            line_range: None,
            category: "security".into(),
            recommendation: "fix it".into(),
            code_snippet: None,
        };
        let mut issue = ApprovedIssue {
            candidate,
            votes: vec![],
            approved_at: "2026-01-01T00:00:00Z".into(),
            ticket_path: None,
            status: None,
            consolidated_from: None,
        };
        assert!(issue.is_open());
        issue.status = Some(IssueStatus::WontFix);
        assert!(!issue.is_open());
    }

    #[test]
    fn review_analysis_separates_must_and_should_fix() {
        let analysis = ReviewAnalysis {
            is_clean: false,
            items: vec![
                ReviewItem {
                    severity: FindingSeverity::MustFix,
                    description: "a".into(),
                    file: None,
                },
                ReviewItem {
                    severity: FindingSeverity::ShouldFix,
                    description: "b".into(),
                    file: None,
                },
                ReviewItem {
                    severity: FindingSeverity::Suggestion,
                    description: "c".into(),
                    file: None,
                },
            ],
        };
        assert_eq!(analysis.must_fix().len(), 1);
        assert_eq!(analysis.should_fix().len(), 1);
        assert!(analysis.has_actionable());
    }

    #[test]
    fn review_analysis_clean_has_no_actionable_items() {
        let analysis = ReviewAnalysis {
            is_clean: true,
            items: vec![],
        };
        assert!(!analysis.has_actionable());
    }
}
