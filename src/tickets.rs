//! Issue ticket files: one markdown file per approved issue, filed under
//! `.rover/tickets/<severity>/<id>.md`. IDs are sequential across every
//! severity folder and are never reused, even after a ticket is removed —
//! the counter is derived by scanning the highest id on disk, not stored
//! separately, so there is nothing to get out of sync.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{ApprovedIssue, Severity};
use crate::storage::{JsonStore, rover_dir};

fn issues_dir(target: &Path) -> PathBuf {
    rover_dir(target).join("tickets")
}

fn severity_dir(target: &Path, severity: Severity) -> PathBuf {
    issues_dir(target).join(severity.folder())
}

fn counter_path(target: &Path) -> PathBuf {
    rover_dir(target).join("issue-counter.json")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct IssueCounter {
    /// The highest id ever assigned. Monotonic: deleting tickets never
    /// moves this backward, so ids are never reused.
    highest_assigned: u32,
}

impl Default for IssueCounter {
    fn default() -> Self {
        Self { highest_assigned: 0 }
    }
}

/// Assign and persist the next sequential id, zero-padded to three digits
/// (`ISSUE-1000` and above simply widen). Backed by a small counter file so
/// that removing a ticket never frees its id for reuse; the counter is
/// bootstrapped from whatever `ISSUE-NNN.md` files already exist on disk
/// the first time it's read, so pre-existing tickets are respected.
pub fn next_issue_id(target: &Path) -> Result<String> {
    let store: JsonStore<IssueCounter> = JsonStore::new(counter_path(target));
    let next = store.modify(|counter| {
        if counter.highest_assigned == 0 {
            counter.highest_assigned = highest_id_on_disk(target);
        }
        counter.highest_assigned += 1;
        counter.highest_assigned
    })?;
    Ok(format!("ISSUE-{next:03}"))
}

fn highest_id_on_disk(target: &Path) -> u32 {
    let mut max_seen = 0u32;
    let dir = issues_dir(target);
    if !dir.exists() {
        return 0;
    }
    for severity in Severity::all() {
        let folder = severity_dir(target, severity);
        let Ok(entries) = std::fs::read_dir(&folder) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(n) = parse_issue_number(&name) {
                max_seen = max_seen.max(n);
            }
        }
    }
    max_seen
}

fn parse_issue_number(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(".md")?;
    let num = stem.strip_prefix("ISSUE-")?;
    num.parse().ok()
}

/// Render an approved issue as a ticket's markdown body, per the stable
/// format: title, metadata block (Severity, Category, Detected by, File),
/// Description, optional Problematic Code, Recommendation, and a footer
/// dateline.
pub fn render_ticket(issue: &ApprovedIssue) -> String {
    let c = &issue.candidate;
    let mut body = String::new();
    body.push_str(&format!("# {}: {}\n\n", c.id, c.title));
    body.push_str(&format!("- **Severity:** {}\n", c.severity));
    body.push_str(&format!("- **Category:** {}\n", c.category));
    body.push_str(&format!("- **Detected by:** {}\n", c.agent_id));
    body.push_str(&format!("- **File:** `{}`", c.file_path));
    if let Some(range) = c.line_range {
        body.push_str(&format!(" (lines {}-{})", range.start, range.end));
    }
    body.push('\n');
    if let Some(sources) = &issue.consolidated_from {
        body.push_str(&format!("- **Consolidated from**: {}\n", sources.join(", ")));
    }
    body.push('\n');

    body.push_str("## Description\n\n");
    body.push_str(&c.description);
    body.push_str("\n\n");

    if let Some(snippet) = &c.code_snippet {
        body.push_str("## Problematic Code\n\n```\n");
        body.push_str(snippet);
        body.push_str("\n```\n\n");
    }

    body.push_str("## Recommendation\n\n");
    body.push_str(&c.recommendation);
    body.push_str("\n\n");

    body.push_str(&format!("---\n_Detected {}_\n", issue.approved_at));

    body
}

/// Write a ticket for `issue` under its severity folder, returning the path
/// written (relative to `target`, as stored in `ApprovedIssue::ticket_path`).
pub fn write_ticket(target: &Path, issue: &ApprovedIssue) -> Result<String> {
    let folder = severity_dir(target, issue.candidate.severity);
    std::fs::create_dir_all(&folder)?;

    let file_name = format!("{}.md", issue.candidate.id);
    let full_path = folder.join(&file_name);
    std::fs::write(&full_path, render_ticket(issue))?;

    let relative = full_path
        .strip_prefix(target)
        .unwrap_or(&full_path)
        .to_string_lossy()
        .to_string();
    Ok(relative)
}

/// Remove a ticket file given its severity and id, ignoring a missing file.
pub fn remove_ticket(target: &Path, severity: Severity, issue_id: &str) -> Result<()> {
    let path = severity_dir(target, severity).join(format!("{issue_id}.md"));
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
