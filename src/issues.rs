//! Issue management: view, copy, remove, and ignore tickets, plus the
//! bare `issues` listing. All operations work against the same
//! `IssueStore`/ticket-file pair the scan pipeline writes to.

use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::{ApprovedIssue, IssueStatus, IssueStore, Severity};
use crate::storage::{JsonStore, issue_store_path};
use crate::tickets;

/// List open issues, optionally filtered by minimum severity. With
/// `all_severities` unset, the default filter keeps only `high` and
/// `critical` findings — the ones worth surfacing without being asked.
pub fn list(target: &Path, severity: Option<&str>, all_severities: bool) -> Result<Vec<ApprovedIssue>> {
    let store: JsonStore<IssueStore> = JsonStore::new(issue_store_path(target));
    let data = store.load()?;

    let min_severity = match severity {
        Some(s) => Some(Severity::from_str(s).map_err(Error::ConfigValidation)?),
        None if all_severities => None,
        None => Some(Severity::High),
    };

    Ok(data
        .issues
        .into_iter()
        .filter(|i| i.is_open())
        .filter(|i| min_severity.is_none_or(|min| i.candidate.severity >= min))
        .collect())
}

fn find_issue(target: &Path, issue_id: &str) -> Result<ApprovedIssue> {
    let store: JsonStore<IssueStore> = JsonStore::new(issue_store_path(target));
    let data = store.load()?;
    data.issues
        .into_iter()
        .find(|i| i.candidate.id == issue_id)
        .ok_or_else(|| Error::TicketNotFound(issue_id.to_string()))
}

/// Return the full ticket markdown for one issue, re-rendering it if the
/// ticket file on disk has gone missing.
pub fn view(target: &Path, issue_id: &str) -> Result<String> {
    let issue = find_issue(target, issue_id)?;
    match &issue.ticket_path {
        Some(path) => {
            std::fs::read_to_string(target.join(path)).or_else(|_| Ok(tickets::render_ticket(&issue)))
        }
        None => Ok(tickets::render_ticket(&issue)),
    }
}

/// Return the ticket's path relative to `target`, for piping to a
/// clipboard tool.
pub fn copy_path(target: &Path, issue_id: &str) -> Result<String> {
    let issue = find_issue(target, issue_id)?;
    issue
        .ticket_path
        .ok_or_else(|| Error::TicketNotFound(issue_id.to_string()))
}

/// Permanently delete one or more tickets: the file on disk and the
/// `IssueStore` entry.
pub fn remove(target: &Path, issue_ids: &[String]) -> Result<()> {
    let store: JsonStore<IssueStore> = JsonStore::new(issue_store_path(target));
    store.modify(|data| {
        for id in issue_ids {
            if let Some(pos) = data.issues.iter().position(|i| &i.candidate.id == id) {
                let issue = data.issues.remove(pos);
                let _ = tickets::remove_ticket(target, issue.candidate.severity, id);
            }
        }
    })
}

/// Mark one or more issues `wont_fix` without deleting the ticket file.
pub fn ignore(target: &Path, issue_ids: &[String]) -> Result<()> {
    let store: JsonStore<IssueStore> = JsonStore::new(issue_store_path(target));
    store.modify(|data| {
        for id in issue_ids {
            if let Some(issue) = data.issues.iter_mut().find(|i| &i.candidate.id == id) {
                issue.status = Some(IssueStatus::WontFix);
            }
        }
    })
}
