//! The Batch Runner: drives `scan::run_agent` across a set of agent ids with
//! bounded concurrency, persisting resumable progress so a killed or
//! interrupted batch can pick up where it left off.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{AgentRunEntry, AgentRunResult, AgentStatus, AgentSpec, BatchRunState};
use crate::prompts::PromptEngine;
use crate::runner::AgentRunner;
use crate::scan;
use crate::storage::{JsonStore, batch_state_path};

/// A run is considered abandoned, and its in-progress entries reset to
/// `pending`, once it's older than this.
const STALE_AFTER_HOURS: i64 = 24;

fn new_run_id() -> String {
    format!("batch-{:x}", std::process::id())
}

fn parse_timestamp(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&chrono::Utc))
}

fn is_stale(state: &BatchRunState, now: chrono::DateTime<chrono::Utc>) -> bool {
    match parse_timestamp(&state.started_at) {
        Some(started) => (now - started).num_hours() >= STALE_AFTER_HOURS,
        None => true,
    }
}

/// Load the persisted batch state for `target`, if any, and decide whether
/// to resume it (same set of agent ids, not stale, not complete) or start a
/// fresh run. Entries left `running` from a killed process are reset to
/// `pending` on resume, since nothing observed them finish.
fn load_or_init(target: &Path, agent_ids: &[String], concurrency: usize, now: chrono::DateTime<chrono::Utc>) -> Result<BatchRunState> {
    let store: JsonStore<Option<BatchRunState>> = JsonStore::new(batch_state_path(target));
    let loaded = match store.load() {
        Ok(v) => v,
        Err(Error::Corruption { path, detail }) => {
            warn!(path = %path.display(), detail, "batch-run-state.json corrupted, treating as absent and starting fresh");
            None
        }
        Err(e) => return Err(e),
    };
    if let Some(mut existing) = loaded {
        let same_agents = {
            let mut a = existing.requested_agent_ids.clone();
            let mut b = agent_ids.to_vec();
            a.sort();
            b.sort();
            a == b
        };

        if same_agents && !existing.is_complete() && !is_stale(&existing, now) {
            for entry in &mut existing.agents {
                if entry.status == AgentStatus::Running {
                    entry.status = AgentStatus::Pending;
                }
            }
            info!(run_id = %existing.run_id, "resuming prior batch run");
            return Ok(existing);
        }

        if same_agents && is_stale(&existing, now) {
            warn!(run_id = %existing.run_id, "prior batch run is stale, starting fresh");
        }
    }

    Ok(BatchRunState {
        run_id: new_run_id(),
        version: 1,
        target_path: target.display().to_string(),
        requested_agent_ids: agent_ids.to_vec(),
        agents: agent_ids
            .iter()
            .map(|id| AgentRunEntry {
                agent_id: id.clone(),
                name: id.clone(),
                status: AgentStatus::Pending,
                completed_at: None,
                error: None,
                result: None,
            })
            .collect(),
        started_at: now.to_rfc3339(),
        completed_at: None,
        concurrency,
    })
}

/// Run every agent in `agents` against `target` with up to `concurrency`
/// running at once, persisting `BatchRunState` after every transition so a
/// killed process can resume from the last completed agent.
pub async fn run_all<R: AgentRunner + Clone + Sync + Send + 'static>(
    runner: &R,
    prompts: &PromptEngine,
    config: &Config,
    agents: &[&'static AgentSpec],
    target: &Path,
    concurrency: usize,
    dry_run: bool,
) -> Result<BatchRunState> {
    let agent_ids: Vec<String> = agents.iter().map(|a| a.id.to_string()).collect();
    let now = chrono::Utc::now();
    let mut state = load_or_init(target, &agent_ids, concurrency, now)?;

    let store: JsonStore<Option<BatchRunState>> = JsonStore::new(batch_state_path(target));
    store.save(&Some(state.clone()))?;

    let pending_ids: Vec<String> = state
        .agents
        .iter()
        .filter(|a| a.status == AgentStatus::Pending)
        .map(|a| a.agent_id.clone())
        .collect();

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set: JoinSet<(String, std::result::Result<crate::scan::AgentResult, String>)> = JoinSet::new();

    for agent_id in &pending_ids {
        mark_running(&store, target, agent_id)?;

        let Some(agent) = agents.iter().find(|a| a.id == agent_id) else {
            continue;
        };
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let runner = runner.clone();
        let prompts = prompts.clone();
        let config = config.clone();
        let agent = *agent;
        let target = target.to_path_buf();
        let agent_id = agent_id.clone();

        set.spawn(async move {
            let _permit = permit;
            let result = scan::run_agent(&runner, &prompts, &config, agent, &target, dry_run)
                .await
                .map_err(|e| e.to_string());
            (agent_id, result)
        });
    }

    while let Some(joined) = set.join_next().await {
        let (agent_id, outcome) = match joined {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "batch agent task panicked");
                continue;
            }
        };
        persist_outcome(&store, target, &agent_id, outcome)?;
    }

    state = match store.load() {
        Ok(v) => v.unwrap_or(state),
        Err(Error::Corruption { path, detail }) => {
            warn!(path = %path.display(), detail, "batch-run-state.json corrupted after run, falling back to in-memory state");
            state
        }
        Err(e) => return Err(e),
    };
    if state.is_complete() && state.completed_at.is_none() {
        state.completed_at = Some(chrono::Utc::now().to_rfc3339());
        store.save(&Some(state.clone()))?;
    }

    Ok(state)
}

fn mark_running(store: &JsonStore<Option<BatchRunState>>, _target: &Path, agent_id: &str) -> Result<()> {
    store.modify(|state| {
        if let Some(state) = state {
            if let Some(entry) = state.agents.iter_mut().find(|a| a.agent_id == agent_id) {
                entry.status = AgentStatus::Running;
            }
        }
    })
}

fn persist_outcome(
    store: &JsonStore<Option<BatchRunState>>,
    _target: &Path,
    agent_id: &str,
    outcome: std::result::Result<crate::scan::AgentResult, String>,
) -> Result<()> {
    store.modify(|state| {
        let Some(state) = state else { return };
        let Some(entry) = state.agents.iter_mut().find(|a| a.agent_id == agent_id) else {
            return;
        };
        match outcome {
            Ok(result) => {
                entry.status = AgentStatus::Completed;
                entry.result = Some(AgentRunResult {
                    approved: result.approved,
                    rejected: result.rejected,
                    cost_usd: result.cost_usd,
                    duration_ms: result.duration_ms,
                });
            }
            Err(e) => {
                entry.status = AgentStatus::Error;
                entry.error = Some(e);
            }
        }
        entry.completed_at = Some(chrono::Utc::now().to_rfc3339());
    })
}
