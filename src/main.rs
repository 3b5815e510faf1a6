mod agents;
mod batch;
mod cli;
mod config;
mod consolidate;
mod error;
mod fix;
mod issues;
mod json_parse;
mod model;
mod plan;
mod process;
mod prompts;
mod review;
mod runner;
mod scan;
mod storage;
mod submission;
mod tickets;
mod worktree;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use crate::cli::{Cli, Command, IssuesAction, ReviewAction};
use crate::config::Config;
use crate::error::Result;
use crate::prompts::PromptEngine;
use crate::runner::{AnyRunner, build_runner};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .init();
}

fn resolve_path(path: Option<&str>) -> PathBuf {
    path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

fn build_agent_runner(config: &Config) -> Result<AnyRunner> {
    build_runner(
        &config.runner,
        &config.agent_binary,
        config.agent_model.as_deref(),
        config.agent_timeout.map(Duration::from_secs),
    )
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&cli, &config).await {
        error!(error = %e, "rover exited with an error");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Command::Scan {
            path,
            all,
            agent,
            concurrency,
            dry_run,
        } => run_scan(config, resolve_path(path.as_deref()), *all, agent.as_deref(), *concurrency, *dry_run).await,

        Command::Fix {
            ids,
            concurrency,
            max_iterations,
        } => run_fix(config, ids, *concurrency, *max_iterations).await,

        Command::Review { action } => run_review(config, action).await,

        Command::Issues {
            action,
            severity,
            all,
        } => run_issues(action.as_ref(), severity.as_deref(), *all),

        Command::Consolidate {
            path,
            dry_run,
            concurrency,
        } => run_consolidate(config, resolve_path(path.as_deref()), *dry_run, *concurrency).await,

        Command::Plan { path } => run_plan(config, resolve_path(path.as_deref())).await,

        Command::Agents => {
            run_agents_list();
            Ok(())
        }

        Command::Remember { text } => run_remember(Path::new("."), text),
    }
}

async fn run_scan(
    config: &Config,
    target: PathBuf,
    all: bool,
    agent_id: Option<&str>,
    concurrency: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    let runner = build_agent_runner(config)?;
    let prompts = PromptEngine::new(None);
    let concurrency = concurrency.unwrap_or(config.scan_concurrency);

    let selected: Vec<&'static model::AgentSpec> = if let Some(id) = agent_id {
        vec![agents::find(id).ok_or_else(|| error::Error::AgentNotFound(id.to_string()))?]
    } else if all {
        agents::AGENTS.iter().collect()
    } else {
        agents::default_set()
    };

    let state = batch::run_all(&runner, &prompts, config, &selected, &target, concurrency, dry_run).await?;

    for entry in &state.agents {
        match &entry.result {
            Some(result) => info!(
                agent = entry.agent_id,
                approved = result.approved,
                rejected = result.rejected,
                cost_usd = result.cost_usd,
                dry_run,
                "scan complete"
            ),
            None => info!(agent = entry.agent_id, status = ?entry.status, error = ?entry.error, "scan did not complete"),
        }
    }

    Ok(())
}

async fn run_fix(config: &Config, ids: &[String], concurrency: Option<usize>, max_iterations: Option<u32>) -> Result<()> {
    let runner = build_agent_runner(config)?;
    let prompts = PromptEngine::new(None);

    let mut config = config.clone();
    if let Some(c) = concurrency {
        config.fix_concurrency = c;
    }
    if let Some(m) = max_iterations {
        config.max_iterations = m;
    }

    let target = Path::new(".");
    let results = fix::run_fix_all(&runner, &prompts, &config, target, ids).await?;

    for result in &results {
        info!(
            issue = result.issue_id,
            outcome = ?result.outcome,
            iterations = result.iterations,
            error = ?result.error,
            "fix finished"
        );
    }

    Ok(())
}

async fn run_review(config: &Config, action: &ReviewAction) -> Result<()> {
    let target = Path::new(".");
    match action {
        ReviewAction::List => {
            for record in review::list(target, config)? {
                println!(
                    "{}\t{:?}\t{}\t{}",
                    record.issue_id, record.status, record.branch_name, record.issue_summary
                );
            }
            Ok(())
        }
        ReviewAction::Submit { id, all, draft } => {
            if *all {
                for (issue_id, outcome) in review::submit_all(target, config, *draft)? {
                    match outcome {
                        Ok(record) => info!(issue = issue_id, pr_url = ?record.pr_url, "submitted"),
                        Err(e) => error!(issue = issue_id, error = %e, "submit failed"),
                    }
                }
                Ok(())
            } else {
                let id = id
                    .as_deref()
                    .ok_or_else(|| error::Error::ConfigValidation("review submit requires an id or --all".to_string()))?;
                let record = review::submit_one(target, config, id, *draft)?;
                println!("{}", record.pr_url.unwrap_or_default());
                Ok(())
            }
        }
        ReviewAction::Clean { id, all } => {
            if *all {
                for (issue_id, outcome) in review::clean_all(target, config)? {
                    if let Err(e) = outcome {
                        error!(issue = issue_id, error = %e, "clean failed");
                    }
                }
                Ok(())
            } else {
                let id = id
                    .as_deref()
                    .ok_or_else(|| error::Error::ConfigValidation("review clean requires an id or --all".to_string()))?;
                review::clean_one(target, config, id)
            }
        }
    }
}

fn run_issues(action: Option<&IssuesAction>, severity: Option<&str>, all: bool) -> Result<()> {
    let target = Path::new(".");
    match action {
        None => {
            for issue in issues::list(target, severity, all)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    issue.candidate.id, issue.candidate.severity, issue.candidate.category, issue.candidate.title
                );
            }
            Ok(())
        }
        Some(IssuesAction::View { id }) => {
            println!("{}", issues::view(target, id)?);
            Ok(())
        }
        Some(IssuesAction::Copy { id }) => {
            println!("{}", issues::copy_path(target, id)?);
            Ok(())
        }
        Some(IssuesAction::Remove { ids }) => issues::remove(target, ids),
        Some(IssuesAction::Ignore { ids }) => issues::ignore(target, ids),
    }
}

async fn run_consolidate(config: &Config, target: PathBuf, dry_run: bool, concurrency: Option<usize>) -> Result<()> {
    let runner = build_agent_runner(config)?;
    let prompts = PromptEngine::new(None);
    let concurrency = concurrency.unwrap_or(config.scan_concurrency);

    let report = consolidate::run(&runner, &prompts, &target, concurrency, dry_run).await?;
    info!(
        clusters_found = report.clusters_found,
        merges_applied = report.merges_applied,
        issues_removed = report.issues_removed,
        dry_run = report.dry_run,
        "consolidate finished"
    );
    Ok(())
}

async fn run_plan(config: &Config, target: PathBuf) -> Result<()> {
    let runner = build_agent_runner(config)?;
    let prompts = PromptEngine::new(None);

    let store: storage::JsonStore<model::IssueStore> = storage::JsonStore::new(storage::issue_store_path(&target));
    let data = store.load()?;
    let open: Vec<model::ApprovedIssue> = data.issues.into_iter().filter(|i| i.is_open()).collect();

    if open.is_empty() {
        info!("no open issues to plan over");
        return Ok(());
    }

    let execution_plan = plan::build_plan(&runner, &prompts, &target, &open).await?;
    let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let path = plan::save_plan(&target, &execution_plan, &timestamp)?;
    info!(path, "plan written");
    println!("{path}");
    Ok(())
}

fn run_agents_list() {
    for agent in agents::AGENTS {
        println!("{}\t{}\t{}", agent.id, agent.name, agent.description);
    }
}

fn run_remember(target: &Path, text: &str) -> Result<()> {
    let path = storage::memory_path(target);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "- {text}")?;
    Ok(())
}
