//! The Planner: asks an agent to sequence open issues into a dependency
//! graph, then guarantees a few structural invariants the LLM's answer
//! might not honor on its own, and renders the whole thing — including a
//! Mermaid flowchart — as one markdown document saved under
//! `.rover/plans/`.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::json_parse;
use crate::model::{ApprovedIssue, Dependency, ExecutionPlan, ParallelGroup};
use crate::prompts::PromptEngine;
use crate::runner::{AgentRunner, Phase};
use crate::storage::plans_dir;

#[derive(Debug, Deserialize)]
struct PlanOutput {
    #[serde(default)]
    dependencies: Vec<Dependency>,
    #[serde(default)]
    parallel_groups: Vec<ParallelGroup>,
    #[serde(default)]
    execution_order: Vec<String>,
    summary: String,
}

/// Ask the planner agent to sequence `issues`, then post-process the answer
/// so every issue appears in exactly one parallel group and an execution
/// order is always present, even if the agent's answer left gaps.
pub async fn build_plan<R: AgentRunner>(
    runner: &R,
    prompts: &PromptEngine,
    target: &Path,
    issues: &[ApprovedIssue],
) -> Result<ExecutionPlan> {
    let candidates: Vec<_> = issues.iter().map(|i| &i.candidate).collect();
    let issues_json = serde_json::to_string_pretty(&candidates).map_err(|e| Error::Parse {
        context: "plan input serialization".to_string(),
        source: e.to_string(),
    })?;

    let mut vars = HashMap::new();
    vars.insert("repo_path".to_string(), target.display().to_string());
    vars.insert("issues_json".to_string(), issues_json);
    let prompt = prompts.render_phase("plan", &vars)?;

    let result = runner.run(Phase::Plan, &prompt, target, None).await?;
    if result.exit_code != 0 {
        return Err(Error::Transport(format!(
            "plan agent exited with code {}",
            result.exit_code
        )));
    }

    let parsed: PlanOutput = json_parse::parse_tolerant(&result.stdout, "plan output")?;
    let all_ids: Vec<String> = issues.iter().map(|i| i.candidate.id.clone()).collect();

    let parallel_groups = fill_gaps(parsed.parallel_groups, &all_ids);
    let execution_order = if parsed.execution_order.is_empty() {
        all_ids.clone()
    } else {
        parsed.execution_order
    };

    let mut plan = ExecutionPlan {
        dependencies: parsed.dependencies,
        parallel_groups,
        summary: parsed.summary,
        execution_order,
        commands_markdown: String::new(),
    };
    plan.commands_markdown = render_commands_markdown(&plan, issues);

    Ok(plan)
}

/// Any issue the agent's `parallel_groups` answer didn't place anywhere is
/// dropped into a synthesized "Independent" group, so downstream consumers
/// never have to special-case a missing issue.
fn fill_gaps(mut groups: Vec<ParallelGroup>, all_ids: &[String]) -> Vec<ParallelGroup> {
    let placed: std::collections::HashSet<&String> =
        groups.iter().flat_map(|g| g.issues.iter()).collect();
    let missing: Vec<String> = all_ids
        .iter()
        .filter(|id| !placed.contains(id))
        .cloned()
        .collect();
    if !missing.is_empty() {
        groups.push(ParallelGroup {
            name: "Independent".to_string(),
            issues: missing,
        });
    }
    groups
}

/// Render the plan as a markdown document: summary, a Mermaid flowchart of
/// the dependency graph, the parallel groups, and a per-step `rover fix`
/// command list following `execution_order`.
fn render_commands_markdown(plan: &ExecutionPlan, issues: &[ApprovedIssue]) -> String {
    let title_for = |id: &str| -> String {
        issues
            .iter()
            .find(|i| i.candidate.id == id)
            .map(|i| i.candidate.title.clone())
            .unwrap_or_default()
    };

    let mut md = String::new();
    md.push_str("# Execution Plan\n\n");
    md.push_str(&plan.summary);
    md.push_str("\n\n");

    md.push_str("## Dependency Graph\n\n```mermaid\nflowchart TD\n");
    for id in &plan.execution_order {
        md.push_str(&format!("    {id}[\"{id}: {}\"]\n", escape_mermaid(&title_for(id))));
    }
    for dep in &plan.dependencies {
        let arrow = match dep.kind {
            crate::model::DependencyType::Blocks => "-->|blocks|",
            crate::model::DependencyType::Conflicts => "-.->|conflicts|",
            crate::model::DependencyType::Enables => "-->|enables|",
        };
        md.push_str(&format!("    {} {} {}\n", dep.from, arrow, dep.to));
    }
    md.push_str("```\n\n");

    md.push_str("## Parallel Groups\n\n");
    for group in &plan.parallel_groups {
        md.push_str(&format!("- **{}**: {}\n", group.name, group.issues.join(", ")));
    }
    md.push('\n');

    md.push_str("## Suggested Commands\n\n```\n");
    for id in &plan.execution_order {
        md.push_str(&format!("rover fix {id}\n"));
    }
    md.push_str("```\n");

    md
}

fn escape_mermaid(title: &str) -> String {
    title.replace('"', "'")
}

/// Persist a built plan under `.rover/plans/<timestamp>-plan.md`, returning
/// the path written.
pub fn save_plan(target: &Path, plan: &ExecutionPlan, timestamp: &str) -> Result<String> {
    let dir = plans_dir(target);
    std::fs::create_dir_all(&dir)?;

    let file_name = format!("{timestamp}-plan.md");
    let path = dir.join(&file_name);
    std::fs::write(&path, &plan.commands_markdown)?;

    let relative = path
        .strip_prefix(target)
        .unwrap_or(&path)
        .to_string_lossy()
        .to_string();
    Ok(relative)
}
