//! The built-in scan agent catalog. Each entry is a lens the scanner can be
//! asked to apply to a file — a short id, a human label, and the fragment
//! of guidance that gets folded into the scan prompt for that lens.

use crate::model::AgentSpec;

/// All registered scan agents, in catalog order.
pub const AGENTS: &[AgentSpec] = &[
    AgentSpec {
        id: "correctness",
        name: "Correctness",
        description: "Logic errors, off-by-one mistakes, incorrect conditionals, unhandled edge cases, and code that does not do what its name or comments claim.",
        system_prompt: include_str!("default_prompts/agent_correctness.md"),
        file_patterns: &["**/*"],
    },
    AgentSpec {
        id: "security",
        name: "Security",
        description: "Injection vectors, unsafe deserialization, missing authorization checks, secrets in source, and unsafe use of user-controlled input.",
        system_prompt: include_str!("default_prompts/agent_security.md"),
        file_patterns: &["**/*"],
    },
    AgentSpec {
        id: "performance",
        name: "Performance",
        description: "Unnecessary allocations, quadratic loops over data that can grow, repeated work that could be cached or hoisted, and blocking calls on hot paths.",
        system_prompt: include_str!("default_prompts/agent_performance.md"),
        file_patterns: &["**/*"],
    },
    AgentSpec {
        id: "style",
        name: "Style & consistency",
        description: "Deviations from the prevailing conventions of the surrounding code: naming, module layout, error handling style, and dead code.",
        system_prompt: include_str!("default_prompts/agent_style.md"),
        file_patterns: &["**/*"],
    },
    AgentSpec {
        id: "dependencies",
        name: "Dependencies",
        description: "Outdated, duplicated, or unused dependencies, and version constraints looser or tighter than the rest of the project uses.",
        system_prompt: include_str!("default_prompts/agent_dependencies.md"),
        file_patterns: &["**/Cargo.toml", "**/package.json", "**/go.mod", "**/requirements*.txt"],
    },
    AgentSpec {
        id: "architecture",
        name: "Architecture",
        description: "Layering violations, circular coupling between modules, and abstractions that no longer match how the code is actually used.",
        system_prompt: include_str!("default_prompts/agent_architecture.md"),
        file_patterns: &["**/*"],
    },
];

/// Look up a registered agent by id.
pub fn find(id: &str) -> Option<&'static AgentSpec> {
    AGENTS.iter().find(|a| a.id == id)
}

/// The default subset of agents a plain `scan` (without `--all`) runs.
/// Style and dependencies are opt-in via `--all` since they tend to surface
/// a high volume of low-severity findings.
pub fn default_set() -> Vec<&'static AgentSpec> {
    AGENTS
        .iter()
        .filter(|a| a.id != "style" && a.id != "dependencies")
        .collect()
}
