use clap::{Parser, Subcommand};

/// rover — an AI-agent code quality scanner, fixer, and reviewer
#[derive(Parser, Debug)]
#[command(name = "rover", version, about)]
pub struct Cli {
    /// Path to config file
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Print verbose agent output while running
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Agent runner to use (claude, codex)
    #[arg(long, global = true)]
    pub runner: Option<String>,

    /// Agent binary to invoke (default depends on runner)
    #[arg(long, global = true)]
    pub agent_binary: Option<String>,

    /// Model for the agent to use
    #[arg(long, global = true)]
    pub agent_model: Option<String>,

    /// Agent timeout in seconds
    #[arg(long, global = true)]
    pub agent_timeout: Option<u64>,

    /// Base branch to diff and branch from
    #[arg(long, global = true)]
    pub base_branch: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan the repository for issues, vote on candidates, write tickets
    Scan {
        /// Path to scan (default: repository root)
        path: Option<String>,

        /// Run every registered agent instead of just the default set
        #[arg(long)]
        all: bool,

        /// Restrict the scan to a single agent id
        #[arg(long)]
        agent: Option<String>,

        /// Number of files to scan concurrently
        #[arg(long)]
        concurrency: Option<usize>,

        /// Scan and vote, but do not write ticket files
        #[arg(long)]
        dry_run: bool,
    },

    /// Fix one or more approved issues, each in its own worktree
    Fix {
        /// Issue ids to fix (e.g. ISSUE-001)
        #[arg(required = true)]
        ids: Vec<String>,

        /// Number of issues to fix concurrently
        #[arg(long)]
        concurrency: Option<usize>,

        /// Maximum review/fix iterations per issue
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Manage fixes awaiting or past submission
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Manage scanned issue tickets
    Issues {
        #[command(subcommand)]
        action: Option<IssuesAction>,

        /// Filter by minimum severity when listing with no subcommand
        #[arg(long)]
        severity: Option<String>,

        /// List all severities, ignoring the default "must_fix + should_fix" filter
        #[arg(long)]
        all: bool,
    },

    /// Deduplicate and merge scanned issues across severity folders
    Consolidate {
        /// Path to consolidate (default: repository root)
        path: Option<String>,

        /// Compute clusters and print the plan without rewriting tickets
        #[arg(long)]
        dry_run: bool,

        /// Number of merge agents to run concurrently
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Compute a dependency-ordered execution plan for open issues
    Plan {
        /// Path to plan over (default: repository root)
        path: Option<String>,
    },

    /// List the built-in scan agent catalog
    Agents,

    /// Append a durable note to project memory
    Remember {
        /// Text to remember
        text: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ReviewAction {
    /// List fixes and their current status
    List,

    /// Push a fix branch and open a pull request
    Submit {
        /// Issue id to submit (omit with --all)
        id: Option<String>,

        /// Submit every fix that is ready
        #[arg(long)]
        all: bool,

        /// Open the pull request as a draft
        #[arg(long)]
        draft: bool,
    },

    /// Remove a fix's worktree without submitting it
    Clean {
        /// Issue id to clean (omit with --all)
        id: Option<String>,

        /// Clean every worktree that is safe to remove
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum IssuesAction {
    /// View full ticket content for one issue
    View {
        /// Issue id
        id: String,
    },

    /// Print an issue's ticket path to stdout, for piping to a clipboard
    Copy {
        /// Issue id
        id: String,
    },

    /// Permanently delete one or more issue tickets
    Remove {
        /// Issue ids to remove
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Mark one or more issues as won't-fix without deleting the ticket
    Ignore {
        /// Issue ids to ignore
        #[arg(required = true)]
        ids: Vec<String>,
    },
}
