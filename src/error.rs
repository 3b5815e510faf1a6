use std::path::PathBuf;

/// Error taxonomy per the five policy classes: transport, parse, not-found,
/// corruption, fatal. Parse/Corruption variants are typically logged and
/// degraded at the call site rather than propagated; they still exist as
/// typed variants so callers that need to distinguish them (CLI exit-code
/// mapping, tests) can match on them instead of string-sniffing.
#[derive(Debug, thiserror::Error)]
#[allow(dead_code)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// LLM call or process spawn failed (network, timeout, non-zero exit).
    #[error("transport error: {0}")]
    Transport(String),

    /// LLM output could not be parsed into the expected schema.
    #[error("parse error in {context}: {source}")]
    Parse { context: String, source: String },

    #[error("unknown agent id: {0}")]
    AgentNotFound(String),

    #[error("ticket not found: {0}")]
    TicketNotFound(String),

    #[error("fix record not found: {0}")]
    FixRecordNotFound(String),

    /// A persisted JSON state file could not be parsed.
    #[error("corrupted state file at {path}: {detail}")]
    Corruption { path: PathBuf, detail: String },

    #[error("branch name exhausted after 100 attempts for issue {0}")]
    BranchNameExhausted(String),

    #[error("worktree error: {0}")]
    Worktree(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("submission error: {0}")]
    Submission(String),

    #[error("prompt error: {0}")]
    Prompt(String),
}

pub type Result<T> = std::result::Result<T, Error>;
