//! The external LLM process driver. Rover treats the LLM's wire protocol as
//! an external collaborator (spec §1): this module only knows how to spawn
//! the CLI, stream its output, extract a resumable session id from the
//! stream, and hand back the accumulated text plus exit status.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::process::{ProcessConfig, spawn_and_stream};

/// Which stage of the pipeline is driving this call. Used only for log
/// prefixes and command construction (e.g. turn-limit flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scan,
    Vote,
    Consolidate,
    Plan,
    Fix,
    ReviewAspect,
    ReviewParse,
    DismissalVerify,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Scan => "scan",
            Phase::Vote => "vote",
            Phase::Consolidate => "consolidate",
            Phase::Plan => "plan",
            Phase::Fix => "fix",
            Phase::ReviewAspect => "review-aspect",
            Phase::ReviewParse => "review-parse",
            Phase::DismissalVerify => "dismissal-verify",
        };
        write!(f, "{s}")
    }
}

impl Phase {
    /// Maximum LLM turns per spec §5 ("Cancellation/timeout"): 50 for scan,
    /// 10 for vote, 20 for consolidate/plan. Fix/review phases are bounded
    /// by iteration count instead, not a turn cap.
    pub fn max_turns(&self) -> Option<u32> {
        match self {
            Phase::Scan => Some(50),
            Phase::Vote => Some(10),
            Phase::Consolidate | Phase::Plan => Some(20),
            Phase::Fix | Phase::ReviewAspect | Phase::ReviewParse | Phase::DismissalVerify => None,
        }
    }
}

/// Result of one agent invocation: accumulated text, exit code, and the
/// session id (if any) extracted from the streamed events, for resumption.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub session_id: Option<String>,
    pub cost_usd: f64,
}

pub trait AgentRunner {
    /// Run the agent for a given phase with a prompt in a working directory.
    /// `resume_session` resumes a prior session (iteration N+1 of a fix),
    /// when the underlying driver supports it.
    fn run(
        &self,
        phase: Phase,
        prompt: &str,
        working_dir: &Path,
        resume_session: Option<&str>,
    ) -> impl std::future::Future<Output = Result<RunResult>> + Send;
}

/// Scan each stdout line as a JSON object and return the first `session_id`
/// field found. Lines that aren't JSON, or don't carry the field, are
/// skipped — this never errors, matching the "tolerant parse" policy for
/// anything that isn't the final structured answer.
pub fn extract_session_id(stdout_lines: &[String]) -> Option<String> {
    for line in stdout_lines {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line)
            && let Some(Value::String(id)) = obj.get("session_id")
        {
            return Some(id.clone());
        }
    }
    None
}

/// Scan stdout lines for a `total_cost_usd` field on the final result event.
/// Missing on every line (e.g. a driver that doesn't report cost) yields 0.0
/// rather than an error — cost is informational, never load-bearing.
pub fn extract_cost_usd(stdout_lines: &[String]) -> f64 {
    for line in stdout_lines {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line)
            && let Some(cost) = obj.get("total_cost_usd").and_then(Value::as_f64)
        {
            return cost;
        }
    }
    0.0
}

/// Bare Claude runner — invokes the claude CLI directly.
#[derive(Clone)]
pub struct BareClaudeRunner {
    agent_binary: String,
    model: Option<String>,
    timeout: Option<Duration>,
}

impl BareClaudeRunner {
    pub fn new(agent_binary: String, model: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            agent_binary,
            model,
            timeout,
        }
    }

    /// Build the command and arguments for a given phase and prompt.
    pub fn build_command(
        &self,
        prompt: &str,
        phase: Phase,
        resume_session: Option<&str>,
    ) -> (String, Vec<String>) {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(turns) = phase.max_turns() {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }

        if let Some(session) = resume_session {
            args.push("--resume".to_string());
            args.push(session.to_string());
        }

        args.push("-p".to_string());
        args.push(prompt.to_string());

        (self.agent_binary.clone(), args)
    }
}

impl AgentRunner for BareClaudeRunner {
    async fn run(
        &self,
        phase: Phase,
        prompt: &str,
        working_dir: &Path,
        resume_session: Option<&str>,
    ) -> Result<RunResult> {
        let (command, args) = self.build_command(prompt, phase, resume_session);

        let config = ProcessConfig {
            command,
            args,
            working_dir: working_dir.to_path_buf(),
            timeout: self.timeout,
            log_prefix: format!("agent:{phase}"),
            env: vec![],
            stdin_data: None,
        };

        let output = spawn_and_stream(config).await?;

        if let Some(sig) = output.signal {
            return Err(Error::Transport(format!("agent killed by signal {sig}")));
        }

        let session_id = extract_session_id(&output.stdout_lines);
        let cost_usd = extract_cost_usd(&output.stdout_lines);
        let stdout = output.stdout_lines.join("\n");
        let stderr = output.stderr_lines.join("\n");

        Ok(RunResult {
            exit_code: output.exit_code,
            stdout,
            stderr,
            session_id,
            cost_usd,
        })
    }
}

/// Codex runner — invokes the OpenAI Codex CLI, prompt passed via stdin.
#[derive(Clone)]
pub struct CodexRunner {
    agent_binary: String,
    model: Option<String>,
    timeout: Option<Duration>,
}

impl CodexRunner {
    pub fn new(agent_binary: String, model: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            agent_binary,
            model,
            timeout,
        }
    }

    /// Build the command and arguments for codex invocation.
    pub fn build_command(&self) -> (String, Vec<String>) {
        let mut args = vec!["--quiet".to_string(), "--full-auto".to_string()];

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        (self.agent_binary.clone(), args)
    }
}

impl AgentRunner for CodexRunner {
    async fn run(
        &self,
        phase: Phase,
        prompt: &str,
        working_dir: &Path,
        _resume_session: Option<&str>,
    ) -> Result<RunResult> {
        let (command, args) = self.build_command();

        let config = ProcessConfig {
            command,
            args,
            working_dir: working_dir.to_path_buf(),
            timeout: self.timeout,
            log_prefix: format!("agent:{phase}"),
            env: vec![],
            stdin_data: Some(prompt.to_string()),
        };

        let output = spawn_and_stream(config).await?;

        if let Some(sig) = output.signal {
            return Err(Error::Transport(format!("agent killed by signal {sig}")));
        }

        let session_id = extract_session_id(&output.stdout_lines);
        let cost_usd = extract_cost_usd(&output.stdout_lines);
        let stdout = output.stdout_lines.join("\n");
        let stderr = output.stderr_lines.join("\n");

        Ok(RunResult {
            exit_code: output.exit_code,
            stdout,
            stderr,
            session_id,
            cost_usd,
        })
    }
}

/// Enum dispatching to either Claude or Codex runner, so orchestration code
/// can hold a single concrete type while still supporting both backends.
#[derive(Clone)]
pub enum AnyRunner {
    Claude(BareClaudeRunner),
    Codex(CodexRunner),
}

impl AgentRunner for AnyRunner {
    async fn run(
        &self,
        phase: Phase,
        prompt: &str,
        working_dir: &Path,
        resume_session: Option<&str>,
    ) -> Result<RunResult> {
        match self {
            AnyRunner::Claude(r) => r.run(phase, prompt, working_dir, resume_session).await,
            AnyRunner::Codex(r) => r.run(phase, prompt, working_dir, resume_session).await,
        }
    }
}

pub fn build_runner(
    runner_kind: &str,
    agent_binary: &str,
    model: Option<&str>,
    timeout: Option<Duration>,
) -> Result<AnyRunner> {
    match runner_kind {
        "claude" => Ok(AnyRunner::Claude(BareClaudeRunner::new(
            agent_binary.to_string(),
            model.map(str::to_string),
            timeout,
        ))),
        "codex" => Ok(AnyRunner::Codex(CodexRunner::new(
            agent_binary.to_string(),
            model.map(str::to_string),
            timeout,
        ))),
        other => Err(Error::ConfigValidation(format!(
            "unknown runner: {other} (expected: claude, codex)"
        ))),
    }
}
