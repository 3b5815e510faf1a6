//! Pull request creation for finished fixes, shelling out to the `gh` CLI
//! the same way the scan/fix pipeline shells out to `git`.

use std::process::Command;
use std::thread;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

fn retry_with_backoff<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut backoff = INITIAL_BACKOFF_MS;
    let mut last_err = None;
    for attempt in 1..=MAX_RETRIES {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt < MAX_RETRIES {
                    thread::sleep(Duration::from_millis(backoff));
                    backoff *= 2;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

/// Abstraction over `gh` CLI execution, so the submission flow can be
/// exercised in tests without a real GitHub remote.
pub trait GhClient {
    fn run(&self, args: &[&str]) -> Result<String>;
}

struct DefaultGhClient;

impl GhClient for DefaultGhClient {
    fn run(&self, args: &[&str]) -> Result<String> {
        let args = args.to_vec();
        retry_with_backoff(move || {
            let output = Command::new("gh")
                .args(&args)
                .output()
                .map_err(|e| Error::Submission(format!("failed to run gh: {e}")))?;

            if output.status.success() {
                String::from_utf8(output.stdout)
                    .map_err(|e| Error::Submission(format!("invalid utf8 from gh: {e}")))
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(Error::Submission(format!("gh failed: {stderr}")))
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct GhPrView {
    url: String,
    number: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitResult {
    pub pr_url: String,
    pub pr_number: u64,
}

pub struct Submitter {
    client: Box<dyn GhClient>,
}

impl Submitter {
    pub fn new() -> Self {
        Self {
            client: Box::new(DefaultGhClient),
        }
    }

    #[cfg(test)]
    fn with_client(client: Box<dyn GhClient>) -> Self {
        Self { client }
    }

    /// Push `branch` to origin and open a pull request against `base`.
    /// `draft` opens it as a draft PR.
    pub fn submit(
        &self,
        repo_root: &std::path::Path,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<SubmitResult> {
        push_branch(repo_root, branch)?;

        let mut args = vec![
            "pr", "create", "--base", base, "--head", branch, "--title", title, "--body", body,
        ];
        if draft {
            args.push("--draft");
        }
        let created_url = self.client.run(&args)?;
        let created_url = created_url.trim();

        let json = self.client.run(&[
            "pr", "view", created_url, "--json", "url,number",
        ])?;
        let parsed: GhPrView = serde_json::from_str(&json)
            .map_err(|e| Error::Submission(format!("failed to parse gh pr view output: {e}")))?;

        Ok(SubmitResult {
            pr_url: parsed.url,
            pr_number: parsed.number,
        })
    }
}

impl Default for Submitter {
    fn default() -> Self {
        Self::new()
    }
}

fn push_branch(repo_root: &std::path::Path, branch: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["push", "--set-upstream", "origin", branch])
        .current_dir(repo_root)
        .output()
        .map_err(|e| Error::Submission(format!("failed to run git push: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Submission(format!("git push failed: {stderr}")));
    }
    Ok(())
}
