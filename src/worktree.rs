use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Validate that a branch name is safe: matches `^[a-zA-Z0-9/_.-]+$` and does not start with `refs/`.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Worktree("branch name must not be empty".to_string()));
    }
    if name.starts_with("refs/") {
        return Err(Error::Worktree(format!(
            "branch name must not start with 'refs/': {name}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '/' || c == '_' || c == '.' || c == '-')
    {
        return Err(Error::Worktree(format!(
            "branch name contains invalid characters (allowed: a-zA-Z0-9/_.-): {name}"
        )));
    }
    Ok(())
}

/// Directory names skipped at any depth while copying env/MCP files into a
/// new worktree — directories that are either huge, not part of the source
/// tree, or Rover's own state.
const SKIP_ENTRIES: &[&str] = &["node_modules", ".git", "dist", ".rover"];

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

/// Manages git worktrees for isolated issue fixes.
pub struct WorktreeManager {
    repo_root: PathBuf,
    base_dir: PathBuf,
    base_branch: String,
}

impl WorktreeManager {
    pub fn new(repo_root: PathBuf, base_dir: PathBuf, base_branch: String) -> Self {
        Self {
            repo_root,
            base_dir,
            base_branch,
        }
    }

    /// Default worktree base directory relative to the repo root. Each
    /// worktree lives directly at `<repo_root>/.rover/<branchName>`, with the
    /// branch name (including any `/`) used verbatim as a nested path.
    pub fn default_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(".rover")
    }

    /// Pick an unused `fix/<issue_id>` branch name, trying numeric suffixes
    /// `-2` through `-100` on collision with an existing local branch.
    pub fn pick_branch_name(&self, issue_id: &str) -> Result<String> {
        let base = format!("fix/{issue_id}");
        if !self.branch_exists(&base) {
            return Ok(base);
        }
        for n in 2..=100 {
            let candidate = format!("{base}-{n}");
            if !self.branch_exists(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::BranchNameExhausted(issue_id.to_string()))
    }

    fn branch_exists(&self, branch: &str) -> bool {
        let local_ref = format!("refs/heads/{branch}");
        self.git(&["show-ref", "--verify", "--quiet", &local_ref])
            .is_ok()
    }

    /// Create a fresh worktree for an issue fix: a new `fix/<issue_id>`
    /// branch (or a numbered variant on collision) from `origin/<base>`,
    /// with `.env*` and `.mcp.json` files copied in from the source repo.
    pub fn create_for_issue(&self, issue_id: &str) -> Result<WorktreeInfo> {
        let branch = self.pick_branch_name(issue_id)?;
        validate_branch_name(&branch)?;

        std::fs::create_dir_all(&self.base_dir).map_err(|e| {
            Error::Worktree(format!(
                "failed to create base dir {}: {e}",
                self.base_dir.display()
            ))
        })?;

        self.fetch_with_retry(&self.base_branch, 3)?;
        let start_point = format!("origin/{}", self.base_branch);

        let path = self.base_dir.join(&branch);

        self.git_worktree_add(&path, &branch, true, Some(&start_point))?;

        let canonical_path = path.canonicalize().unwrap_or(path);

        copy_env_and_mcp_files(&self.repo_root, &canonical_path)?;

        info!(
            issue = issue_id,
            path = %canonical_path.display(),
            branch = %branch,
            "created worktree from origin/{}",
            self.base_branch
        );

        Ok(WorktreeInfo {
            path: canonical_path,
            branch,
        })
    }

    /// Remove a worktree and delete its branch.
    pub fn remove(&self, worktree_path: &Path) -> Result<()> {
        let worktree_path = &worktree_path
            .canonicalize()
            .unwrap_or(worktree_path.to_path_buf());

        let branch = self.branch_for_worktree(worktree_path);

        let _ = self.git(&["worktree", "prune"]);

        let path_str = worktree_path.to_string_lossy();
        self.git(&["worktree", "remove", "--force", &path_str])
            .map_err(|e| {
                Error::Worktree(format!(
                    "failed to remove worktree {}: {e}",
                    worktree_path.display()
                ))
            })?;

        info!(path = %worktree_path.display(), "removed worktree");

        if let Some(branch) = branch {
            if !branch.starts_with("fix/") {
                info!(
                    branch = %branch,
                    "skipping deletion for non-fix branch after worktree removal"
                );
                return Ok(());
            }
            match self.git(&["branch", "-D", &branch]) {
                Ok(_) => info!(branch = %branch, "deleted branch"),
                Err(e) => warn!(branch = %branch, error = %e, "failed to delete branch"),
            }
        }

        Ok(())
    }

    /// True if `worktree_path` still appears in `git worktree list` — used
    /// to decide whether a fix's worktree is still live before cleaning.
    pub fn exists(&self, worktree_path: &Path) -> bool {
        let canonical = worktree_path
            .canonicalize()
            .unwrap_or(worktree_path.to_path_buf());
        self.branch_for_worktree(&canonical).is_some()
            || self
                .git(&["worktree", "list", "--porcelain"])
                .map(|out| out.contains(&format!("worktree {}", canonical.display())))
                .unwrap_or(false)
    }

    /// Run `git worktree add`. If `new_branch` is true, uses `-b` to create the branch.
    fn git_worktree_add(
        &self,
        path: &Path,
        branch: &str,
        new_branch: bool,
        start_point: Option<&str>,
    ) -> Result<()> {
        let path_str = path.to_string_lossy();
        let mut args = vec!["worktree", "add"];
        if new_branch {
            args.extend_from_slice(&["-b", branch, &path_str]);
            if let Some(sp) = start_point {
                args.push(sp);
            }
        } else {
            args.extend_from_slice(&[&path_str, branch]);
        }

        self.git(&args).map_err(|e| {
            Error::Worktree(format!(
                "git worktree add failed for {}: {e}",
                path.display()
            ))
        })?;

        Ok(())
    }

    fn branch_for_worktree(&self, worktree_path: &Path) -> Option<String> {
        let output = self.git(&["worktree", "list", "--porcelain"]).ok()?;
        let target = worktree_path.to_string_lossy();

        let mut found = false;
        for line in output.lines() {
            if let Some(path_str) = line.strip_prefix("worktree ") {
                found = path_str == target.as_ref();
            } else if found && let Some(branch_ref) = line.strip_prefix("branch ") {
                return branch_ref
                    .strip_prefix("refs/heads/")
                    .map(|b| b.to_string());
            }
        }
        None
    }

    fn fetch_with_retry(&self, refspec: &str, max_attempts: u32) -> Result<()> {
        let mut last_err = String::new();
        for attempt in 1..=max_attempts {
            match self.git(&["fetch", "origin", refspec]) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e.trim(),
                        "git fetch origin {} failed",
                        refspec
                    );
                    last_err = e;
                    if attempt < max_attempts {
                        std::thread::sleep(std::time::Duration::from_secs(1));
                    }
                }
            }
        }
        Err(Error::Worktree(format!(
            "failed to fetch origin/{} after {max_attempts} attempts: {}",
            refspec,
            last_err.trim()
        )))
    }

    fn git(&self, args: &[&str]) -> std::result::Result<String, String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| format!("failed to run git: {e}"))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).to_string())
        }
    }
}

/// Recursively copy every `.env*` file (except `.env.example`) and every
/// `.mcp.json`, wherever they live under `source`, into the matching
/// relative path under `dest`. A fresh `git worktree add` checks out only
/// tracked files, so anything gitignored (local secrets, MCP server
/// config) has to be carried over by hand. `node_modules`, `.git`, `dist`,
/// and `.rover` are skipped at any depth.
fn copy_env_and_mcp_files(source: &Path, dest: &Path) -> Result<()> {
    if !source.exists() {
        return Ok(());
    }
    walk_and_copy(source, source, dest);
    Ok(())
}

fn walk_and_copy(root: &Path, dir: &Path, dest_root: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        let path = entry.path();

        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            if SKIP_ENTRIES.contains(&name_str.as_ref()) {
                continue;
            }
            walk_and_copy(root, &path, dest_root);
            continue;
        }

        let is_env = name_str.starts_with(".env") && name_str != ".env.example";
        let is_mcp = name_str == ".mcp.json";
        if !is_env && !is_mcp {
            continue;
        }

        let relative = path.strip_prefix(root).unwrap_or(&path);
        let dest_path = dest_root.join(relative);
        if let Some(parent) = dest_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                debug!(dir = %parent.display(), error = %e, "failed to create directory in worktree");
                continue;
            }
        }
        if let Err(e) = std::fs::copy(&path, &dest_path) {
            debug!(file = %relative.display(), error = %e, "failed to copy file into worktree");
        }
    }
}
