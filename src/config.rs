use std::path::Path;

use serde::Deserialize;

use crate::cli::Cli;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub runner: Option<String>,
    pub base_branch: Option<String>,
    pub agent_binary: Option<String>,
    pub agent_model: Option<String>,
    pub agent_timeout: Option<u64>,
    /// Number of independent voter agents per candidate issue (V).
    pub voter_count: Option<u32>,
    /// Minimum votes in favor for a candidate to become a ticket (M).
    pub approval_threshold: Option<u32>,
    /// Jaccard/field-match threshold for consolidation clustering (K).
    pub dedup_threshold: Option<u32>,
    pub scan_concurrency: Option<usize>,
    pub fix_concurrency: Option<usize>,
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub runner: String,
    pub base_branch: String,
    pub agent_binary: String,
    pub agent_model: Option<String>,
    pub agent_timeout: Option<u64>,
    pub voter_count: u32,
    pub approval_threshold: u32,
    pub dedup_threshold: u32,
    pub scan_concurrency: usize,
    pub fix_concurrency: usize,
    pub max_iterations: u32,
    pub verbose: bool,
}

const DEFAULT_CONFIG_FILE: &str = ".rover/config.toml";

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_from(cli, Path::new("."))
    }

    pub fn load_from(cli: &Cli, project_dir: &Path) -> Result<Self> {
        let file_config = match &cli.config {
            Some(explicit_path) => {
                let path = Path::new(explicit_path);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                let content = std::fs::read_to_string(path)?;
                parse_config(&content)?
            }
            None => {
                let path = project_dir.join(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    let content = std::fs::read_to_string(&path)?;
                    parse_config(&content)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        merge(file_config, cli)
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    Ok(config)
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Result<Config> {
    let runner = cli
        .runner
        .clone()
        .or(file.runner)
        .unwrap_or_else(|| "claude".to_string());

    let default_binary = match runner.as_str() {
        "codex" => "codex",
        _ => "claude",
    };
    let default_model = match runner.as_str() {
        "codex" => Some("gpt-5.3-codex"),
        _ => None,
    };

    let config = Config {
        runner,
        base_branch: cli
            .base_branch
            .clone()
            .or(file.base_branch)
            .unwrap_or_else(|| "main".to_string()),
        agent_binary: cli
            .agent_binary
            .clone()
            .or(file.agent_binary)
            .unwrap_or_else(|| default_binary.to_string()),
        agent_model: cli
            .agent_model
            .clone()
            .or(file.agent_model)
            .or_else(|| default_model.map(str::to_string)),
        agent_timeout: cli.agent_timeout.or(file.agent_timeout).or(Some(600)),
        voter_count: file.voter_count.unwrap_or(3),
        approval_threshold: file.approval_threshold.unwrap_or(2),
        dedup_threshold: file.dedup_threshold.unwrap_or(5),
        scan_concurrency: file.scan_concurrency.unwrap_or(4),
        fix_concurrency: file.fix_concurrency.unwrap_or(2),
        max_iterations: file.max_iterations.unwrap_or(10),
        verbose: cli.verbose,
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.runner.as_str() {
        "claude" | "codex" => {}
        other => {
            return Err(Error::ConfigValidation(format!(
                "unknown runner: {other} (expected: claude, codex)"
            )));
        }
    }
    if config.voter_count == 0 {
        return Err(Error::ConfigValidation(
            "voter_count must be > 0".to_string(),
        ));
    }
    if config.approval_threshold == 0 || config.approval_threshold > config.voter_count {
        return Err(Error::ConfigValidation(format!(
            "approval_threshold must be between 1 and voter_count ({})",
            config.voter_count
        )));
    }
    if config.max_iterations == 0 {
        return Err(Error::ConfigValidation(
            "max_iterations must be > 0".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn cli_with(args: &[&str]) -> Cli {
        let mut full = vec!["rover"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
runner = "claude"
base_branch = "main"
voter_count = 5
approval_threshold = 3
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.runner.as_deref(), Some("claude"));
        assert_eq!(config.voter_count, Some(5));
    }

    #[test]
    fn test_parse_empty_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_parse_unknown_field_rejected() {
        let err = parse_config(r#"bogus = "value""#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_defaults_applied() {
        let file = ConfigFile::default();
        let cli = cli_with(&["scan"]);
        let config = merge(file, &cli).unwrap();
        assert_eq!(config.runner, "claude");
        assert_eq!(config.agent_binary, "claude");
        assert_eq!(config.agent_model, None);
        assert_eq!(config.agent_timeout, Some(600));
        assert_eq!(config.voter_count, 3);
        assert_eq!(config.approval_threshold, 2);
        assert_eq!(config.dedup_threshold, 5);
        assert_eq!(config.max_iterations, 10);
    }

    #[test]
    fn test_cli_overrides_config() {
        let file = ConfigFile {
            runner: Some("claude".to_string()),
            base_branch: Some("develop".to_string()),
            ..Default::default()
        };
        let cli = cli_with(&["--runner", "codex", "--base-branch", "main", "scan"]);
        let config = merge(file, &cli).unwrap();
        assert_eq!(config.runner, "codex"); // CLI wins
        assert_eq!(config.base_branch, "main"); // CLI wins
    }

    #[test]
    fn test_codex_runner_defaults_binary_and_model() {
        let cli = cli_with(&["--runner", "codex", "scan"]);
        let config = merge(ConfigFile::default(), &cli).unwrap();
        assert_eq!(config.agent_binary, "codex");
        assert_eq!(config.agent_model.as_deref(), Some("gpt-5.3-codex"));
    }

    #[test]
    fn test_invalid_runner_rejected() {
        let cli = cli_with(&["--runner", "bogus", "scan"]);
        let err = merge(ConfigFile::default(), &cli).unwrap_err();
        assert!(err.to_string().contains("unknown runner: bogus"));
    }

    #[test]
    fn test_zero_voter_count_rejected() {
        let file = ConfigFile {
            voter_count: Some(0),
            ..Default::default()
        };
        let cli = cli_with(&["scan"]);
        let err = merge(file, &cli).unwrap_err();
        assert!(err.to_string().contains("voter_count must be > 0"));
    }

    #[test]
    fn test_approval_threshold_exceeding_voter_count_rejected() {
        let file = ConfigFile {
            voter_count: Some(2),
            approval_threshold: Some(3),
            ..Default::default()
        };
        let cli = cli_with(&["scan"]);
        let err = merge(file, &cli).unwrap_err();
        assert!(err.to_string().contains("approval_threshold must be"));
    }

    #[test]
    fn test_zero_max_iterations_rejected() {
        let file = ConfigFile {
            max_iterations: Some(0),
            ..Default::default()
        };
        let cli = cli_with(&["scan"]);
        let err = merge(file, &cli).unwrap_err();
        assert!(err.to_string().contains("max_iterations must be > 0"));
    }

    #[test]
    fn test_load_missing_default_config_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = cli_with(&["scan"]);
        let config = Config::load_from(&cli, tmp.path()).unwrap();
        assert_eq!(config.runner, "claude");
        assert_eq!(config.voter_count, 3);
    }

    #[test]
    fn test_load_explicit_missing_config_errors() {
        let cli = cli_with(&["--config", "/nonexistent/config.toml", "scan"]);
        let err = Config::load(&cli).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn test_load_config_file_overrides_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg_dir = tmp.path().join(".rover");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(cfg_dir.join("config.toml"), "voter_count = 5\n").unwrap();
        let cli = cli_with(&["scan"]);
        let config = Config::load_from(&cli, tmp.path()).unwrap();
        assert_eq!(config.voter_count, 5);
    }
}
