use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

const DEFAULT_SCAN: &str = include_str!("default_prompts/scan.md");
const DEFAULT_VOTE: &str = include_str!("default_prompts/vote.md");
const DEFAULT_CONSOLIDATE: &str = include_str!("default_prompts/consolidate.md");
const DEFAULT_FIX: &str = include_str!("default_prompts/fix.md");
const DEFAULT_REVIEW_ASPECT: &str = include_str!("default_prompts/review-aspect.md");
const DEFAULT_REVIEW_PARSE: &str = include_str!("default_prompts/review-parse.md");
const DEFAULT_DISMISSAL_VERIFY: &str = include_str!("default_prompts/dismissal-verify.md");
const DEFAULT_PLAN: &str = include_str!("default_prompts/plan.md");
const FINDINGS_SCHEMA: &str = include_str!("default_prompts/_findings-schema.md");

/// Phase keys match `runner::Phase`'s `Display` output exactly, so callers
/// can render a prompt straight off `phase.to_string()`.
fn default_template(phase: &str) -> Option<&'static str> {
    match phase {
        "scan" => Some(DEFAULT_SCAN),
        "vote" => Some(DEFAULT_VOTE),
        "consolidate" => Some(DEFAULT_CONSOLIDATE),
        "fix" => Some(DEFAULT_FIX),
        "review-aspect" => Some(DEFAULT_REVIEW_ASPECT),
        "review-parse" => Some(DEFAULT_REVIEW_PARSE),
        "dismissal-verify" => Some(DEFAULT_DISMISSAL_VERIFY),
        "plan" => Some(DEFAULT_PLAN),
        _ => None,
    }
}

fn template_filename(phase: &str) -> String {
    format!("{phase}.md")
}

/// Prompt template engine with default templates and user overrides.
#[derive(Clone)]
pub struct PromptEngine {
    override_dir: Option<String>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<String>) -> Self {
        Self { override_dir }
    }

    /// Load a prompt template for the given phase.
    /// User overrides in `override_dir` take precedence over defaults.
    pub fn load_template(&self, phase: &str) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(template_filename(phase));
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                })?;
                return Ok(content);
            }
        }

        default_template(phase)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Prompt(format!("unknown prompt phase: {phase}")))
    }

    /// Load a template and render it with the given variables.
    ///
    /// Built-in variables like `findings_schema` are auto-injected when not
    /// already present in `vars`, so templates can reference them without
    /// callers having to supply them.
    pub fn render_phase(&self, phase: &str, vars: &HashMap<String, String>) -> Result<String> {
        let template = self.load_template(phase)?;
        let mut all_vars = vars.clone();
        all_vars
            .entry("findings_schema".to_string())
            .or_insert_with(|| FINDINGS_SCHEMA.to_string());
        render_template(&template, &all_vars)
    }
}

/// Render a template string using the `upon` template engine.
/// Supports `{{ var }}`, `{% if %}`, and `{% for %}` syntax.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(template)
        .map_err(|e| Error::Prompt(format!("template compile error: {e}")))?;
    compiled
        .render(
            &engine,
            upon::to_value(vars).map_err(|e| Error::Prompt(e.to_string()))?,
        )
        .to_string()
        .map_err(|e| Error::Prompt(format!("template render error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_default_scan() {
        let engine = PromptEngine::new(None);
        let template = engine.load_template("scan").unwrap();
        assert!(template.contains("{{repo_path}}"));
    }

    #[test]
    fn test_load_default_vote() {
        let engine = PromptEngine::new(None);
        let template = engine.load_template("vote").unwrap();
        assert!(template.contains("{{candidate_json}}"));
    }

    #[test]
    fn test_load_default_fix_contains_backwards_compat_clause() {
        let engine = PromptEngine::new(None);
        let template = engine.load_template("fix").unwrap();
        assert!(template.contains("do not defer for backwards compatibility"));
    }

    #[test]
    fn test_load_default_review_aspect() {
        let engine = PromptEngine::new(None);
        let template = engine.load_template("review-aspect").unwrap();
        assert!(template.contains("{{aspect_name}}"));
    }

    #[test]
    fn test_load_default_review_parse() {
        let engine = PromptEngine::new(None);
        let template = engine.load_template("review-parse").unwrap();
        assert!(template.contains("{{raw_review}}"));
    }

    #[test]
    fn test_load_default_dismissal_verify() {
        let engine = PromptEngine::new(None);
        let template = engine.load_template("dismissal-verify").unwrap();
        assert!(template.contains("must_fix"));
    }

    #[test]
    fn test_load_default_consolidate() {
        let engine = PromptEngine::new(None);
        let template = engine.load_template("consolidate").unwrap();
        assert!(template.contains("{{cluster_json}}"));
    }

    #[test]
    fn test_load_default_plan() {
        let engine = PromptEngine::new(None);
        let template = engine.load_template("plan").unwrap();
        assert!(template.contains("{{issues_json}}"));
    }

    #[test]
    fn test_load_unknown_phase() {
        let engine = PromptEngine::new(None);
        let err = engine.load_template("deploy").unwrap_err();
        assert!(err.to_string().contains("unknown prompt phase"));
    }

    #[test]
    fn test_override_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let override_path = dir.path().join("scan.md");
        fs::write(&override_path, "Custom scan template for {{repo_path}}").unwrap();

        let engine = PromptEngine::new(Some(dir.path().to_string_lossy().to_string()));
        let template = engine.load_template("scan").unwrap();
        assert_eq!(template, "Custom scan template for {{repo_path}}");
    }

    #[test]
    fn test_override_fallback_to_default() {
        let dir = TempDir::new().unwrap();
        let engine = PromptEngine::new(Some(dir.path().to_string_lossy().to_string()));
        let template = engine.load_template("vote").unwrap();
        assert!(template.contains("{{candidate_json}}"));
    }

    #[test]
    fn test_render_basic_substitution() {
        let mut vars = HashMap::new();
        vars.insert("issue_title".to_string(), "Fix bug".to_string());
        vars.insert("issue_number".to_string(), "42".to_string());

        let result =
            render_template("Title: {{issue_title}}, Number: {{issue_number}}", &vars).unwrap();
        assert_eq!(result, "Title: Fix bug, Number: 42");
    }

    #[test]
    fn test_render_unknown_variable_errors() {
        let vars = HashMap::new();
        let err = render_template("{{unknown_var}}", &vars).unwrap_err();
        assert!(err.to_string().contains("render error"));
    }

    #[test]
    fn test_render_unclosed_variable() {
        let vars = HashMap::new();
        let err = render_template("{{issue_title", &vars).unwrap_err();
        assert!(err.to_string().contains("compile error"));
    }

    #[test]
    fn test_render_if_conditional() {
        let mut vars = HashMap::new();
        vars.insert("pr_number".to_string(), "42".to_string());
        let template = "{% if pr_number %}PR #{{ pr_number }}{% endif %}";
        let result = render_template(template, &vars).unwrap();
        assert_eq!(result, "PR #42");
    }

    #[test]
    fn test_render_phase_end_to_end() {
        let engine = PromptEngine::new(None);
        let mut vars = HashMap::new();
        vars.insert("repo_path".to_string(), "/my/repo".to_string());

        let result = engine.render_phase("scan", &vars).unwrap();
        assert!(result.contains("/my/repo"));
        assert!(!result.contains("{{repo_path}}"));
    }

    #[test]
    fn test_render_phase_injects_findings_schema() {
        let engine = PromptEngine::new(None);
        let vars = HashMap::new();
        let result = engine.render_phase("scan", &vars).unwrap();
        // The default scan template references {{findings_schema}}, which
        // should be auto-filled even though the caller never set it.
        assert!(result.contains("\"severity\""));
    }

    #[test]
    fn test_prompt_override_validation_deferred_to_render() {
        let dir = TempDir::new().unwrap();
        let override_path = dir.path().join("scan.md");
        fs::write(&override_path, "Custom: {{bad_var}}").unwrap();

        let engine = PromptEngine::new(Some(dir.path().to_string_lossy().to_string()));
        let template = engine.load_template("scan").unwrap();
        assert_eq!(template, "Custom: {{bad_var}}");

        let vars = HashMap::new();
        let err = render_template(&template, &vars).unwrap_err();
        assert!(err.to_string().contains("render error"));
    }
}
