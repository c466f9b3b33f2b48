//! Unified configuration for autoforge.
//!
//! Reads `<state_root>/autoforge.toml`, applies environment overrides, and
//! leaves the last word to CLI flags. Every field has a default so an empty
//! file (or no file) is a valid configuration.
//!
//! ```toml
//! [orchestrator]
//! max_phase_attempts = 3
//! audit_concurrency = 3
//! commit_tag = "forge"
//!
//! [provider]
//! claude_cmd = "claude"
//! primary_model = "claude-sonnet-4-5"
//! economy_model = "claude-haiku-4-5"
//!
//! [governance]
//! blocking = ["G1", "G2", "G3"]
//!
//! [[governance.layers]]
//! name = "api"
//! path_prefixes = ["app/api/", "app/routers/"]
//! forbidden_imports = ["sqlalchemy", "psycopg2"]
//!
//! [verification]
//! test_command = "pytest -q"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "autoforge.toml";
pub const DEFAULT_STATE_DIR: &str = ".autoforge";

/// Orchestrator loop bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Phase-level audit/governance attempts before pausing for review
    #[serde(default = "default_max_phase_attempts")]
    pub max_phase_attempts: u32,
    /// Simultaneous per-file audit calls
    #[serde(default = "default_audit_concurrency")]
    pub audit_concurrency: usize,
    /// First-tier fix rounds per file
    #[serde(default = "default_fixer_rounds")]
    pub fixer_rounds: u32,
    /// Verification (syntax + tests) rounds per phase
    #[serde(default = "default_verification_rounds")]
    pub verification_rounds: u32,
    /// Prefix of the phase commit message, `"<tag>: Phase <N> complete"`
    #[serde(default = "default_commit_tag")]
    pub commit_tag: String,
    /// Open a plan-review gate before the first phase
    #[serde(default)]
    pub plan_review: bool,
    /// Treat audit-clean phases with residual verification issues as passed
    #[serde(default = "default_true")]
    pub accept_partial_pass: bool,
    /// Re-spawn interrupted builds on startup instead of failing them
    #[serde(default)]
    pub auto_resume: bool,
}

fn default_max_phase_attempts() -> u32 {
    3
}

fn default_audit_concurrency() -> usize {
    3
}

fn default_fixer_rounds() -> u32 {
    2
}

fn default_verification_rounds() -> u32 {
    3
}

fn default_commit_tag() -> String {
    "forge".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_phase_attempts: default_max_phase_attempts(),
            audit_concurrency: default_audit_concurrency(),
            fixer_rounds: default_fixer_rounds(),
            verification_rounds: default_verification_rounds(),
            commit_tag: default_commit_tag(),
            plan_review: false,
            accept_partial_pass: true,
            auto_resume: false,
        }
    }
}

/// Prompt and output budgeting for per-file generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_min_output_tokens")]
    pub min_output_tokens: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Output tokens allotted per estimated line of the target file
    #[serde(default = "default_tokens_per_line")]
    pub tokens_per_line: u32,
    /// Input token budget for a single file prompt
    #[serde(default = "default_input_token_budget")]
    pub input_token_budget: usize,
    /// Characters per token used for budget estimates
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    /// Budget given to the on-disk project snapshot in recovery prompts
    #[serde(default = "default_snapshot_token_budget")]
    pub snapshot_token_budget: usize,
}

fn default_min_output_tokens() -> u32 {
    4096
}

fn default_max_output_tokens() -> u32 {
    16384
}

fn default_tokens_per_line() -> u32 {
    12
}

fn default_input_token_budget() -> usize {
    48_000
}

fn default_chars_per_token() -> usize {
    4
}

fn default_snapshot_token_budget() -> usize {
    24_000
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            min_output_tokens: default_min_output_tokens(),
            max_output_tokens: default_max_output_tokens(),
            tokens_per_line: default_tokens_per_line(),
            input_token_budget: default_input_token_budget(),
            chars_per_token: default_chars_per_token(),
            snapshot_token_budget: default_snapshot_token_budget(),
        }
    }
}

/// Price of one model, USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Generation provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_claude_cmd")]
    pub claude_cmd: String,
    /// Model used for generation, planning and second-tier fixes
    #[serde(default = "default_primary_model")]
    pub primary_model: String,
    /// Cheaper model used for audits and first-tier fixes
    #[serde(default = "default_economy_model")]
    pub economy_model: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// API keys pooled across requests. Empty means "use the ambient login".
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Sliding window length for per-key usage tracking
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Tokens one key may consume inside the window before the pool waits
    #[serde(default = "default_tokens_per_window")]
    pub tokens_per_window: u64,
    #[serde(default)]
    pub pricing: HashMap<String, ModelPrice>,
}

fn default_claude_cmd() -> String {
    "claude".to_string()
}

fn default_primary_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_economy_model() -> String {
    "claude-haiku-4-5".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_window_secs() -> u64 {
    60
}

fn default_tokens_per_window() -> u64 {
    400_000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            claude_cmd: default_claude_cmd(),
            primary_model: default_primary_model(),
            economy_model: default_economy_model(),
            request_timeout_secs: default_request_timeout_secs(),
            api_keys: Vec::new(),
            window_secs: default_window_secs(),
            tokens_per_window: default_tokens_per_window(),
            pricing: HashMap::new(),
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Price for a model; unknown models fall back to the family defaults.
    pub fn price_for(&self, model: &str) -> ModelPrice {
        if let Some(price) = self.pricing.get(model) {
            return *price;
        }
        let lower = model.to_lowercase();
        if lower.contains("haiku") {
            ModelPrice {
                input_per_mtok: 1.0,
                output_per_mtok: 5.0,
            }
        } else if lower.contains("opus") {
            ModelPrice {
                input_per_mtok: 15.0,
                output_per_mtok: 75.0,
            }
        } else {
            ModelPrice {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            }
        }
    }
}

/// Exponential backoff for transient provider and infrastructure errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Stall detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_warn_after_secs")]
    pub warn_after_secs: u64,
    #[serde(default = "default_fail_after_secs")]
    pub fail_after_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_warn_after_secs() -> u64 {
    300
}

fn default_fail_after_secs() -> u64 {
    900
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            warn_after_secs: default_warn_after_secs(),
            fail_after_secs: default_fail_after_secs(),
        }
    }
}

/// Forbidden imports for files under an architectural layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerRule {
    pub name: String,
    pub path_prefixes: Vec<String>,
    pub forbidden_imports: Vec<String>,
}

/// Governance policy. Which checks block is configuration, not code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Check codes whose FAIL blocks the phase
    #[serde(default = "default_blocking")]
    pub blocking: Vec<String>,
    /// Check codes whose WARN also blocks the phase
    #[serde(default)]
    pub warn_blocks: Vec<String>,
    #[serde(default = "default_layers")]
    pub layers: Vec<LayerRule>,
    /// Extra import-name → package-name spellings
    #[serde(default)]
    pub package_aliases: HashMap<String, String>,
}

fn default_blocking() -> Vec<String> {
    vec!["G1".to_string(), "G2".to_string(), "G3".to_string()]
}

fn default_layers() -> Vec<LayerRule> {
    vec![
        LayerRule {
            name: "api".to_string(),
            path_prefixes: vec![
                "app/api/".to_string(),
                "app/routers/".to_string(),
                "src/routes/".to_string(),
            ],
            forbidden_imports: vec![
                "sqlalchemy".to_string(),
                "psycopg2".to_string(),
                "asyncpg".to_string(),
                "pg".to_string(),
            ],
        },
        LayerRule {
            name: "repository".to_string(),
            path_prefixes: vec![
                "app/repositories/".to_string(),
                "app/repos/".to_string(),
                "src/repositories/".to_string(),
            ],
            forbidden_imports: vec![
                "fastapi".to_string(),
                "flask".to_string(),
                "express".to_string(),
                "starlette".to_string(),
            ],
        },
    ]
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            blocking: default_blocking(),
            warn_blocks: Vec::new(),
            layers: default_layers(),
            package_aliases: HashMap::new(),
        }
    }
}

/// Post-generation verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Shell command run from the workspace root; exit 0 means pass
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_test_timeout_secs() -> u64 {
    300
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            test_command: None,
            timeout_secs: default_test_timeout_secs(),
        }
    }
}

/// Workspace preparation and remote sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory that receives per-build clones and fresh repositories
    #[serde(default = "default_builds_root")]
    pub builds_root: PathBuf,
    #[serde(default = "default_push_max_retries")]
    pub push_max_retries: u32,
    #[serde(default = "default_push_backoff_ms")]
    pub push_backoff_ms: u64,
    /// Push after every committed phase when the target has a remote
    #[serde(default = "default_true")]
    pub push_each_phase: bool,
}

fn default_builds_root() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR).join("workspaces")
}

fn default_push_max_retries() -> u32 {
    2
}

fn default_push_backoff_ms() -> u64 {
    2_000
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            builds_root: default_builds_root(),
            push_max_retries: default_push_max_retries(),
            push_backoff_ms: default_push_backoff_ms(),
            push_each_phase: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for a daily rolling log file; console only when unset
    #[serde(default)]
    pub file_dir: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
            file_dir: None,
        }
    }
}

/// The complete autoforge.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoforgeConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AutoforgeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse autoforge.toml")
    }

    /// Load `<state_dir>/autoforge.toml`, or defaults when it does not exist,
    /// then apply environment overrides.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize autoforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `AUTOFORGE_*` overrides. The lookup is injected so tests do not
    /// have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cmd) = lookup("AUTOFORGE_CLAUDE_CMD").or_else(|| lookup("CLAUDE_CMD")) {
            self.provider.claude_cmd = cmd;
        }
        if let Some(model) = lookup("AUTOFORGE_PRIMARY_MODEL") {
            self.provider.primary_model = model;
        }
        if let Some(model) = lookup("AUTOFORGE_ECONOMY_MODEL") {
            self.provider.economy_model = model;
        }
        if let Some(keys) = lookup("AUTOFORGE_API_KEYS") {
            self.provider.api_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(format) = lookup("AUTOFORGE_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        Ok(())
    }

    /// Human-readable problems with the configuration. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.orchestrator.max_phase_attempts == 0 {
            problems.push("orchestrator.max_phase_attempts must be at least 1".to_string());
        }
        if self.orchestrator.audit_concurrency == 0 {
            problems.push("orchestrator.audit_concurrency must be at least 1".to_string());
        }
        if self.generation.min_output_tokens > self.generation.max_output_tokens {
            problems.push(format!(
                "generation.min_output_tokens ({}) exceeds max_output_tokens ({})",
                self.generation.min_output_tokens, self.generation.max_output_tokens
            ));
        }
        if self.watchdog.warn_after_secs >= self.watchdog.fail_after_secs {
            problems.push(format!(
                "watchdog.warn_after_secs ({}) must be below fail_after_secs ({})",
                self.watchdog.warn_after_secs, self.watchdog.fail_after_secs
            ));
        }
        for code in self
            .governance
            .blocking
            .iter()
            .chain(self.governance.warn_blocks.iter())
        {
            if !crate::governance::CHECK_CODES.contains(&code.as_str()) {
                problems.push(format!("governance: unknown check code '{}'", code));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = AutoforgeConfig::parse("").unwrap();
        assert_eq!(config.orchestrator.max_phase_attempts, 3);
        assert_eq!(config.orchestrator.audit_concurrency, 3);
        assert_eq!(config.orchestrator.fixer_rounds, 2);
        assert_eq!(config.orchestrator.verification_rounds, 3);
        assert_eq!(config.generation.min_output_tokens, 4096);
        assert_eq!(config.generation.max_output_tokens, 16384);
        assert_eq!(config.workspace.push_max_retries, 2);
        assert_eq!(config.governance.blocking, vec!["G1", "G2", "G3"]);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_overrides_and_layers() {
        let config = AutoforgeConfig::parse(
            r#"
            [orchestrator]
            max_phase_attempts = 5
            commit_tag = "build"

            [governance]
            blocking = ["G1"]
            warn_blocks = ["G4"]

            [[governance.layers]]
            name = "ui"
            path_prefixes = ["web/"]
            forbidden_imports = ["fs"]
            "#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.max_phase_attempts, 5);
        assert_eq!(config.orchestrator.commit_tag, "build");
        assert_eq!(config.governance.blocking, vec!["G1"]);
        assert_eq!(config.governance.warn_blocks, vec!["G4"]);
        assert_eq!(config.governance.layers.len(), 1);
        assert_eq!(config.governance.layers[0].name, "ui");
    }

    #[test]
    fn test_env_overrides_without_touching_process_env() {
        let mut config = AutoforgeConfig::default();
        config
            .apply_env(|key| match key {
                "AUTOFORGE_PRIMARY_MODEL" => Some("big-model".to_string()),
                "AUTOFORGE_API_KEYS" => Some("k1, k2,,k3".to_string()),
                "AUTOFORGE_LOG_FORMAT" => Some("json".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.provider.primary_model, "big-model");
        assert_eq!(config.provider.api_keys, vec!["k1", "k2", "k3"]);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_log_format_env_is_an_error() {
        let mut config = AutoforgeConfig::default();
        let result = config.apply_env(|key| {
            (key == "AUTOFORGE_LOG_FORMAT").then(|| "xml".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = AutoforgeConfig::default();
        config.orchestrator.audit_concurrency = 0;
        config.watchdog.warn_after_secs = 1000;
        config.governance.blocking.push("G9".to_string());
        let problems = config.validate();
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().any(|p| p.contains("G9")));
    }

    #[test]
    fn test_price_lookup_falls_back_by_family() {
        let config = ProviderConfig::default();
        assert_eq!(config.price_for("claude-haiku-4-5").input_per_mtok, 1.0);
        assert_eq!(config.price_for("claude-sonnet-4-5").output_per_mtok, 15.0);
        assert_eq!(config.price_for("claude-opus-4").input_per_mtok, 15.0);
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let dir = tempdir().unwrap();
        let mut config = AutoforgeConfig::default();
        config.verification.test_command = Some("pytest -q".to_string());
        let path = dir.path().join(CONFIG_FILE_NAME);
        config.save(&path).unwrap();

        let loaded = AutoforgeConfig::load(&path).unwrap();
        assert_eq!(loaded.verification.test_command.as_deref(), Some("pytest -q"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = AutoforgeConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.orchestrator.commit_tag, "forge");
    }
}
