//! Application configuration for Playbook.
//!
//! User config lives at `~/.playbook/playbook.toml`.
//! CLI flags override config file values, which override defaults.
//! Secrets are never stored here, only the names of the env vars holding them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlaybookError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "playbook.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".playbook";

// ---------------------------------------------------------------------------
// Config structs (matching playbook.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Text generation settings.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Task tracker settings.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Collaborator bridge process.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Relevance matching.
    #[serde(default)]
    pub matching: MatchingConfig,

    /// Enrichment pipeline tuning.
    #[serde(default)]
    pub enrichment: EnrichmentPolicyConfig,

    /// Chat session memory.
    #[serde(default)]
    pub conversation: ConversationConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path to the methodology document.
    #[serde(default = "default_methodology_path")]
    pub methodology_path: String,

    /// Path to the enrichment state database.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Name shown in generated guidance blocks.
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            methodology_path: default_methodology_path(),
            database_path: default_database_path(),
            assistant_name: default_assistant_name(),
        }
    }
}

fn default_methodology_path() -> String {
    "Path.txt".into()
}
fn default_database_path() -> String {
    "~/.playbook/playbook.db".into()
}
fn default_assistant_name() -> String {
    "AI Assistant".into()
}

/// `[generation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Model identifier passed through to the generator.
    #[serde(default = "default_model")]
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-call timeout enforced by the caller.
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_generation_timeout(),
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_model() -> String {
    "gpt-3.5-turbo".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_generation_timeout() -> u64 {
    60
}

/// `[tracker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Project whose tasks are enriched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// Name of the env var holding the tracker token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            token_env: default_token_env(),
        }
    }
}

fn default_token_env() -> String {
    "ASANA_TOKEN".into()
}

/// `[bridge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Runtime used to launch the bridge (e.g. "bun").
    #[serde(default = "default_bridge_cmd")]
    pub command: String,

    /// Script passed to `command run`.
    #[serde(default = "default_bridge_script")]
    pub script: String,

    /// Working directory for the bridge process.
    #[serde(default = "default_bridge_dir")]
    pub working_dir: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_cmd(),
            script: default_bridge_script(),
            working_dir: default_bridge_dir(),
        }
    }
}

fn default_bridge_cmd() -> String {
    "bun".into()
}
fn default_bridge_script() -> String {
    "bridge/index.ts".into()
}
fn default_bridge_dir() -> String {
    ".".into()
}

/// `[matching]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Upper bound on excerpt length handed to generation.
    #[serde(default = "default_max_excerpt_chars")]
    pub max_excerpt_chars: usize,

    /// Upper bound on overview text used when nothing matches.
    #[serde(default = "default_overview_max_chars")]
    pub overview_max_chars: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_excerpt_chars: default_max_excerpt_chars(),
            overview_max_chars: default_overview_max_chars(),
        }
    }
}

fn default_max_excerpt_chars() -> usize {
    1500
}
fn default_overview_max_chars() -> usize {
    3000
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentPolicyConfig {
    /// Wait before the single tracker-update retry.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Pause between generation calls to stay under rate limits.
    #[serde(default = "default_task_delay")]
    pub task_delay_ms: u64,

    /// How long a per-task lease is honored before it is considered abandoned.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl Default for EnrichmentPolicyConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: default_retry_backoff(),
            task_delay_ms: default_task_delay(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

fn default_retry_backoff() -> u64 {
    500
}
fn default_task_delay() -> u64 {
    1000
}
fn default_lease_ttl() -> u64 {
    600
}

/// `[conversation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Idle time after which a session forgets its context.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Maximum remembered turns per session.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            history_capacity: default_history_capacity(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    1800
}
fn default_history_capacity() -> usize {
    10
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.playbook/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PlaybookError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.playbook/playbook.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PlaybookError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PlaybookError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PlaybookError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PlaybookError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PlaybookError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| PlaybookError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Check that the generation API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.generation.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(PlaybookError::config(format!(
            "generation API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("methodology_path"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.matching.max_excerpt_chars, 1500);
        assert_eq!(parsed.conversation.history_capacity, 10);
        assert_eq!(parsed.generation.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[tracker]
project_id = "1201234567890"

[conversation]
idle_timeout_secs = 60
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.tracker.project_id.as_deref(), Some("1201234567890"));
        assert_eq!(config.tracker.token_env, "ASANA_TOKEN");
        assert_eq!(config.conversation.idle_timeout_secs, 60);
        assert_eq!(config.conversation.history_capacity, 10);
        assert_eq!(config.enrichment.retry_backoff_ms, 500);
    }

    #[test]
    fn expand_home_leaves_relative_paths() {
        assert_eq!(expand_home("Path.txt").unwrap(), PathBuf::from("Path.txt"));
        let expanded = expand_home("~/.playbook/playbook.db").unwrap();
        assert!(expanded.ends_with(".playbook/playbook.db"));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.generation.api_key_env = "PB_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
