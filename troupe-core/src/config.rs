//! Configuration system for Troupe.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> environment -> explicit overrides. Configuration is
//! loaded from `~/.config/troupe/config.toml` and/or `.troupe/config.toml`
//! in the workspace directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::team::TeamConfig;

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TroupeConfig {
    /// Defaults applied to teams that do not carry their own config.
    pub teams: TeamConfig,
    /// Collaboration engine knobs.
    pub engine: EngineConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Configuration for the collaboration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the bounded event channel.
    pub event_buffer: usize,
    /// Grace period granted to in-flight work on cancellation, in milliseconds.
    pub cancel_grace_ms: u64,
    /// Session timeout applied when a request does not set one, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_session_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            cancel_grace_ms: 1_000,
            default_session_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn default_session_timeout(&self) -> Option<Duration> {
        self.default_session_timeout_secs.map(Duration::from_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Load configuration with the following precedence (highest wins):
///
/// 1. Explicit overrides (e.g. from CLI args)
/// 2. Environment variables (prefixed with `TROUPE_`)
/// 3. Workspace-local config (`.troupe/config.toml`)
/// 4. User config (`~/.config/troupe/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&TroupeConfig>,
) -> std::result::Result<TroupeConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TroupeConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "troupe", "troupe") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".troupe").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (TROUPE_TEAMS__MAX_CONCURRENCY, TROUPE_LOGGING__LEVEL, etc.)
    figment = figment.merge(Env::prefixed("TROUPE_").split("__"));

    // Explicit overrides
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check whether any Troupe configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "troupe", "troupe") {
        if config_dir.config_dir().join("config.toml").exists() {
            return true;
        }
    }
    if let Some(ws) = workspace {
        if ws.join(".troupe").join("config.toml").exists() {
            return true;
        }
    }
    false
}

/// Write the config to `<workspace>/.troupe/config.toml`, creating the
/// directory if needed. Returns the path written.
pub fn save_config(workspace: &Path, config: &TroupeConfig) -> Result<PathBuf> {
    let config_dir = workspace.join(".troupe");
    std::fs::create_dir_all(&config_dir)?;
    let config_path = config_dir.join("config.toml");

    let toml_str = toml::to_string_pretty(config).map_err(|e| ConfigError::Invalid {
        message: e.to_string(),
    })?;
    std::fs::write(&config_path, toml_str)?;
    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TroupeConfig::default();
        assert_eq!(config.teams.max_concurrency, 4);
        assert_eq!(config.teams.task_timeout_secs, 300);
        assert_eq!(config.engine.event_buffer, 256);
        assert_eq!(config.engine.cancel_grace_ms, 1_000);
        assert!(config.engine.default_session_timeout_secs.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = TroupeConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: TroupeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(
            deserialized.teams.max_concurrency,
            config.teams.max_concurrency
        );
        assert_eq!(deserialized.engine.event_buffer, config.engine.event_buffer);
        assert_eq!(deserialized.logging.level, config.logging.level);
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.teams.max_concurrency, 4);
        assert_eq!(config.engine.cancel_grace_ms, 1_000);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = TroupeConfig::default();
        overrides.teams.max_concurrency = 9;
        overrides.logging.level = "debug".to_string();
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.teams.max_concurrency, 9);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let troupe_dir = dir.path().join(".troupe");
        std::fs::create_dir_all(&troupe_dir).unwrap();
        std::fs::write(
            troupe_dir.join("config.toml"),
            r#"
[teams]
max_concurrency = 2
task_timeout_secs = 60

[teams.retry]
max_retries = 1
backoff_ms = 100
jitter = false

[engine]
event_buffer = 64
cancel_grace_ms = 250
default_session_timeout_secs = 120

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.teams.max_concurrency, 2);
        assert_eq!(config.teams.retry.max_retries, 1);
        assert_eq!(config.engine.event_buffer, 64);
        assert_eq!(
            config.engine.default_session_timeout(),
            Some(Duration::from_secs(120))
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_save_config_writes_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TroupeConfig::default();
        config.teams.max_concurrency = 7;

        let path = save_config(dir.path(), &config).unwrap();
        assert!(path.ends_with(".troupe/config.toml"));
        assert!(config_exists(Some(dir.path())));

        let loaded = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(loaded.teams.max_concurrency, 7);
    }
}
