use crate::errors::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// When an idle session is written back to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavePolicy {
    /// Save whenever the last concurrent request completes
    #[default]
    Always,
    /// Save immediately on every attribute put or remove
    OnChange,
    /// Save on completion only if attributes changed
    IfDirty,
    /// Never save automatically; only invalidation writes
    Never,
}

/// When a session is re-read from the store on first concurrent access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    #[default]
    Always,
    Never,
    /// Refresh once the last sync is older than `stale_window_secs`
    Window,
}

/// Identifies the application context sharing the session collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub virtual_hosts: Vec<String>,
    pub context_path: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            virtual_hosts: Vec::new(),
            context_path: "/".to_string(),
        }
    }
}

/// Per-session persistence policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub save_policy: SavePolicy,
    pub stale_policy: StalePolicy,
    pub stale_window_secs: u64,
    /// Rewrite every attribute on save instead of only the dirty ones
    pub save_all_attributes: bool,
    /// Suffix appended to cluster ids to form node-local ids
    pub worker_name: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            save_policy: SavePolicy::Always,
            stale_policy: StalePolicy::Always,
            stale_window_secs: 30,
            save_all_attributes: false,
            worker_name: None,
        }
    }
}

impl SessionSettings {
    pub fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScavengerConfig {
    pub enabled: bool,
    /// Initial delay, and the age past which a locally known session is stale
    pub delay_secs: u64,
    pub period_secs: u64,
}

impl Default for ScavengerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: 30 * 60,
            period_secs: 10 * 60,
        }
    }
}

impl ScavengerConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgerConfig {
    /// Only one node in a cluster needs the purger enabled
    pub enabled: bool,
    pub delay_secs: u64,
    /// `None` runs a single purge after the delay
    pub period_secs: Option<u64>,
    pub minimal_purge_age_secs: u64,
}

impl Default for PurgerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_secs: 60 * 60,
            period_secs: None,
            minimal_purge_age_secs: 24 * 60 * 60,
        }
    }
}

impl PurgerConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn period(&self) -> Option<Duration> {
        self.period_secs.map(Duration::from_secs)
    }

    pub fn minimal_purge_age(&self) -> Duration {
        Duration::from_secs(self.minimal_purge_age_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Configuration for one session-store node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub context: ContextConfig,
    pub session: SessionSettings,
    pub scavenger: ScavengerConfig,
    pub purger: PurgerConfig,
    pub logging: LoggingConfig,
}

impl SessionConfig {
    /// Loads configuration from a file if it exists, otherwise returns the default config
    pub fn load_from_file(path: &Path) -> SessionResult<Self> {
        if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                SessionError::Config(format!("Failed to read config file: {}", e))
            })?;

            let config: Self = toml::from_str(&content).map_err(|e| {
                SessionError::Config(format!("Failed to parse config file: {}", e))
            })?;

            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Saves configuration to a file
    pub fn save_to_file(&self, path: &Path) -> SessionResult<()> {
        let content = toml::to_string(self).map_err(|e| {
            SessionError::Config(format!("Failed to serialize config: {}", e))
        })?;

        // Ensure the directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SessionError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        fs::write(path, content).map_err(|e| {
            SessionError::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Rejects settings the timers and policies cannot run with.
    pub fn validate(&self) -> SessionResult<()> {
        let path = &self.context.context_path;
        if !path.is_empty() && !path.starts_with('/') {
            return Err(SessionError::Config(format!(
                "context_path must start with '/': {}",
                path
            )));
        }
        if self.scavenger.enabled && self.scavenger.period_secs == 0 {
            return Err(SessionError::Config(
                "scavenger.period_secs must be greater than zero".to_string(),
            ));
        }
        if self.purger.period_secs == Some(0) {
            return Err(SessionError::Config(
                "purger.period_secs must be greater than zero when set".to_string(),
            ));
        }
        if self.session.stale_policy == StalePolicy::Window && self.session.stale_window_secs == 0 {
            return Err(SessionError::Config(
                "session.stale_window_secs must be greater than zero for the window policy"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Helper function to get default config directory
pub fn get_default_config_dir(app_name: &str) -> SessionResult<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        SessionError::Config("Could not determine config directory".to_string())
    })?;

    Ok(config_dir.join(app_name))
}

/// Helper function to get default config file path
pub fn get_default_config_file(app_name: &str) -> SessionResult<PathBuf> {
    let config_dir = get_default_config_dir(app_name)?;
    Ok(config_dir.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.session.save_policy, SavePolicy::Always);
        assert_eq!(config.scavenger.delay(), Duration::from_secs(1800));
        assert_eq!(config.purger.period(), None);
        assert_eq!(config.purger.minimal_purge_age(), Duration::from_secs(86400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            [session]
            save_policy = "if_dirty"
            stale_policy = "window"
            stale_window_secs = 5

            [purger]
            enabled = true
            period_secs = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.session.save_policy, SavePolicy::IfDirty);
        assert_eq!(config.session.stale_window(), Duration::from_secs(5));
        assert_eq!(config.purger.period(), Some(Duration::from_secs(600)));
        assert_eq!(config.purger.delay_secs, 3600);
        assert_eq!(config.context.context_path, "/");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SessionConfig::default();
        config.context.context_path = "app".to_string();
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));

        let mut config = SessionConfig::default();
        config.purger.period_secs = Some(0);
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.session.stale_policy = StalePolicy::Window;
        config.session.stale_window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("nosql-session-config-{}", std::process::id()));
        let path = dir.join("config.toml");

        let mut config = SessionConfig::default();
        config.context.virtual_hosts = vec!["example.com".to_string()];
        config.session.worker_name = Some("node1".to_string());
        config.save_to_file(&path).unwrap();

        let loaded = SessionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_gives_default() {
        let loaded = SessionConfig::load_from_file(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(loaded, SessionConfig::default());
    }
}
