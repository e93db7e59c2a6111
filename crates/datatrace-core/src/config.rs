//! Configuration system for the DataTrace filter
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Policy loading, inline or from a YAML policy file

use crate::policy::parser::{parse_policy_file, validate_actions, ParseError};
use crate::policy::{OverrideMode, Policy, PolicyAction, PolicyEvaluator};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to load policy file: {0}")]
    PolicyError(#[from] ParseError),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete filter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Filter settings
    pub filter: FilterSettings,

    /// Expiry of orphaned traces
    pub expiry: ExpirySettings,

    /// Inline policy actions, in authority order
    pub policy: Vec<PolicyAction>,
}

/// Filter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// What to do with override tokens that do not parse
    pub malformed_overrides: OverrideMode,

    /// YAML policy file, used instead of inline `[[policy]]` actions
    pub policy_file: Option<PathBuf>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            malformed_overrides: OverrideMode::Ignore,
            policy_file: None,
        }
    }
}

/// Expiry settings for traces whose parent response never arrives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirySettings {
    /// Enable the expiry sweeper
    pub enabled: bool,

    /// Age after which an open trace is evicted (seconds)
    pub max_age_secs: u64,

    /// Interval between sweeps (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for ExpirySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

impl ExpirySettings {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl FilterConfig {
    /// Resolve the effective policy: the policy file if set, otherwise the
    /// inline actions
    pub fn load_policy(&self) -> ConfigResult<Policy> {
        match &self.filter.policy_file {
            Some(path) => {
                let file = parse_policy_file(path)?;
                info!(
                    path = %path.display(),
                    count = file.actions.len(),
                    "Loaded policy file"
                );
                Ok(file.into_policy())
            }
            None => {
                validate_actions(&self.policy)?;
                Ok(Policy::new(self.policy.clone()))
            }
        }
    }

    /// Build the evaluator for this configuration
    pub fn evaluator(&self) -> ConfigResult<PolicyEvaluator> {
        Ok(PolicyEvaluator::new(self.load_policy()?)
            .with_override_mode(self.filter.malformed_overrides))
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. DATATRACE_CONFIG environment variable
    /// 3. ~/.config/datatrace/config.toml
    /// 4. /etc/datatrace/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<FilterConfig> {
        let config_path = self.find_config_file()?;

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            FilterConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    ///
    /// An explicit CLI path that does not exist is an error; discovered
    /// locations are optional.
    fn find_config_file(&self) -> ConfigResult<Option<PathBuf>> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::NotFound(path.clone()));
        }

        if let Ok(env_path) = std::env::var("DATATRACE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(Some(path));
            }
            warn!("DATATRACE_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Ok(Some(path));
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/datatrace/config.toml");
            if path.exists() {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<FilterConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: FilterConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut FilterConfig) {
        if let Ok(val) = std::env::var("DATATRACE_LOG_LEVEL") {
            config.filter.log_level = val;
        }
        if let Ok(val) = std::env::var("DATATRACE_MALFORMED_OVERRIDES") {
            match val.to_lowercase().as_str() {
                "ignore" => config.filter.malformed_overrides = OverrideMode::Ignore,
                "reject" => config.filter.malformed_overrides = OverrideMode::Reject,
                _ => warn!("Ignoring invalid DATATRACE_MALFORMED_OVERRIDES: {}", val),
            }
        }
        if let Ok(val) = std::env::var("DATATRACE_EXPIRY_ENABLED") {
            config.expiry.enabled = val.parse().unwrap_or(config.expiry.enabled);
        }
        if let Ok(val) = std::env::var("DATATRACE_EXPIRY_MAX_AGE_SECS") {
            if let Ok(secs) = val.parse() {
                config.expiry.max_age_secs = secs;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &FilterConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.filter.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.filter.log_level, valid_levels
            )));
        }

        if config.filter.policy_file.is_some() && !config.policy.is_empty() {
            return Err(ConfigError::ValidationError(
                "policy_file and inline [[policy]] actions are mutually exclusive".to_string(),
            ));
        }

        validate_actions(&config.policy)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if config.expiry.enabled {
            if config.expiry.max_age_secs == 0 {
                return Err(ConfigError::ValidationError(
                    "expiry.max_age_secs cannot be 0".to_string(),
                ));
            }
            if config.expiry.sweep_interval_secs == 0 {
                return Err(ConfigError::ValidationError(
                    "expiry.sweep_interval_secs cannot be 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("datatrace").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Example configuration, used by `datatrace example-config`
pub fn example_config() -> FilterConfig {
    FilterConfig {
        policy: crate::policy::parser::example_policy().actions().to_vec(),
        ..Default::default()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(target_os = "windows"))]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
