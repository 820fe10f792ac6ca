use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use fle_schema::Inventory;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BUILTIN_SESSION_CONFIG: &str = include_str!("data/session_config.json");
pub const SESSION_CONFIG_ENV: &str = "FLE_SESSION_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub address: String,
    pub tcp_port: u16,
    pub rcon_password: String,
    /// Run the simulation in fast mode (`global.fast`).
    pub fast: bool,
    /// Starting inventory applied to every agent on reset.
    pub inventory: Inventory,
    pub cache_procedures: bool,
    pub all_technologies_researched: bool,
    pub clear_entities: bool,
    pub peaceful: bool,
    pub num_agents: usize,
    pub eval_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub cleanup_join_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    /// Directory to discover procedures from instead of the builtin set.
    pub procedures_path: Option<PathBuf>,
    pub profits: ProfitConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            tcp_port: 27000,
            rcon_password: "factorio".to_string(),
            fast: true,
            inventory: Inventory::new(),
            cache_procedures: true,
            all_technologies_researched: true,
            clear_entities: true,
            peaceful: true,
            num_agents: 1,
            eval_timeout_secs: 60,
            command_timeout_secs: 30,
            connect_timeout_secs: 10,
            cleanup_join_timeout_secs: 5,
            drain_timeout_secs: 5,
            procedures_path: None,
            profits: ProfitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfitConfig {
    /// Per-craft multiplier cap for static profit; values <= 0 disable the cap.
    pub max_static_unit_profit_cap: f64,
    pub dynamic_profit_multiplier: f64,
}

impl Default for ProfitConfig {
    fn default() -> Self {
        Self {
            max_static_unit_profit_cap: 5.0,
            dynamic_profit_multiplier: 10.0,
        }
    }
}

impl SessionConfig {
    pub fn builtin() -> Self {
        Self::from_json_str(BUILTIN_SESSION_CONFIG).unwrap_or_default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_agents == 0 {
            return Err(ConfigError::Invalid("num_agents must be at least 1".into()));
        }
        let timeouts = [
            ("eval_timeout_secs", self.eval_timeout_secs),
            ("command_timeout_secs", self.command_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("cleanup_join_timeout_secs", self.cleanup_join_timeout_secs),
            ("drain_timeout_secs", self.drain_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("address cannot be empty".into()));
        }
        Ok(())
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_secs(self.eval_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn cleanup_join_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_join_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse session config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read session config from {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid session config: {0}")]
    Invalid(String),
}

/// Load the session config from `FLE_SESSION_CONFIG_PATH`, falling back to the
/// builtin document when the variable is unset or the file is unusable.
pub fn load_session_config_from_env() -> (SessionConfig, Option<PathBuf>) {
    if let Some(path) = env::var(SESSION_CONFIG_ENV).ok().map(PathBuf::from) {
        match SessionConfig::from_file(&path) {
            Ok(config) => {
                tracing::info!(
                    target: "fle::config",
                    path = %path.display(),
                    "session_config.loaded=file"
                );
                return (config, Some(path));
            }
            Err(err) => {
                tracing::warn!(
                    target: "fle::config",
                    path = %path.display(),
                    error = %err,
                    "session_config.load_failed"
                );
            }
        }
    }

    tracing::info!(target: "fle::config", "session_config.loaded=builtin");
    (SessionConfig::builtin(), None)
}
