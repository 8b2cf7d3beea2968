use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tally_core::{MetricsConfig, MetricsError, MetricsResult};

const DEFAULT_CONFIG_NAME: &str = "tally.json";
const DEFAULT_DB_NAME: &str = "tally.sqlite";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Memory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TallyConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

impl TallyConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            metrics: Some(MetricsConfig::default()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            database: DatabaseConfig::Memory,
            metrics: None,
        }
    }

    /// Where a config without an explicit path keeps its database.
    pub fn default_sqlite_path(base_dir: &Path) -> PathBuf {
        base_dir.join(DEFAULT_DB_NAME)
    }

    /// Read `tally.json` from `base_dir`, writing a sqlite default first when
    /// the directory has none. A file that exists is never overwritten.
    pub fn load_or_init(base_dir: &Path) -> MetricsResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| MetricsError::storage(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| MetricsError::storage(format!("read config: {err}")))?;
            let config: TallyConfig = serde_json::from_str(&raw)
                .map_err(|err| MetricsError::invalid(err.to_string()))?;
            config.metrics_config().validate()?;
            return Ok(config);
        }
        let default = TallyConfig::default_sqlite(DEFAULT_DB_NAME);
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| MetricsError::storage(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| MetricsError::storage(format!("write config: {err}")))?;
        log::info!("wrote default config to {}", config_path.display());
        Ok(default)
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> MetricsResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DB_NAME.to_string());
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            DatabaseConfig::Memory => Err(MetricsError::invalid("config is not sqlite backend")),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Memory => "memory",
        }
    }

    /// Metrics settings, falling back to defaults when the file has none.
    pub fn metrics_config(&self) -> MetricsConfig {
        self.metrics.clone().unwrap_or_default()
    }
}
