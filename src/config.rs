use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::TaskType;
use crate::orchestration::Cost;
use crate::{rlog_debug, Error, Result};

/// Engine configuration loaded from `~/.reconflow/reconflow.toml`.
///
/// Every field has a default, so a missing file or a partial file both
/// load cleanly.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    /// Per-type timeout overrides, keyed by task type name.
    pub timeouts: BTreeMap<TaskType, u64>,
    /// Per-type priority overrides, keyed by task type name.
    pub priorities: BTreeMap<TaskType, u8>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            timeouts: BTreeMap::new(),
            priorities: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn timeout_for(&self, task_type: TaskType) -> Duration {
        self.timeouts
            .get(&task_type)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| task_type.default_timeout())
    }

    pub fn priority_for(&self, task_type: TaskType) -> u8 {
        self.priorities
            .get(&task_type)
            .copied()
            .unwrap_or_else(|| task_type.default_priority())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    /// Spend ceiling in currency units.
    pub limit: f64,
    /// Item count above which a decision is routed to the deep tier.
    pub deep_item_threshold: usize,
    pub provider_timeout_secs: u64,
    pub max_decision_rounds: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit: 0.05,
            deep_item_threshold: 25,
            provider_timeout_secs: 30,
            max_decision_rounds: 2,
        }
    }
}

impl BudgetConfig {
    pub fn limit_cost(&self) -> Cost {
        Cost::from_units(self.limit)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub heartbeat_secs: u64,
    pub min_poll_ms: u64,
    pub max_poll_ms: u64,
    pub append_attempts: u32,
    pub append_backoff_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 15,
            min_poll_ms: 250,
            max_poll_ms: 5000,
            append_attempts: 3,
            append_backoff_ms: 50,
        }
    }
}

impl StreamConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn min_poll(&self) -> Duration {
        Duration::from_millis(self.min_poll_ms)
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_millis(self.max_poll_ms.max(self.min_poll_ms))
    }

    pub fn append_backoff(&self) -> Duration {
        Duration::from_millis(self.append_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StorageConfig {
    /// SQLite file; the event log stays in memory when unset.
    pub database_path: Option<String>,
}

impl StorageConfig {
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path.as_deref().map(expand_tilde)
    }
}

impl Config {
    pub fn reconflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".reconflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::reconflow_dir()?.join("reconflow.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::from_toml(&fs::read_to_string(&path)?)?;
        rlog_debug!(
            "Config loaded: max_concurrent={}, budget_limit={}, database={:?}",
            config.scheduler.max_concurrent,
            config.budget.limit,
            config.storage.database_path
        );
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent == 0 {
            return Err(Error::Validation(
                "scheduler.max_concurrent must be at least 1".to_string(),
            ));
        }
        if !self.budget.limit.is_finite() || self.budget.limit < 0.0 {
            return Err(Error::Validation(format!(
                "budget.limit must be a non-negative number, got {}",
                self.budget.limit
            )));
        }
        if self.stream.append_attempts == 0 {
            return Err(Error::Validation(
                "stream.append_attempts must be at least 1".to_string(),
            ));
        }
        for (field, value) in [
            ("stream.heartbeat_secs", self.stream.heartbeat_secs),
            ("stream.min_poll_ms", self.stream.min_poll_ms),
            ("stream.max_poll_ms", self.stream.max_poll_ms),
        ] {
            if value == 0 {
                return Err(Error::Validation(format!("{} must be at least 1", field)));
            }
        }
        if self.stream.min_poll_ms > self.stream.max_poll_ms {
            return Err(Error::Validation(format!(
                "stream.min_poll_ms ({}) exceeds stream.max_poll_ms ({})",
                self.stream.min_poll_ms, self.stream.max_poll_ms
            )));
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::reconflow_dir()?;
        rlog_debug!("Config::save dir={}", dir.display());
        if !dir.exists() {
            rlog_debug!("Creating reconflow directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Create the reconflow directory and the database's parent directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::reconflow_dir()?;
        if !dir.exists() {
            rlog_debug!("Creating reconflow directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        if let Some(parent) = self
            .storage
            .database_path()
            .as_ref()
            .and_then(|p| p.parent())
        {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                rlog_debug!("Creating database directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
