use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::RetryPolicy;
use crate::{cflog_debug, Error, Result};

/// Timing and retry settings for the standard recipes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hold applied to every successful request so the tree stays readable.
    pub call_delay_ms: u64,
    /// Simulated round-trip time of the in-process transport.
    pub transport_latency_ms: u64,
    /// Retries after the first attempt in the `retry` recipe.
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    /// Extra hold on the slow member of the `fork-join` recipe.
    pub straggler_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            call_delay_ms: 1000,
            transport_latency_ms: 300,
            retry_count: 2,
            retry_delay_ms: 2000,
            straggler_delay_ms: 2000,
        }
    }
}

impl Config {
    /// A configuration with every delay set to zero, for fast runs.
    pub fn instant() -> Self {
        Self {
            call_delay_ms: 0,
            transport_latency_ms: 0,
            retry_delay_ms: 0,
            straggler_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn callflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".callflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::callflow_dir()?.join("callflow.toml"))
    }

    pub fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }

    pub fn transport_latency(&self) -> Duration {
        Duration::from_millis(self.transport_latency_ms)
    }

    pub fn straggler_delay(&self) -> Duration {
        Duration::from_millis(self.straggler_delay_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry_count, Duration::from_millis(self.retry_delay_ms))
    }

    /// Load from `~/.callflow/callflow.toml`, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        cflog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            cflog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        cflog_debug!("Config loaded: {:?}", config);
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        cflog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    fn validate(&self) -> Result<()> {
        // Retry counts past this are almost certainly a typo for a delay.
        if self.retry_count > 100 {
            return Err(Error::Validation(format!(
                "retry_count {} exceeds the limit of 100",
                self.retry_count
            )));
        }
        Ok(())
    }
}
