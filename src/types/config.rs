//! Configuration structures.
//!
//! Configuration is loaded from JSON text or files; every section has
//! defaults so an empty document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KernelConfig {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Worker teams available to functions and duties.
    #[serde(default)]
    pub teams: Vec<TeamConfig>,

    /// Executor used for off-team work handed out by contexts.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Governance policy.
    #[serde(default)]
    pub governance: GovernanceConfig,

    /// Asynchronous flow defaults.
    #[serde(default)]
    pub asynchronous_flow: AsynchronousFlowConfig,

    /// Office shutdown behaviour.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl KernelConfig {
    /// Parse configuration from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: KernelConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for team in &self.teams {
            if team.name.is_empty() {
                return Err(Error::validation("team name is required"));
            }
            if team.size == 0 {
                return Err(Error::validation(format!(
                    "team '{}' must have at least one worker",
                    team.name
                )));
            }
            if !seen.insert(team.name.as_str()) {
                return Err(Error::validation(format!("duplicate team '{}'", team.name)));
            }
        }
        if self.executor.threads == 0 {
            return Err(Error::validation("executor must have at least one thread"));
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// A fixed-size worker team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Team name referenced by functions and duties.
    pub name: String,

    /// Number of worker threads.
    #[serde(default = "default_team_size")]
    pub size: usize,
}

fn default_team_size() -> usize {
    2
}

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Worker threads backing `Executor` handles.
    pub threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { threads: 2 }
    }
}

/// Governance policy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GovernanceConfig {
    /// When set, the kernel never enforces governance on scope close; duties
    /// must enforce or disregard explicitly.
    pub manual: bool,
}

/// Asynchronous flow defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AsynchronousFlowConfig {
    /// Timeout applied to asynchronous flows whose slot configures none.
    #[serde(default, with = "humantime_serde")]
    pub default_timeout: Option<Duration>,
}

/// Office shutdown behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for worker teams to drain on close.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}
