//! flowrt configuration system
//!
//! One [`RuntimeConfig`] describes every strategy a runtime is built with.
//! It is constructed once and handed to the domains by value.
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high -> low):
//! 1. Environment overrides (FLOWRT_WORKERS, FLOWRT_DOMAINS, FLOWRT_LOG)
//! 2. Explicit file
//! 3. File named by FLOWRT_CONFIG
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use flowrt::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_toml_str("[runtime]\ndomains = 2\n").unwrap();
//! assert_eq!(config.runtime.domains, 2);
//! ```

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::comm::CommConfig;
use crate::runtime::guid::{ProviderKind, MAX_DOMAINS};
use crate::runtime::memory::AllocatorKind;
use crate::runtime::scheduler::SchedulerConfig;
use crate::util::logger::LogLevel;

/// Environment variable naming a config file.
pub const ENV_CONFIG: &str = "FLOWRT_CONFIG";
/// Environment override for `scheduler.workers`.
pub const ENV_WORKERS: &str = "FLOWRT_WORKERS";
/// Environment override for `runtime.domains`.
pub const ENV_DOMAINS: &str = "FLOWRT_DOMAINS";
/// Environment override for `log.level`.
pub const ENV_LOG: &str = "FLOWRT_LOG";

/// Complete runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub guid: GuidConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub comm: CommConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Cluster shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Number of policy domains.
    #[serde(default = "default_domains")]
    pub domains: usize,
}

fn default_domains() -> usize {
    1
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            domains: default_domains(),
        }
    }
}

/// GUID provider settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    /// Live entries a provider may hold before `GuidTableFull`.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_max_entries() -> usize {
    1 << 20
}

impl Default for GuidConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            max_entries: default_max_entries(),
        }
    }
}

/// Metadata allocator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default)]
    pub kind: AllocatorKind,
    /// Arena size of the bounded allocator.
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: usize,
}

fn default_capacity_bytes() -> usize {
    64 << 20
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            kind: AllocatorKind::default(),
            capacity_bytes: default_capacity_bytes(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
}

impl RuntimeConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load with the full precedence chain and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load_file(path)?,
            None => match std::env::var_os(ENV_CONFIG) {
                Some(path) => Self::load_file(Path::new(&path))?,
                None => Self::default(),
            },
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the `FLOWRT_*` overrides found through `lookup`.
    pub fn apply_env<F>(
        &mut self,
        lookup: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_WORKERS) {
            self.scheduler.workers = parse_env(ENV_WORKERS, &value)?;
        }
        if let Some(value) = lookup(ENV_DOMAINS) {
            self.runtime.domains = parse_env(ENV_DOMAINS, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG) {
            self.log.level = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_LOG,
                value: value.clone(),
            })?;
        }
        Ok(())
    }

    /// Reject combinations the runtime cannot be built with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let domains = self.runtime.domains;
        if domains == 0 {
            return Err(ConfigError::Invalid("runtime.domains must be at least 1".into()));
        }
        if domains >= MAX_DOMAINS {
            return Err(ConfigError::Invalid(format!(
                "runtime.domains must be below {MAX_DOMAINS}, got {domains}"
            )));
        }
        if self.scheduler.workers == 0 {
            return Err(ConfigError::Invalid("scheduler.workers must be at least 1".into()));
        }
        if self.guid.provider == ProviderKind::Ptr && domains > 1 {
            return Err(ConfigError::Invalid(
                "the ptr GUID provider only supports a single domain".into(),
            ));
        }
        if self.guid.max_entries == 0 {
            return Err(ConfigError::Invalid("guid.max_entries must be at least 1".into()));
        }
        if self.comm.reorder_window == 0 {
            return Err(ConfigError::Invalid("comm.reorder_window must be at least 1".into()));
        }
        Ok(())
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    pub fn save(
        &self,
        path: &Path,
    ) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn parse_env(
    var: &'static str,
    value: &str,
) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Config parse error: {0}")]
    Parse(toml::de::Error),
    #[error("Config serialize error: {0}")]
    Serialize(toml::ser::Error),
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
