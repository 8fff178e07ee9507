// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Engine Configuration
//
// Process-wide settings passed explicitly into the engine context and the
// reification dispatcher:
// - global toggles (disabled kinds, disable-all, disable-bean processors)
// - thread pool profiles
// - producer cache and event bus sizing
// - aggregation and shutdown timing

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::executor::ThreadPoolProfile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine name, used in logs and pool names
    #[serde(default = "default_name")]
    pub name: String,

    /// Step kinds reified to no-ops
    #[serde(default)]
    pub disabled_kinds: Vec<String>,

    /// Reify every step to a no-op
    #[serde(default)]
    pub disable_all_processors: bool,

    /// Reify `process` steps to no-ops
    #[serde(default)]
    pub disable_bean_processors: bool,

    /// Install the per-step trace interceptor
    #[serde(default)]
    pub tracing: bool,

    #[serde(default)]
    pub default_thread_pool: ThreadPoolProfile,

    #[serde(default)]
    pub thread_pool_profiles: Vec<ThreadPoolProfile>,

    /// Default LRU bound of dynamic destination caches
    #[serde(default = "default_producer_cache_size")]
    pub producer_cache_size: usize,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    #[serde(default)]
    pub aggregation: AggregationDefaults,

    /// How long a route waits for in-flight exchanges on stop
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationDefaults {
    #[serde(default = "default_checker_interval", with = "humantime_serde")]
    pub timeout_checker_interval: Duration,
}

impl Default for AggregationDefaults {
    fn default() -> Self {
        Self {
            timeout_checker_interval: default_checker_interval(),
        }
    }
}

fn default_name() -> String {
    "conduit".to_string()
}

fn default_producer_cache_size() -> usize {
    1000
}

fn default_event_bus_capacity() -> usize {
    1000
}

fn default_checker_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            disabled_kinds: Vec::new(),
            disable_all_processors: false,
            disable_bean_processors: false,
            tracing: false,
            default_thread_pool: ThreadPoolProfile::default(),
            thread_pool_profiles: Vec::new(),
            producer_cache_size: default_producer_cache_size(),
            event_bus_capacity: default_event_bus_capacity(),
            aggregation: AggregationDefaults::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn parse_flag(name: &str, val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(
                "Invalid value for {}: '{}'. Expected true/false. Ignoring.",
                name,
                val
            );
            None
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. CONDUIT_CONFIG_PATH environment variable
    /// 2. ./conduit.yaml (working directory)
    /// 3. ~/.conduit/config.yaml (user home)
    /// 4. /etc/conduit/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CONDUIT_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./conduit.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".conduit").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/conduit/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // An explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::debug!("No configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CONDUIT_PRODUCER_CACHE_SIZE") {
            match val.parse::<usize>() {
                Ok(size) => {
                    tracing::info!("Environment override: CONDUIT_PRODUCER_CACHE_SIZE={}", size);
                    self.producer_cache_size = size;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for CONDUIT_PRODUCER_CACHE_SIZE: '{}'. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("CONDUIT_TRACING") {
            if let Some(flag) = parse_flag("CONDUIT_TRACING", &val) {
                tracing::info!("Environment override: CONDUIT_TRACING={}", flag);
                self.tracing = flag;
            }
        }

        if let Ok(val) = std::env::var("CONDUIT_DISABLE_ALL_PROCESSORS") {
            if let Some(flag) = parse_flag("CONDUIT_DISABLE_ALL_PROCESSORS", &val) {
                tracing::info!("Environment override: CONDUIT_DISABLE_ALL_PROCESSORS={}", flag);
                self.disable_all_processors = flag;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("name cannot be empty");
        }

        if self.event_bus_capacity == 0 {
            anyhow::bail!("event_bus_capacity must be greater than zero");
        }

        let mut ids = HashSet::new();
        for profile in std::iter::once(&self.default_thread_pool).chain(&self.thread_pool_profiles) {
            if profile.id.trim().is_empty() {
                anyhow::bail!("thread pool profile id cannot be empty");
            }
            if !ids.insert(profile.id.as_str()) {
                anyhow::bail!("Duplicate thread pool profile id: '{}'", profile.id);
            }
            if profile.pool_size == 0 {
                anyhow::bail!("pool_size must be greater than zero for profile: {}", profile.id);
            }
            if profile.max_pool_size < profile.pool_size {
                anyhow::bail!(
                    "max_pool_size ({}) is smaller than pool_size ({}) for profile: {}",
                    profile.max_pool_size,
                    profile.pool_size,
                    profile.id
                );
            }
        }

        if self.aggregation.timeout_checker_interval.is_zero() {
            anyhow::bail!("aggregation.timeout_checker_interval must be greater than zero");
        }

        Ok(())
    }

    pub fn profile(&self, id: &str) -> Option<&ThreadPoolProfile> {
        self.thread_pool_profiles.iter().find(|p| p.id == id)
    }

    pub fn is_kind_disabled(&self, kind: &str) -> bool {
        self.disable_all_processors
            || (self.disable_bean_processors && kind == "process")
            || self.disabled_kinds.iter().any(|k| k == kind)
    }
}
