//! Dispatcher tunables.
//!
//! Every option can be changed at runtime through [`SettingsUpdate`]. Updates are
//! partial: an absent field keeps whatever value was in force before.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// How a tier picks among groups tied at the lowest running count.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    Random,
    /// Rotate through tied groups in creation order.
    RoundRobin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    pub enabled: bool,
    /// Outstanding (pending + running) items allowed per group.
    pub max_group_size: usize,
    /// Do not count in-flight continuations against their group.
    pub exempt_in_flight: bool,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_group_size: 1000,
            exempt_in_flight: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub target_active_slots: usize,
    /// Wait after which an item climbs one tier.
    pub deadline_seconds: u64,
    pub reprioritize_interval_ms: u64,
    pub tie_break: TieBreak,
    /// Seeds the tie-break RNG; random when unset.
    pub seed: Option<u64>,
    pub throttling: ThrottleSettings,
}

fn default_target_active_slots() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(2))
        .unwrap_or(1)
        .max(1)
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            target_active_slots: default_target_active_slots(),
            deadline_seconds: 10,
            reprioritize_interval_ms: 1,
            tie_break: TieBreak::default(),
            seed: None,
            throttling: ThrottleSettings::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let config: DispatcherConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        positive("target_active_slots", self.target_active_slots as u64)?;
        positive("deadline_seconds", self.deadline_seconds)?;
        positive("reprioritize_interval_ms", self.reprioritize_interval_ms)?;
        positive(
            "throttling.max_group_size",
            self.throttling.max_group_size as u64,
        )?;
        Ok(())
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_seconds)
    }

    pub fn reprioritize_interval(&self) -> Duration {
        Duration::from_millis(self.reprioritize_interval_ms)
    }

    /// Returns a validated copy with `update` layered on top.
    pub fn merged(&self, update: &SettingsUpdate) -> ConfigResult<Self> {
        let mut next = self.clone();
        if let Some(enabled) = update.enabled {
            next.throttling.enabled = enabled;
        }
        if let Some(max_group_size) = update.max_group_size {
            next.throttling.max_group_size = max_group_size;
        }
        if let Some(exempt) = update.exempt_in_flight {
            next.throttling.exempt_in_flight = exempt;
        }
        if let Some(slots) = update.target_active_slots {
            next.target_active_slots = slots;
        }
        if let Some(deadline) = update.deadline_seconds {
            next.deadline_seconds = deadline;
        }
        if let Some(interval) = update.reprioritize_interval_ms {
            next.reprioritize_interval_ms = interval;
        }
        next.validate()?;
        Ok(next)
    }
}

fn positive(field: &'static str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Partial runtime update of the live settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsUpdate {
    pub enabled: Option<bool>,
    pub max_group_size: Option<usize>,
    pub exempt_in_flight: Option<bool>,
    pub target_active_slots: Option<usize>,
    pub deadline_seconds: Option<u64>,
    pub reprioritize_interval_ms: Option<u64>,
}

impl SettingsUpdate {
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn is_empty(&self) -> bool {
        *self == SettingsUpdate::default()
    }
}

/// Live config. `version` starts at 1 and grows by one per applied update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedConfig {
    pub version: u64,
    pub config: DispatcherConfig,
}
