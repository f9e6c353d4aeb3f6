//! Store configuration
//!
//! Read from `strata.toml` in the repository directory. A missing file yields
//! the defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, StateError};
use crate::import::IdBehavior;
use crate::reconcile::ScalarFallback;
use crate::refs::UnresolvedPolicy;

pub const CONFIG_FILE: &str = "strata.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Item states held by the canonical store cache
    pub cache_capacity: usize,
    /// Node reference records held by the canonical store cache
    pub references_cache_capacity: usize,
    /// How many applied change log ids are remembered for retry detection
    pub applied_log_retention: usize,
    pub scalar_fallback: ScalarFallback,
    pub unresolved_references: UnresolvedPolicy,
    pub id_behavior: IdBehavior,
    /// sled database directory, relative to the repository directory
    pub storage_path: PathBuf,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            references_cache_capacity: 1_000,
            applied_log_retention: 1_024,
            scalar_fallback: ScalarFallback::default(),
            unresolved_references: UnresolvedPolicy::default(),
            id_behavior: IdBehavior::default(),
            storage_path: PathBuf::from("state.db"),
        }
    }
}

impl StrataConfig {
    /// Load the config of the repository at `repo_path`
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let config: StrataConfig = toml::from_str(&data).map_err(|e| {
            StateError::Configuration(format!("Failed to parse {:?}: {}", config_path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = repo_path.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = toml::to_string_pretty(self)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 || self.references_cache_capacity == 0 {
            return Err(StateError::Configuration("cache capacities must be positive".into()));
        }
        if self.applied_log_retention == 0 {
            return Err(StateError::Configuration("applied_log_retention must be positive".into()));
        }
        Ok(())
    }

    /// Absolute location of the sled database
    pub fn storage_dir(&self, repo_path: &Path) -> PathBuf {
        if self.storage_path.is_absolute() {
            self.storage_path.clone()
        } else {
            repo_path.join(&self.storage_path)
        }
    }
}
