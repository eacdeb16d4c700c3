//! # Engine Configuration
//!
//! Settings for every subsystem, loaded from TOML and then overridden from
//! `SFM_*` environment variables:
//!
//! | Variable                 | Field                          |
//! |--------------------------|--------------------------------|
//! | `SFM_MEMORY_LIMIT_BYTES` | `memory.limit_bytes`           |
//! | `SFM_CACHE_MAX_ENTRIES`  | `cache.max_entries`            |
//! | `SFM_CACHE_TTL_SECS`     | `cache.default_ttl_secs`       |
//! | `SFM_STORAGE_PATH`       | `persistence.storage_path`     |
//! | `SFM_MAX_VERSIONS`       | `persistence.max_versions`     |
//!
//! Every section and field has a default, so an empty document is valid.

use crate::SfmError;
use crate::query::CommunityAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SfmConfig {
    pub memory: MemoryConfig,
    pub cache: CacheConfig,
    pub persistence: PersistenceConfig,
    pub query: QueryConfig,
}

/// Memory manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Hard ceiling on estimated resident bytes.
    pub limit_bytes: usize,
    /// Cleanup evicts down to `limit_bytes * low_water_ratio`.
    pub low_water_ratio: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 256 * 1024 * 1024,
            low_water_ratio: 0.8,
        }
    }
}

impl MemoryConfig {
    #[must_use]
    pub fn low_water_bytes(&self) -> usize {
        (self.limit_bytes as f64 * self.low_water_ratio) as usize
    }
}

/// Cache layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Entry bound of the in-process tier.
    pub max_entries: usize,
    /// Byte bound of the in-process tier.
    pub max_bytes: usize,
    pub default_ttl_secs: u64,
    /// Path of the redb-backed shared tier; `None` disables it.
    pub shared_tier_path: Option<PathBuf>,
    /// Entry bound of the shared tier.
    pub shared_tier_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            default_ttl_secs: 1800,
            shared_tier_path: None,
            shared_tier_max_entries: 100_000,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub storage_path: PathBuf,
    /// Versions kept per graph by `cleanup_old_versions` when no explicit
    /// count is given.
    pub max_versions: usize,
    /// Verify checksums on every load.
    pub verify_on_load: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("sfm_storage"),
            max_versions: 10,
            verify_on_load: true,
        }
    }
}

/// Query engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub community_algorithm: CommunityAlgorithm,
    /// TTL override for query results; falls back to the cache default.
    pub result_ttl_secs: Option<u64>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            community_algorithm: CommunityAlgorithm::LabelPropagation,
            result_ttl_secs: None,
        }
    }
}

impl SfmConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, SfmError> {
        let config: Self = toml::from_str(input)
            .map_err(|e| SfmError::Serialization(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SfmError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SfmError::Storage(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `SFM_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring unparseable override");
                    None
                }
            }
        }

        if let Some(v) = parsed(&lookup, "SFM_MEMORY_LIMIT_BYTES") {
            self.memory.limit_bytes = v;
        }
        if let Some(v) = parsed(&lookup, "SFM_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = v;
        }
        if let Some(v) = parsed(&lookup, "SFM_CACHE_TTL_SECS") {
            self.cache.default_ttl_secs = v;
        }
        if let Some(path) = lookup("SFM_STORAGE_PATH") {
            self.persistence.storage_path = PathBuf::from(path);
        }
        if let Some(v) = parsed(&lookup, "SFM_MAX_VERSIONS") {
            self.persistence.max_versions = v;
        }
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<(), SfmError> {
        let ratio = self.memory.low_water_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(SfmError::InvalidValue {
                field: "memory.low_water_ratio",
                reason: format!("{ratio} is outside (0, 1]"),
            });
        }
        if self.cache.max_entries == 0 {
            return Err(SfmError::InvalidValue {
                field: "cache.max_entries",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.cache.max_bytes == 0 {
            return Err(SfmError::InvalidValue {
                field: "cache.max_bytes",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.cache.shared_tier_max_entries == 0 {
            return Err(SfmError::InvalidValue {
                field: "cache.shared_tier_max_entries",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.persistence.max_versions == 0 {
            return Err(SfmError::InvalidValue {
                field: "persistence.max_versions",
                reason: "must keep at least one version".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
