//! Vault configuration.
//!
//! A [`VaultConfig`] is built once at startup (from JSON, the environment
//! or code) and handed to [`crate::Vault::from_config`]. There is no
//! process-wide key state: everything the vault needs flows from here.

use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::error::VaultError;
use crate::keys::KekSet;

pub const ENV_MASTER_KEYS: &str = "VAULT_MASTER_KEYS";
pub const ENV_CACHE_FRESH_MS: &str = "VAULT_CACHE_FRESH_MS";
pub const ENV_CACHE_STALE_MS: &str = "VAULT_CACHE_STALE_MS";
pub const ENV_CACHE_MAX_SIZE: &str = "VAULT_CACHE_MAX_SIZE";
pub const ENV_STORAGE_TIMEOUT_MS: &str = "VAULT_STORAGE_TIMEOUT_MS";

/// Everything needed to construct a vault, apart from the object store.
#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    /// Ordered base64 master keys. The last entry is the active KEK; all
    /// entries remain eligible for decryption.
    pub master_keys: Vec<String>,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Upper bound on each object-store call.
    #[serde(default, rename = "storage_timeout_ms", with = "optional_duration_ms")]
    pub storage_timeout: Option<Duration>,
}

// Master keys are secrets; keep them out of Debug output.
impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("master_keys", &format_args!("[{} REDACTED]", self.master_keys.len()))
            .field("cache", &self.cache)
            .field("storage_timeout", &self.storage_timeout)
            .finish()
    }
}

mod optional_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

impl VaultConfig {
    pub fn new(master_keys: Vec<String>) -> Self {
        Self {
            master_keys,
            ..Self::default()
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = Some(timeout);
        self
    }

    /// Parse a JSON document such as
    /// `{"master_keys": ["..."], "cache": {"fresh_ms": 10000}}`.
    pub fn from_json(json: &str) -> Result<Self, VaultError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VaultError::Config(format!("invalid JSON config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `VAULT_*` environment variables.
    pub fn from_env() -> Result<Self, VaultError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup. Backs [`VaultConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, VaultError> {
        let master_keys = lookup(ENV_MASTER_KEYS)
            .ok_or_else(|| VaultError::Config(format!("{ENV_MASTER_KEYS} is not set")))?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let number = |name: &str| -> Result<Option<u64>, VaultError> {
            lookup(name)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map_err(|e| VaultError::Config(format!("{name}: {e}")))
                })
                .transpose()
        };

        let mut cache = CacheConfig::default();
        if let Some(ms) = number(ENV_CACHE_FRESH_MS)? {
            cache.fresh = Duration::from_millis(ms);
        }
        if let Some(ms) = number(ENV_CACHE_STALE_MS)? {
            cache.stale = Duration::from_millis(ms);
        }
        if let Some(size) = number(ENV_CACHE_MAX_SIZE)? {
            cache.max_size = usize::try_from(size)
                .map_err(|e| VaultError::Config(format!("{ENV_CACHE_MAX_SIZE}: {e}")))?;
        }

        let config = Self {
            master_keys,
            cache,
            storage_timeout: number(ENV_STORAGE_TIMEOUT_MS)?.map(Duration::from_millis),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check structural constraints. Key material is checked by [`VaultConfig::kek_set`].
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.master_keys.is_empty() {
            return Err(VaultError::Config("at least one master key is required".into()));
        }
        if self.cache.stale < self.cache.fresh {
            return Err(VaultError::Config(
                "cache stale window must not be shorter than the fresh window".into(),
            ));
        }
        if self.storage_timeout == Some(Duration::ZERO) {
            return Err(VaultError::Config("storage timeout must be positive".into()));
        }
        Ok(())
    }

    /// Decode the master keys into the read-only KEK set.
    pub fn kek_set(&self) -> Result<KekSet, VaultError> {
        self.validate()?;
        KekSet::from_encoded(&self.master_keys)
    }
}
