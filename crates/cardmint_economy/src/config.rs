//! # Configuration
//!
//! Balance data and store settings, loaded once at startup from TOML.
//!
//! ```toml
//! [economy]
//! free_pack_cooldown_secs = 1800
//! starting_coins = 0
//!
//! [ledger]
//! wal_path = "data/ledger.wal"
//! lock_timeout_ms = 5000
//! sync_on_commit = true
//! ```
//!
//! Omitted keys take their defaults; an omitted `[economy.catalog]` uses
//! [`Catalog::default`].

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::error::{EconomyError, EconomyResult};

/// Default free pack cooldown: 30 minutes.
pub const DEFAULT_FREE_PACK_COOLDOWN_SECS: u64 = 30 * 60;

/// Default bound on any single lock wait.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Economy balance settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyConfig {
    /// Rarities and packs.
    pub catalog: Catalog,
    /// Minimum time between two free packs, in seconds.
    pub free_pack_cooldown_secs: u64,
    /// Coins given to a user when the account is created.
    pub starting_coins: u64,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            catalog: Catalog::default(),
            free_pack_cooldown_secs: DEFAULT_FREE_PACK_COOLDOWN_SECS,
            starting_coins: 0,
        }
    }
}

impl EconomyConfig {
    /// Checks values the catalog itself cannot check.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidConfig`] if the cooldown does not fit a
    /// time delta.
    pub fn validate(&self) -> EconomyResult<()> {
        self.free_pack_cooldown().map(|_| ())
    }

    /// The free pack cooldown as a time delta.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidConfig`] if the cooldown is out of range.
    pub fn free_pack_cooldown(&self) -> EconomyResult<Duration> {
        i64::try_from(self.free_pack_cooldown_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                EconomyError::InvalidConfig(format!(
                    "free_pack_cooldown_secs out of range: {}",
                    self.free_pack_cooldown_secs
                ))
            })
    }
}

/// Ledger store settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Write-ahead log location; `None` keeps the ledger in memory only.
    pub wal_path: Option<PathBuf>,
    /// Upper bound on any lock wait before the operation fails.
    pub lock_timeout_ms: u64,
    /// Fsync the log on every commit.
    pub sync_on_commit: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            wal_path: None,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            sync_on_commit: true,
        }
    }
}

impl LedgerConfig {
    /// An in-memory ledger with default timeouts.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A durable ledger logging to `path`.
    #[must_use]
    pub fn durable(path: impl Into<PathBuf>) -> Self {
        Self {
            wal_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Lock wait bound.
    #[must_use]
    pub const fn lock_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.lock_timeout_ms)
    }
}

/// Complete engine configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardmintConfig {
    /// Balance settings.
    pub economy: EconomyConfig,
    /// Store settings.
    pub ledger: LedgerConfig,
}

impl CardmintConfig {
    /// Parses and validates a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidConfig`] on syntax or validation errors.
    pub fn from_toml_str(text: &str) -> EconomyResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| EconomyError::InvalidConfig(format!("config: {e}")))?;
        config.economy.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidConfig`] if the file cannot be read or is
    /// invalid.
    pub fn load(path: impl AsRef<Path>) -> EconomyResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EconomyError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }
}
