use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_LEDGER_PATH: &str = "/data/system/package-dex-usage.json";
const DEFAULT_SAVE_INTERVAL_MS: u64 = 15_000;
const MAX_PATH_LENGTH: usize = 4096;
const MAX_CLASS_LOADER_CONTEXT_LENGTH: usize = 10_000;
const DEFAULT_MAX_SECONDARY_DEX_FILES: usize = 500;
const DEFAULT_NATIVE_ABIS: &[&str] = &["arm64-v8a", "armeabi-v7a"];
const DEFAULT_DOWNGRADE_THRESHOLD_BYTES: u64 = 500_000_000;
const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Case-insensitive truthiness shared by every boolean variable.
pub(crate) fn parse_bool(raw: &str) -> bool {
    let lowered = raw.trim().to_ascii_lowercase();
    !matches!(lowered.as_str(), "0" | "false" | "no" | "off" | "")
}

#[derive(Debug, Clone, Default)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub(crate) fn flag_is_enabled(&self, key: &str) -> bool {
        self.var(key).is_some_and(parse_bool)
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        self.var(key).map_or(default, parse_bool)
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.var(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .with_context(|| format!("invalid value for {key}: {raw:?}"))
            })
            .transpose()
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub(crate) dex_use: DexUseConfig,
    pub(crate) batch: BatchConfig,
    pub(crate) pre_reboot: PreRebootConfig,
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error if a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let defaults = Self::default();
        let native_abis = match snapshot.var("DEXOPT_NATIVE_ABIS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|abi| !abi.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
            None => defaults.dex_use.native_abis,
        };
        let inactive_days: Option<u64> = snapshot.parsed("DEXOPT_DOWNGRADE_AFTER_INACTIVE_DAYS")?;
        Ok(Self {
            dex_use: DexUseConfig {
                ledger_path: snapshot
                    .var("DEXOPT_DEX_USE_FILE")
                    .map_or(defaults.dex_use.ledger_path, PathBuf::from),
                save_interval: snapshot
                    .parsed("DEXOPT_DEX_USE_SAVE_INTERVAL_MS")?
                    .map_or(defaults.dex_use.save_interval, Duration::from_millis),
                max_secondary_dex_files_per_owner: snapshot
                    .parsed("DEXOPT_MAX_SECONDARY_DEX_FILES")?
                    .unwrap_or(defaults.dex_use.max_secondary_dex_files_per_owner),
                native_abis,
                ..defaults.dex_use
            },
            batch: BatchConfig {
                inactive_window: inactive_days
                    .map(|days| Duration::from_millis(days.saturating_mul(MS_PER_DAY))),
                downgrade_threshold_bytes: snapshot
                    .parsed("DEXOPT_DOWNGRADE_THRESHOLD_BYTES")?
                    .unwrap_or(defaults.batch.downgrade_threshold_bytes),
                concurrency: snapshot
                    .parsed::<usize>("DEXOPT_CONCURRENCY")?
                    .map_or(defaults.batch.concurrency, |n| n.max(1)),
            },
            pre_reboot: PreRebootConfig {
                enabled: snapshot.flag_is_enabled("DEXOPT_ENABLE_PR_DEXOPT"),
                disable_bg_dexopt: snapshot.flag_is_enabled("DEXOPT_DISABLE_BG_DEXOPT"),
                update_engine_api: snapshot.bool_or("DEXOPT_UPDATE_ENGINE_API", true),
            },
        })
    }

    #[must_use]
    pub fn dex_use(&self) -> &DexUseConfig {
        &self.dex_use
    }

    #[must_use]
    pub fn batch(&self) -> &BatchConfig {
        &self.batch
    }

    #[must_use]
    pub fn pre_reboot(&self) -> &PreRebootConfig {
        &self.pre_reboot
    }
}

#[derive(Debug, Clone)]
pub struct DexUseConfig {
    pub ledger_path: PathBuf,
    pub save_interval: Duration,
    pub max_path_length: usize,
    pub max_class_loader_context_length: usize,
    pub max_secondary_dex_files_per_owner: usize,
    /// Supported ABIs, most preferred first.
    pub native_abis: Vec<String>,
}

impl Default for DexUseConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from(DEFAULT_LEDGER_PATH),
            save_interval: Duration::from_millis(DEFAULT_SAVE_INTERVAL_MS),
            max_path_length: MAX_PATH_LENGTH,
            max_class_loader_context_length: MAX_CLASS_LOADER_CONTEXT_LENGTH,
            max_secondary_dex_files_per_owner: DEFAULT_MAX_SECONDARY_DEX_FILES,
            native_abis: DEFAULT_NATIVE_ABIS
                .iter()
                .map(|abi| (*abi).to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// `None` disables downgrading and keeps every package in the recent set.
    pub inactive_window: Option<Duration>,
    pub downgrade_threshold_bytes: u64,
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            inactive_window: None,
            downgrade_threshold_bytes: DEFAULT_DOWNGRADE_THRESHOLD_BYTES,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PreRebootConfig {
    pub enabled: bool,
    pub disable_bg_dexopt: bool,
    pub update_engine_api: bool,
}

impl Default for PreRebootConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            disable_bg_dexopt: false,
            update_engine_api: true,
        }
    }
}
