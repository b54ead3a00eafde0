use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use dexopt_domain::{ClassLoaderContext, DexLoader};
use serde::{Deserialize, Serialize};

use super::locate::validate_dex_path;

pub(crate) const LEDGER_VERSION: u32 = 1;

/// In-memory ledger, keyed by owning package.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct DexUse {
    pub(crate) packages: BTreeMap<String, PackageDexUse>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PackageDexUse {
    pub(crate) primary: BTreeMap<String, PrimaryDexUse>,
    pub(crate) secondary: BTreeMap<String, SecondaryDexUse>,
}

impl PackageDexUse {
    pub(crate) fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PrimaryDexUse {
    pub(crate) records: BTreeMap<DexLoader, PrimaryRecord>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PrimaryRecord {
    pub(crate) last_used_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SecondaryDexUse {
    pub(crate) user_id: u32,
    /// Merged over every report; never returns to `Known` once degraded.
    pub(crate) class_loader_context: ClassLoaderContext,
    pub(crate) records: BTreeMap<DexLoader, SecondaryRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SecondaryRecord {
    /// Raw context as last reported by this loader.
    pub(crate) class_loader_context: String,
    pub(crate) abi_name: String,
    pub(crate) last_used_at_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    #[serde(default)]
    packages: BTreeMap<String, PackageEntry>,
}

#[derive(Serialize, Deserialize, Default)]
struct PackageEntry {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    primary: Vec<PrimaryEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    secondary: Vec<SecondaryEntry>,
}

/// One primary container, keyed by the split's dex path rather than its split name.
///
/// Notifications and cleanup both speak in paths, so the path is the stable key.
#[derive(Serialize, Deserialize)]
struct PrimaryEntry {
    dex_path: String,
    records: Vec<PrimaryRecordEntry>,
}

#[derive(Serialize, Deserialize)]
struct PrimaryRecordEntry {
    loading_package: String,
    #[serde(default)]
    isolated_process: bool,
    last_used_at_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct SecondaryEntry {
    dex_path: String,
    user_id: u32,
    class_loader_context: ClassLoaderContext,
    records: Vec<SecondaryRecordEntry>,
}

#[derive(Serialize, Deserialize)]
struct SecondaryRecordEntry {
    loading_package: String,
    #[serde(default)]
    isolated_process: bool,
    class_loader_context: String,
    abi_name: String,
    last_used_at_ms: u64,
}

/// Limits applied while reading a ledger back.
pub(crate) struct LoadRules<'a> {
    pub(crate) max_path_length: usize,
    pub(crate) native_abis: &'a [String],
}

impl DexUse {
    pub(crate) fn to_json(&self) -> Result<Vec<u8>> {
        let file = LedgerFile {
            version: LEDGER_VERSION,
            packages: self
                .packages
                .iter()
                .filter(|(_, pkg)| !pkg.is_empty())
                .map(|(name, pkg)| (name.clone(), PackageEntry::from_model(pkg)))
                .collect(),
        };
        serde_json::to_vec_pretty(&file).context("failed to encode dex use ledger")
    }

    /// Decodes a persisted ledger, dropping records that no longer pass validation.
    pub(crate) fn from_json(bytes: &[u8], rules: &LoadRules<'_>) -> Result<Self> {
        let file: LedgerFile =
            serde_json::from_slice(bytes).context("failed to decode dex use ledger")?;
        if file.version != LEDGER_VERSION {
            bail!("unsupported dex use ledger version {}", file.version);
        }
        let mut dex_use = Self::default();
        for (owner, entry) in file.packages {
            if owner.is_empty() {
                tracing::warn!("skipping ledger entry with empty package name");
                continue;
            }
            let pkg = entry.into_model(&owner, rules);
            if !pkg.is_empty() {
                dex_use.packages.insert(owner, pkg);
            }
        }
        Ok(dex_use)
    }
}

impl PackageEntry {
    fn from_model(pkg: &PackageDexUse) -> Self {
        let primary = pkg
            .primary
            .iter()
            .filter(|(_, dex)| !dex.records.is_empty())
            .map(|(path, dex)| PrimaryEntry {
                dex_path: path.clone(),
                records: dex
                    .records
                    .iter()
                    .map(|(loader, record)| PrimaryRecordEntry {
                        loading_package: loader.loading_package_name.clone(),
                        isolated_process: loader.isolated_process,
                        last_used_at_ms: record.last_used_at_ms,
                    })
                    .collect(),
            })
            .collect();
        let secondary = pkg
            .secondary
            .iter()
            .filter(|(_, dex)| !dex.records.is_empty())
            .map(|(path, dex)| SecondaryEntry {
                dex_path: path.clone(),
                user_id: dex.user_id,
                class_loader_context: dex.class_loader_context.clone(),
                records: dex
                    .records
                    .iter()
                    .map(|(loader, record)| SecondaryRecordEntry {
                        loading_package: loader.loading_package_name.clone(),
                        isolated_process: loader.isolated_process,
                        class_loader_context: record.class_loader_context.clone(),
                        abi_name: record.abi_name.clone(),
                        last_used_at_ms: record.last_used_at_ms,
                    })
                    .collect(),
            })
            .collect();
        Self { primary, secondary }
    }

    fn into_model(self, owner: &str, rules: &LoadRules<'_>) -> PackageDexUse {
        let mut pkg = PackageDexUse::default();
        for entry in self.primary {
            if let Err(err) = validate_dex_path(&entry.dex_path, rules.max_path_length) {
                tracing::warn!(package = owner, %err, "skipping primary dex record");
                continue;
            }
            let records: BTreeMap<_, _> = entry
                .records
                .into_iter()
                .filter(|record| {
                    let keep = !record.loading_package.is_empty() && record.last_used_at_ms > 0;
                    if !keep {
                        tracing::warn!(
                            package = owner,
                            dex_path = %entry.dex_path,
                            "skipping malformed primary loader record"
                        );
                    }
                    keep
                })
                .map(|record| {
                    (
                        DexLoader::new(record.loading_package, record.isolated_process),
                        PrimaryRecord {
                            last_used_at_ms: record.last_used_at_ms,
                        },
                    )
                })
                .collect();
            if !records.is_empty() {
                pkg.primary
                    .insert(entry.dex_path, PrimaryDexUse { records });
            }
        }
        for entry in self.secondary {
            if let Err(err) = validate_dex_path(&entry.dex_path, rules.max_path_length) {
                tracing::warn!(package = owner, %err, "skipping secondary dex record");
                continue;
            }
            let records: BTreeMap<_, _> = entry
                .records
                .into_iter()
                .filter(|record| {
                    let keep = !record.loading_package.is_empty()
                        && record.last_used_at_ms > 0
                        && !record.class_loader_context.is_empty()
                        && rules.native_abis.contains(&record.abi_name);
                    if !keep {
                        tracing::warn!(
                            package = owner,
                            dex_path = %entry.dex_path,
                            abi = %record.abi_name,
                            "skipping stale secondary loader record"
                        );
                    }
                    keep
                })
                .map(|record| {
                    (
                        DexLoader::new(record.loading_package, record.isolated_process),
                        SecondaryRecord {
                            class_loader_context: record.class_loader_context,
                            abi_name: record.abi_name,
                            last_used_at_ms: record.last_used_at_ms,
                        },
                    )
                })
                .collect();
            if !records.is_empty() {
                pkg.secondary.insert(
                    entry.dex_path,
                    SecondaryDexUse {
                        user_id: entry.user_id,
                        class_loader_context: entry.class_loader_context,
                        records,
                    },
                );
            }
        }
        pkg
    }
}
