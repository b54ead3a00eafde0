//! Ledger of which dex files are loaded by which apps.
//!
//! Mutations are applied in memory under one lock and persisted by a debounce timer; the
//! shutdown path flushes synchronously. Readers always see the in-memory state.

mod debounce;
mod ledger;
mod locate;


use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::Result;
use dexopt_domain::{
    is_loader_other_app, is_used_by_other_apps, CallerInfo, CheckedSecondaryDexInfo,
    ClassLoaderContext, DexLoader, FileVisibility, PackageSnapshot, SecondaryDexInfo,
    PLATFORM_PACKAGE_NAME,
};

use crate::core::config::DexUseConfig;
use crate::core::effects::{Clock, CompilerDriver, Effects, PackageInventory, PersistenceBackend};
use crate::core::error::DexoptError;
use debounce::Debouncer;
use ledger::{
    DexUse, LoadRules, PrimaryDexUse, PrimaryRecord, SecondaryDexUse, SecondaryRecord,
};
use locate::{resolve_owner, validate_class_loader_context, validate_dex_path, DexOwner};

/// Whether the store may be mutated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    Normal,
    /// Read-only view used while an OS update is staged. Mutations fail with `IllegalState`
    /// and nothing is ever written back.
    Staged,
}

pub struct DexUseStore {
    inner: Arc<StoreInner>,
    debouncer: Option<Debouncer>,
}

struct StoreInner {
    config: DexUseConfig,
    mode: StoreMode,
    persistence: Arc<dyn PersistenceBackend>,
    clock: Arc<dyn Clock>,
    compiler: Arc<dyn CompilerDriver>,
    inventory: Arc<dyn PackageInventory>,
    state: Mutex<StoreState>,
    save_lock: Mutex<()>,
}

#[derive(Default)]
struct StoreState {
    dex_use: DexUse,
    revision: u64,
    committed: u64,
}

/// A validated mutation waiting to be applied.
enum PendingUse<'a> {
    Primary {
        owner: &'a str,
        dex_path: &'a str,
    },
    Secondary {
        owner: &'a str,
        dex_path: &'a str,
        user_id: u32,
        class_loader_context: &'a str,
        abi_name: &'a str,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum DexKind {
    Primary,
    Secondary,
}

impl DexUseStore {
    /// Loads the ledger and, in normal mode, starts the save timer.
    ///
    /// A missing or unreadable ledger starts the store empty.
    pub fn new(config: DexUseConfig, effects: &Effects, mode: StoreMode) -> Result<Self> {
        let dex_use = load_ledger(&config, effects.persistence.as_ref());
        let inner = Arc::new(StoreInner {
            mode,
            persistence: Arc::clone(&effects.persistence),
            clock: Arc::clone(&effects.clock),
            compiler: Arc::clone(&effects.compiler),
            inventory: Arc::clone(&effects.inventory),
            state: Mutex::new(StoreState {
                dex_use,
                ..StoreState::default()
            }),
            save_lock: Mutex::new(()),
            config,
        });
        let debouncer = match mode {
            StoreMode::Staged => None,
            StoreMode::Normal => {
                let weak: Weak<StoreInner> = Arc::downgrade(&inner);
                Some(Debouncer::spawn(
                    "dex-use-save",
                    inner.config.save_interval,
                    move || match weak.upgrade() {
                        Some(inner) => {
                            inner.save_logged();
                            true
                        }
                        None => false,
                    },
                )?)
            }
        };
        Ok(Self { inner, debouncer })
    }

    /// Records that `loading_package` loaded each dex path with the given class loader context.
    ///
    /// Every path and context is validated before anything is recorded; one bad entry rejects
    /// the whole call.
    pub fn notify_loaded(
        &self,
        snapshot: &PackageSnapshot,
        caller: CallerInfo,
        loading_package: &str,
        class_loader_context_by_dex_path: &BTreeMap<String, String>,
    ) -> Result<()> {
        let inner = &self.inner;
        if inner.mode == StoreMode::Staged {
            return Err(DexoptError::illegal(
                "dex use notifications are not accepted while an update is staged",
            ));
        }
        if class_loader_context_by_dex_path.is_empty() {
            return Err(DexoptError::invalid("no dex paths were reported"));
        }
        for (dex_path, context) in class_loader_context_by_dex_path {
            validate_dex_path(dex_path, inner.config.max_path_length)?;
            validate_class_loader_context(
                dex_path,
                context,
                inner.config.max_class_loader_context_length,
            )?;
        }
        if loading_package == PLATFORM_PACKAGE_NAME {
            return Ok(());
        }
        let Some(loading) = snapshot.package_state(loading_package) else {
            return Err(DexoptError::invalid(format!(
                "unknown loading package '{loading_package}'"
            )));
        };

        let abi_name = loading
            .primary_abi
            .as_deref()
            .or_else(|| inner.config.native_abis.first().map(String::as_str))
            .unwrap_or_default();
        let mut pending = Vec::with_capacity(class_loader_context_by_dex_path.len());
        for (dex_path, context) in class_loader_context_by_dex_path {
            match resolve_owner(snapshot, loading, dex_path, caller.user_id()) {
                DexOwner::Primary(owner) => pending.push(PendingUse::Primary {
                    owner: &owner.name,
                    dex_path,
                }),
                DexOwner::Secondary(owner) => pending.push(PendingUse::Secondary {
                    owner: &owner.name,
                    dex_path,
                    user_id: caller.user_id(),
                    class_loader_context: context,
                    abi_name,
                }),
                DexOwner::DontRecord | DexOwner::Unknown => {
                    tracing::debug!(
                        loading_package,
                        dex_path = %dex_path,
                        "ignoring dex load outside any tracked location"
                    );
                }
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let loader = DexLoader::new(loading_package, caller.is_isolated());
        let now = inner.clock.now_ms();
        {
            let mut state = inner.lock_state();
            let mut changed = false;
            for item in pending {
                changed |= inner.apply(&mut state.dex_use, &loader, item, now);
            }
            if changed {
                state.revision += 1;
            }
        }
        self.schedule_save();
        Ok(())
    }

    pub fn primary_dex_loaders(&self, owner: &str, dex_path: &str) -> BTreeSet<DexLoader> {
        let state = self.inner.lock_state();
        state
            .dex_use
            .packages
            .get(owner)
            .and_then(|pkg| pkg.primary.get(dex_path))
            .map(|dex| dex.records.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_primary_dex_used_by_other_apps(&self, owner: &str, dex_path: &str) -> bool {
        is_used_by_other_apps(&self.primary_dex_loaders(owner, dex_path), owner)
    }

    /// Every tracked secondary dex file of `owner`, unfiltered.
    pub fn secondary_dex_info(&self, owner: &str) -> Vec<SecondaryDexInfo> {
        self.secondary_entries(owner)
            .into_iter()
            .map(|(path, dex)| secondary_info(owner, path, &dex, |_| true))
            .collect()
    }

    /// Secondary dex files of `owner`, re-checked against the file system.
    ///
    /// With `exclude_obsolete`, missing files are dropped and files that are no longer readable
    /// by other apps only keep loaders running as the owner itself.
    pub fn checked_secondary_dex_info(
        &self,
        owner: &str,
        exclude_obsolete: bool,
    ) -> Vec<CheckedSecondaryDexInfo> {
        let mut checked = Vec::new();
        for (path, dex) in self.secondary_entries(owner) {
            let visibility = self.inner.visibility(&path);
            if exclude_obsolete && visibility == FileVisibility::NotFound {
                continue;
            }
            let info = if exclude_obsolete && visibility != FileVisibility::WorldReadable {
                let info = secondary_info(owner, path, &dex, |loader| {
                    !is_loader_other_app(loader, owner)
                });
                if info.loaders.is_empty() {
                    continue;
                }
                info
            } else {
                secondary_info(owner, path, &dex, |_| true)
            };
            checked.push(CheckedSecondaryDexInfo {
                info,
                file_visibility: visibility,
            });
        }
        checked
    }

    /// Raw context most recently reported by `loader` for a secondary dex file.
    pub fn secondary_class_loader_context(
        &self,
        owner: &str,
        dex_path: &str,
        loader: &DexLoader,
    ) -> Option<String> {
        let state = self.inner.lock_state();
        state
            .dex_use
            .packages
            .get(owner)?
            .secondary
            .get(dex_path)?
            .records
            .get(loader)
            .map(|record| record.class_loader_context.clone())
    }

    /// Most recent load of any of `owner`'s own APKs, or `None` if they were never loaded.
    pub fn package_last_used_at_ms(&self, owner: &str) -> Option<u64> {
        let state = self.inner.lock_state();
        state
            .dex_use
            .packages
            .get(owner)?
            .primary
            .values()
            .flat_map(|dex| dex.records.values())
            .map(|record| record.last_used_at_ms)
            .max()
    }

    /// Drops everything that refers to files or packages that no longer exist.
    pub fn cleanup(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.mode == StoreMode::Staged {
            return Err(DexoptError::illegal(
                "dex use cleanup is not allowed while an update is staged",
            ));
        }
        let snapshot = inner.inventory.snapshot();
        let tracked: Vec<(String, DexKind, String)> = {
            let state = inner.lock_state();
            state
                .dex_use
                .packages
                .iter()
                .filter(|(owner, _)| snapshot.package_state(owner).is_some())
                .flat_map(|(owner, pkg)| {
                    let primary = pkg
                        .primary
                        .keys()
                        .map(move |path| (owner.clone(), DexKind::Primary, path.clone()));
                    let secondary = pkg
                        .secondary
                        .keys()
                        .map(move |path| (owner.clone(), DexKind::Secondary, path.clone()));
                    primary.chain(secondary)
                })
                .collect()
        };
        let mut gone: BTreeSet<(String, DexKind, String)> = BTreeSet::new();
        for (owner, kind, path) in tracked {
            let split_removed = kind == DexKind::Primary
                && !snapshot
                    .package_state(&owner)
                    .is_some_and(|pkg| pkg.is_split_path(&path));
            if split_removed || inner.visibility(&path) == FileVisibility::NotFound {
                gone.insert((owner, kind, path));
            }
        }

        let changed = {
            let mut state = inner.lock_state();
            let before = state.dex_use.clone();
            let packages = &mut state.dex_use.packages;
            packages.retain(|owner, _| snapshot.package_state(owner).is_some());
            let installed = |loader: &DexLoader| {
                snapshot
                    .package_state(&loader.loading_package_name)
                    .is_some()
            };
            for (owner, pkg) in packages.iter_mut() {
                pkg.primary.retain(|path, dex| {
                    if gone.contains(&(owner.clone(), DexKind::Primary, path.clone())) {
                        return false;
                    }
                    dex.records.retain(|loader, _| installed(loader));
                    !dex.records.is_empty()
                });
                pkg.secondary.retain(|path, dex| {
                    if gone.contains(&(owner.clone(), DexKind::Secondary, path.clone())) {
                        return false;
                    }
                    dex.records.retain(|loader, _| installed(loader));
                    !dex.records.is_empty()
                });
            }
            packages.retain(|_, pkg| !pkg.is_empty());
            let changed = state.dex_use != before;
            if changed {
                state.revision += 1;
            }
            changed
        };
        if changed {
            tracing::debug!("dex use ledger cleaned up");
            self.schedule_save();
        }
        Ok(())
    }

    /// Renders the ledger in its persisted form.
    pub fn dump(&self) -> Result<String> {
        let bytes = self.inner.lock_state().dex_use.to_json()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Flushes pending changes synchronously. Called when the device shuts down.
    pub fn on_shutdown(&self) {
        if let Some(debouncer) = &self.debouncer {
            debouncer.cancel();
        }
        self.inner.save_logged();
    }

    fn schedule_save(&self) {
        if let Some(debouncer) = &self.debouncer {
            debouncer.schedule();
        }
    }

    fn secondary_entries(&self, owner: &str) -> Vec<(String, SecondaryDexUse)> {
        let state = self.inner.lock_state();
        state
            .dex_use
            .packages
            .get(owner)
            .map(|pkg| {
                pkg.secondary
                    .iter()
                    .map(|(path, dex)| (path.clone(), dex.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl StoreInner {
    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn visibility(&self, path: &str) -> FileVisibility {
        match self.compiler.file_visibility(path) {
            Ok(visibility) => visibility,
            Err(err) => {
                tracing::warn!(dex_path = path, %err, "failed to check dex file visibility");
                FileVisibility::NotFound
            }
        }
    }

    /// Applies one mutation. Returns whether the ledger changed.
    fn apply(
        &self,
        dex_use: &mut DexUse,
        loader: &DexLoader,
        item: PendingUse<'_>,
        now: u64,
    ) -> bool {
        match item {
            PendingUse::Primary { owner, dex_path } => {
                let pkg = dex_use.packages.entry(owner.to_string()).or_default();
                pkg.primary
                    .entry(dex_path.to_string())
                    .or_insert_with(PrimaryDexUse::default)
                    .records
                    .insert(
                        loader.clone(),
                        PrimaryRecord {
                            last_used_at_ms: now,
                        },
                    );
                true
            }
            PendingUse::Secondary {
                owner,
                dex_path,
                user_id,
                class_loader_context,
                abi_name,
            } => {
                let pkg = dex_use.packages.entry(owner.to_string()).or_default();
                let reported = ClassLoaderContext::from_reported(class_loader_context);
                let record = SecondaryRecord {
                    class_loader_context: class_loader_context.to_string(),
                    abi_name: abi_name.to_string(),
                    last_used_at_ms: now,
                };
                if let Some(dex) = pkg.secondary.get_mut(dex_path) {
                    let current = std::mem::replace(
                        &mut dex.class_loader_context,
                        ClassLoaderContext::Varying,
                    );
                    dex.class_loader_context = current.merge(reported);
                    dex.records.insert(loader.clone(), record);
                    return true;
                }
                if pkg.secondary.len() >= self.config.max_secondary_dex_files_per_owner {
                    tracing::debug!(
                        package = owner,
                        dex_path,
                        "secondary dex limit reached, not tracking new file"
                    );
                    if pkg.is_empty() {
                        dex_use.packages.remove(owner);
                    }
                    return false;
                }
                pkg.secondary.insert(
                    dex_path.to_string(),
                    SecondaryDexUse {
                        user_id,
                        class_loader_context: reported,
                        records: BTreeMap::from([(loader.clone(), record)]),
                    },
                );
                true
            }
        }
    }

    fn save_logged(&self) {
        if let Err(err) = self.save() {
            tracing::error!(%err, "failed to save dex use ledger");
        }
    }

    fn save(&self) -> Result<()> {
        if self.mode == StoreMode::Staged {
            return Ok(());
        }
        let _serialized = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (revision, bytes) = {
            let state = self.lock_state();
            if state.revision == state.committed {
                return Ok(());
            }
            (state.revision, state.dex_use.to_json()?)
        };
        self.persistence.save(&bytes)?;
        let mut state = self.lock_state();
        state.committed = state.committed.max(revision);
        tracing::debug!(revision, "dex use ledger saved");
        Ok(())
    }
}

fn load_ledger(config: &DexUseConfig, persistence: &dyn PersistenceBackend) -> DexUse {
    let rules = LoadRules {
        max_path_length: config.max_path_length,
        native_abis: &config.native_abis,
    };
    match persistence.load() {
        Ok(Some(bytes)) => DexUse::from_json(&bytes, &rules).unwrap_or_else(|err| {
            tracing::warn!(%err, "discarding unreadable dex use ledger");
            DexUse::default()
        }),
        Ok(None) => DexUse::default(),
        Err(err) => {
            tracing::warn!(%err, "failed to load dex use ledger");
            DexUse::default()
        }
    }
}

fn secondary_info(
    owner: &str,
    dex_path: String,
    dex: &SecondaryDexUse,
    keep: impl Fn(&DexLoader) -> bool,
) -> SecondaryDexInfo {
    let kept: Vec<(&DexLoader, &SecondaryRecord)> =
        dex.records.iter().filter(|(loader, _)| keep(loader)).collect();
    let loaders: BTreeSet<DexLoader> = kept.iter().map(|(loader, _)| (*loader).clone()).collect();
    SecondaryDexInfo {
        dex_path,
        user_id: dex.user_id,
        class_loader_context: dex.class_loader_context.clone(),
        abi_names: kept
            .iter()
            .map(|(_, record)| record.abi_name.clone())
            .collect(),
        is_used_by_other_apps: is_used_by_other_apps(&loaders, owner),
        loaders,
    }
}
