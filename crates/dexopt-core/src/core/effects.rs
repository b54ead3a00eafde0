//! Collaborator contracts consumed by the core components.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use dexopt_domain::{
    DexoptParams, FileVisibility, OtaSlot, PackageDexoptResult, PackageSnapshot, PackageState,
    PreRebootResult,
};

use crate::core::cancel::CancellationSignal;
use crate::core::pre_reboot::{JobSpec, RunId};

pub trait CompilerDriver: Send + Sync {
    /// Compiles every dex file of `package`. Observes `cancel` cooperatively.
    fn dexopt(
        &self,
        package: &PackageState,
        params: &DexoptParams,
        cancel: &CancellationSignal,
    ) -> Result<PackageDexoptResult>;
    fn file_visibility(&self, path: &str) -> Result<FileVisibility>;
    fn merge_profiles(&self, inputs: &[String], output: &str) -> Result<bool>;
}

pub trait PreRebootDriver: Send + Sync {
    fn run(
        &self,
        ota_slot: Option<OtaSlot>,
        legacy_map_snapshots: bool,
        cancel: &CancellationSignal,
    ) -> Result<PreRebootResult>;
    fn clean_up_staged_files(&self) -> Result<()>;
}

pub trait PackageInventory: Send + Sync {
    fn snapshot(&self) -> Arc<PackageSnapshot>;
}

pub trait PersistenceBackend: Send + Sync {
    /// Returns `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Vec<u8>>>;
    /// Replaces the stored blob atomically.
    fn save(&self, bytes: &[u8]) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleResult {
    Success,
    Failure,
}

/// The OS job scheduler. Implementations must not call back into the caller synchronously.
pub trait JobScheduler: Send + Sync {
    fn schedule(&self, spec: &JobSpec) -> ScheduleResult;
    fn cancel(&self, job_id: u32);
    fn pending_job(&self, job_id: u32) -> Option<JobSpec>;
    fn job_finished(&self, job_id: u32, ticket: RunId, wants_reschedule: bool);
}

pub trait StorageProbe: Send + Sync {
    fn allocatable_bytes(&self) -> Result<u64>;
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub trait RemoteFlags: Send + Sync {
    fn flag(&self, name: &str) -> Option<bool>;
}

/// Every collaborator, shared by the components built from it.
#[derive(Clone)]
pub struct Effects {
    pub compiler: Arc<dyn CompilerDriver>,
    pub pre_reboot: Arc<dyn PreRebootDriver>,
    pub inventory: Arc<dyn PackageInventory>,
    pub persistence: Arc<dyn PersistenceBackend>,
    pub jobs: Arc<dyn JobScheduler>,
    pub storage: Arc<dyn StorageProbe>,
    pub clock: Arc<dyn Clock>,
    pub flags: Arc<dyn RemoteFlags>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| {
                u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
            })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnsetRemoteFlags;

impl RemoteFlags for UnsetRemoteFlags {
    fn flag(&self, _name: &str) -> Option<bool> {
        None
    }
}

/// An inventory whose snapshot is replaced wholesale.
#[derive(Debug, Default)]
pub struct StaticInventory {
    current: RwLock<Arc<PackageSnapshot>>,
}

impl StaticInventory {
    pub fn new(snapshot: PackageSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn replace(&self, snapshot: PackageSnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }
}

impl PackageInventory for StaticInventory {
    fn snapshot(&self) -> Arc<PackageSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Stores the ledger in one file, replaced through a temporary sibling.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistenceBackend for FilePersistence {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Keeps the last saved blob in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    blob: Mutex<Option<Vec<u8>>>,
    saves: Mutex<usize>,
}

impl MemoryPersistence {
    pub fn with_contents(bytes: Vec<u8>) -> Self {
        Self {
            blob: Mutex::new(Some(bytes)),
            saves: Mutex::new(0),
        }
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.blob
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistenceBackend for MemoryPersistence {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.contents())
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        *self.blob.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes.to_vec());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_persistence_round_trips_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilePersistence::new(dir.path().join("nested").join("ledger.json"));
        assert!(backend.load().unwrap().is_none());
        backend.save(b"{\"version\":1}").unwrap();
        backend.save(b"{\"version\":1,\"packages\":{}}").unwrap();
        assert_eq!(
            backend.load().unwrap().as_deref(),
            Some(&b"{\"version\":1,\"packages\":{}}"[..])
        );
    }

    #[test]
    fn static_inventory_hands_out_latest_snapshot() {
        let inventory = StaticInventory::new(PackageSnapshot::default());
        let before = inventory.snapshot();
        inventory.replace(PackageSnapshot::new([PackageState::new("a")]));
        assert!(before.package_state("a").is_none());
        assert!(inventory.snapshot().package_state("a").is_some());
    }
}
