//! Collaborators for read-only inspection. Nothing here compiles, schedules, or probes the device.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use dexopt_core::{
    CancellationSignal, Clock, CompilerDriver, Effects, FilePersistence, JobScheduler, JobSpec,
    PreRebootDriver, RunId, ScheduleResult, StaticInventory, StorageProbe, UnsetRemoteFlags,
};
use dexopt_domain::{
    DexoptParams, FileVisibility, OtaSlot, PackageDexoptResult, PackageSnapshot, PackageState,
    PreRebootResult,
};

/// A clock stuck at one instant, for reproducible plans.
#[derive(Debug, Clone, Copy)]
pub struct PinnedClock(pub u64);

impl Clock for PinnedClock {
    fn now_ms(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
struct Offline;

impl CompilerDriver for Offline {
    fn dexopt(
        &self,
        package: &PackageState,
        _params: &DexoptParams,
        _cancel: &CancellationSignal,
    ) -> Result<PackageDexoptResult> {
        bail!("cannot compile {} while offline", package.name)
    }

    fn file_visibility(&self, path: &str) -> Result<FileVisibility> {
        bail!("cannot check visibility of {path} while offline")
    }

    fn merge_profiles(&self, _inputs: &[String], output: &str) -> Result<bool> {
        bail!("cannot merge profiles into {output} while offline")
    }
}

impl PreRebootDriver for Offline {
    fn run(
        &self,
        _ota_slot: Option<OtaSlot>,
        _legacy_map_snapshots: bool,
        _cancel: &CancellationSignal,
    ) -> Result<PreRebootResult> {
        bail!("pre-reboot dexopt is unavailable offline")
    }

    fn clean_up_staged_files(&self) -> Result<()> {
        Ok(())
    }
}

impl JobScheduler for Offline {
    fn schedule(&self, _spec: &JobSpec) -> ScheduleResult {
        ScheduleResult::Failure
    }

    fn cancel(&self, _job_id: u32) {}

    fn pending_job(&self, _job_id: u32) -> Option<JobSpec> {
        None
    }

    fn job_finished(&self, _job_id: u32, _ticket: RunId, _wants_reschedule: bool) {}
}

impl StorageProbe for Offline {
    fn allocatable_bytes(&self) -> Result<u64> {
        bail!("storage is not probed offline")
    }
}

/// Effects reading the ledger at `ledger` and serving `snapshot` as the inventory.
pub fn effects(ledger: &Path, snapshot: PackageSnapshot, clock: Arc<dyn Clock>) -> Effects {
    let offline = Arc::new(Offline);
    Effects {
        compiler: offline.clone(),
        pre_reboot: offline.clone(),
        inventory: Arc::new(StaticInventory::new(snapshot)),
        persistence: Arc::new(FilePersistence::new(ledger)),
        jobs: offline.clone(),
        storage: offline,
        clock,
        flags: Arc::new(UnsetRemoteFlags),
    }
}
