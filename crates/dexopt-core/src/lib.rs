#![deny(clippy::all, warnings)]

mod core;

#[cfg(test)]
pub mod testing;

pub use crate::core::batch::{BatchDexoptParams, BatchDexoptStartHook, BatchDexopter};
pub use crate::core::cancel::CancellationSignal;
pub use crate::core::config::{BatchConfig, Config, DexUseConfig, PreRebootConfig};
pub use crate::core::dex_use::{DexUseStore, StoreMode};
pub use crate::core::effects::{
    Clock, CompilerDriver, Effects, FilePersistence, JobScheduler, MemoryPersistence,
    PackageInventory, PersistenceBackend, PreRebootDriver, RemoteFlags, ScheduleResult,
    StaticInventory, StorageProbe, SystemClock, UnsetRemoteFlags,
};
pub use crate::core::error::DexoptError;
pub use crate::core::pre_reboot::{
    JobFuture, JobSpec, PreRebootJob, RunId, ScheduleOutcome, PRE_REBOOT_JOB_ID,
};
