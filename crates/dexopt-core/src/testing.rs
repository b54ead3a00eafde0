//! In-memory collaborators for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use dexopt_domain::{
    CompilerFilter, DexFileDexoptResult, DexoptParams, DexoptReason, DexoptStatus, FileVisibility,
    OtaSlot, PackageDexoptResult, PackageSnapshot, PackageState, PreRebootResult,
};

use crate::{
    CancellationSignal, Clock, CompilerDriver, Effects, JobScheduler, JobSpec, MemoryPersistence,
    PreRebootDriver, RemoteFlags, RunId, ScheduleResult, StaticInventory, StorageProbe,
};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A package with a base APK under `/data/app/<name>/`.
pub fn package(name: &str) -> PackageState {
    PackageState::new(name).with_base_apk(format!("/data/app/{name}/base.apk"))
}

pub fn base_apk(name: &str) -> String {
    format!("/data/app/{name}/base.apk")
}

#[derive(Debug)]
pub struct FixedClock {
    now: AtomicU64,
}

impl FixedClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: u64) {
        self.now.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// One `dexopt` invocation seen by [`FakeCompiler`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DexoptCall {
    pub package: String,
    pub reason: DexoptReason,
    pub compiler_filter: CompilerFilter,
    pub force_merge_profile: bool,
}

#[derive(Clone, Copy, Debug)]
enum Behavior {
    Fail,
    /// Reports a skipped profile-guided file unless profiles are force-merged.
    SkipWithProfile,
    CancelSignal,
}

#[derive(Debug)]
pub struct FakeCompiler {
    visibility: Mutex<HashMap<String, FileVisibility>>,
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<DexoptCall>>,
}

impl Default for FakeCompiler {
    fn default() -> Self {
        Self {
            visibility: Mutex::new(HashMap::new()),
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeCompiler {
    /// Unlisted paths are world-readable.
    pub fn set_visibility(&self, path: &str, visibility: FileVisibility) {
        lock(&self.visibility).insert(path.to_string(), visibility);
    }

    pub fn fail(&self, package: &str) {
        lock(&self.behaviors).insert(package.to_string(), Behavior::Fail);
    }

    pub fn skip_with_profile(&self, package: &str) {
        lock(&self.behaviors).insert(package.to_string(), Behavior::SkipWithProfile);
    }

    /// Cancels the run's signal while compiling `package`.
    pub fn cancel_during(&self, package: &str) {
        lock(&self.behaviors).insert(package.to_string(), Behavior::CancelSignal);
    }

    pub fn calls(&self) -> Vec<DexoptCall> {
        lock(&self.calls).clone()
    }

    pub fn compiled_packages(&self, reason: DexoptReason) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.reason == reason)
            .map(|call| call.package.clone())
            .collect()
    }
}

impl CompilerDriver for FakeCompiler {
    fn dexopt(
        &self,
        package: &PackageState,
        params: &DexoptParams,
        cancel: &CancellationSignal,
    ) -> Result<PackageDexoptResult> {
        lock(&self.calls).push(DexoptCall {
            package: package.name.clone(),
            reason: params.reason,
            compiler_filter: params.compiler_filter,
            force_merge_profile: params.force_merge_profile,
        });
        let behavior = lock(&self.behaviors).get(&package.name).copied();
        let (status, filter) = match behavior {
            Some(Behavior::Fail) => return Err(anyhow!("dex2oat crashed for {}", package.name)),
            Some(Behavior::SkipWithProfile) if !params.force_merge_profile => {
                (DexoptStatus::Skipped, CompilerFilter::SpeedProfile)
            }
            Some(Behavior::CancelSignal) => {
                cancel.cancel();
                (DexoptStatus::Cancelled, params.compiler_filter)
            }
            _ => (DexoptStatus::Performed, params.compiler_filter),
        };
        let files = package
            .splits
            .iter()
            .map(|split| DexFileDexoptResult {
                dex_path: split.path.clone(),
                abi: package.primary_abi.clone().unwrap_or_else(|| "arm64-v8a".into()),
                actual_compiler_filter: filter,
                status,
                wall_time_ms: 1,
                size_bytes: 100,
                size_before_bytes: 0,
            })
            .collect();
        Ok(PackageDexoptResult::from_files(package.name.clone(), files))
    }

    fn file_visibility(&self, path: &str) -> Result<FileVisibility> {
        Ok(lock(&self.visibility)
            .get(path)
            .copied()
            .unwrap_or(FileVisibility::WorldReadable))
    }

    fn merge_profiles(&self, inputs: &[String], _output: &str) -> Result<bool> {
        Ok(!inputs.is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverMode {
    Succeed,
    /// Blocks until the run is cancelled.
    BlockUntilCancelled,
    /// Ignores cancellation and blocks until [`FakePreRebootDriver::release`].
    Hold,
    Fail,
    Panic,
}

/// One pre-reboot run seen by [`FakePreRebootDriver`].
#[derive(Clone, Debug)]
pub struct DriverRun {
    pub ota_slot: Option<OtaSlot>,
    pub legacy_map_snapshots: bool,
    pub cancel: CancellationSignal,
}

#[derive(Debug)]
pub struct FakePreRebootDriver {
    mode: Mutex<DriverMode>,
    runs: Mutex<Vec<DriverRun>>,
    ran: Condvar,
    released: Mutex<bool>,
    release_changed: Condvar,
    cleanups: AtomicU64,
}

impl FakePreRebootDriver {
    pub fn new(mode: DriverMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            runs: Mutex::new(Vec::new()),
            ran: Condvar::new(),
            released: Mutex::new(false),
            release_changed: Condvar::new(),
            cleanups: AtomicU64::new(0),
        }
    }

    pub fn set_mode(&self, mode: DriverMode) {
        *lock(&self.mode) = mode;
    }

    /// Lets every held run return.
    pub fn release(&self) {
        *lock(&self.released) = true;
        self.release_changed.notify_all();
    }

    pub fn runs(&self) -> Vec<DriverRun> {
        lock(&self.runs).clone()
    }

    pub fn cleanups(&self) -> u64 {
        self.cleanups.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` runs have entered the driver.
    pub fn wait_for_runs(&self, count: usize) -> bool {
        let deadline = Instant::now() + WAIT_LIMIT;
        let mut runs = lock(&self.runs);
        while runs.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            runs = self
                .ran
                .wait_timeout(runs, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl PreRebootDriver for FakePreRebootDriver {
    fn run(
        &self,
        ota_slot: Option<OtaSlot>,
        legacy_map_snapshots: bool,
        cancel: &CancellationSignal,
    ) -> Result<PreRebootResult> {
        let mode = *lock(&self.mode);
        {
            let mut runs = lock(&self.runs);
            runs.push(DriverRun {
                ota_slot,
                legacy_map_snapshots,
                cancel: cancel.clone(),
            });
            self.ran.notify_all();
        }
        match mode {
            DriverMode::Succeed => Ok(PreRebootResult { success: true }),
            DriverMode::BlockUntilCancelled => {
                let cancelled = cancel.wait_timeout(WAIT_LIMIT);
                Ok(PreRebootResult { success: cancelled })
            }
            DriverMode::Hold => {
                let deadline = Instant::now() + WAIT_LIMIT;
                let mut released = lock(&self.released);
                while !*released && Instant::now() < deadline {
                    released = self
                        .release_changed
                        .wait_timeout(released, deadline - Instant::now())
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                Ok(PreRebootResult { success: *released })
            }
            DriverMode::Fail => Err(anyhow!("chroot setup failed")),
            DriverMode::Panic => panic!("pre-reboot driver panicked"),
        }
    }

    fn clean_up_staged_files(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeJobScheduler {
    result: Mutex<ScheduleResult>,
    pending: Mutex<Option<JobSpec>>,
    scheduled: Mutex<Vec<JobSpec>>,
    finished: Mutex<Vec<RunId>>,
    cancels: AtomicU64,
}

impl Default for FakeJobScheduler {
    fn default() -> Self {
        Self {
            result: Mutex::new(ScheduleResult::Success),
            pending: Mutex::new(None),
            scheduled: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            cancels: AtomicU64::new(0),
        }
    }
}

impl FakeJobScheduler {
    pub fn set_result(&self, result: ScheduleResult) {
        *lock(&self.result) = result;
    }

    pub fn pending(&self) -> Option<JobSpec> {
        lock(&self.pending).clone()
    }

    pub fn scheduled(&self) -> Vec<JobSpec> {
        lock(&self.scheduled).clone()
    }

    pub fn finished(&self) -> Vec<RunId> {
        lock(&self.finished).clone()
    }

    pub fn cancels(&self) -> u64 {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl JobScheduler for FakeJobScheduler {
    fn schedule(&self, spec: &JobSpec) -> ScheduleResult {
        let result = *lock(&self.result);
        if result == ScheduleResult::Success {
            *lock(&self.pending) = Some(spec.clone());
            lock(&self.scheduled).push(spec.clone());
        }
        result
    }

    fn cancel(&self, job_id: u32) {
        let mut pending = lock(&self.pending);
        if pending.as_ref().is_some_and(|spec| spec.job_id == job_id) {
            *pending = None;
        }
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn pending_job(&self, job_id: u32) -> Option<JobSpec> {
        lock(&self.pending)
            .clone()
            .filter(|spec| spec.job_id == job_id)
    }

    fn job_finished(&self, job_id: u32, ticket: RunId, _wants_reschedule: bool) {
        let mut pending = lock(&self.pending);
        if pending
            .as_ref()
            .is_some_and(|spec| spec.job_id == job_id && spec.ticket == ticket)
        {
            *pending = None;
        }
        lock(&self.finished).push(ticket);
    }
}

#[derive(Debug)]
pub struct FakeStorage {
    allocatable: Mutex<Option<u64>>,
}

impl FakeStorage {
    pub fn new(allocatable_bytes: u64) -> Self {
        Self {
            allocatable: Mutex::new(Some(allocatable_bytes)),
        }
    }

    pub fn set(&self, allocatable_bytes: u64) {
        *lock(&self.allocatable) = Some(allocatable_bytes);
    }

    pub fn fail(&self) {
        *lock(&self.allocatable) = None;
    }
}

impl StorageProbe for FakeStorage {
    fn allocatable_bytes(&self) -> Result<u64> {
        (*lock(&self.allocatable)).ok_or_else(|| anyhow!("statfs failed"))
    }
}

#[derive(Debug, Default)]
pub struct FakeFlags {
    values: Mutex<BTreeMap<String, bool>>,
}

impl FakeFlags {
    pub fn set(&self, name: &str, value: bool) {
        lock(&self.values).insert(name.to_string(), value);
    }
}

impl RemoteFlags for FakeFlags {
    fn flag(&self, name: &str) -> Option<bool> {
        lock(&self.values).get(name).copied()
    }
}

/// Every fake, wired into one [`Effects`].
pub struct Fakes {
    pub compiler: Arc<FakeCompiler>,
    pub pre_reboot: Arc<FakePreRebootDriver>,
    pub inventory: Arc<StaticInventory>,
    pub persistence: Arc<MemoryPersistence>,
    pub jobs: Arc<FakeJobScheduler>,
    pub storage: Arc<FakeStorage>,
    pub clock: Arc<FixedClock>,
    pub flags: Arc<FakeFlags>,
}

impl Fakes {
    pub fn new(snapshot: PackageSnapshot) -> Self {
        Self {
            compiler: Arc::new(FakeCompiler::default()),
            pre_reboot: Arc::new(FakePreRebootDriver::new(DriverMode::Succeed)),
            inventory: Arc::new(StaticInventory::new(snapshot)),
            persistence: Arc::new(MemoryPersistence::default()),
            jobs: Arc::new(FakeJobScheduler::default()),
            storage: Arc::new(FakeStorage::new(u64::MAX)),
            clock: Arc::new(FixedClock::new(1_000)),
            flags: Arc::new(FakeFlags::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<PackageSnapshot> {
        crate::PackageInventory::snapshot(self.inventory.as_ref())
    }

    pub fn effects(&self) -> Effects {
        Effects {
            compiler: self.compiler.clone(),
            pre_reboot: self.pre_reboot.clone(),
            inventory: self.inventory.clone(),
            persistence: self.persistence.clone(),
            jobs: self.jobs.clone(),
            storage: self.storage.clone(),
            clock: self.clock.clone(),
            flags: self.flags.clone(),
        }
    }
}
