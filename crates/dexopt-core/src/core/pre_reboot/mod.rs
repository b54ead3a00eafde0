//! Single-flight controller for the pre-reboot dexopt job.
//!
//! Every decision compares run tokens under one mutex. The driver call itself runs on a
//! dedicated thread without the lock, so stop and update-ready signals can always supersede
//! it. A run that is no longer `current_run` finishes silently.

mod state;


use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use anyhow::{Context, Result};
use dexopt_domain::OtaSlot;
use tracing::{debug, error, info, warn};

use crate::core::cancel::CancellationSignal;
use crate::core::config::PreRebootConfig;
use crate::core::effects::{Effects, JobScheduler, PreRebootDriver, RemoteFlags, ScheduleResult};
use crate::core::error::DexoptError;
use crate::core::tooling::timings::{Stopwatch, Timed};
use state::{InFlight, JobState, Phase};

pub use state::{JobSpec, RunId, PRE_REBOOT_JOB_ID};

const ENABLE_FLAG: &str = "enable_pr_dexopt";
const KILL_SWITCH_FLAG: &str = "force_disable_pr_dexopt";

/// Result of an update-ready request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Success,
    DisabledBySetting,
    JobSchedulerFailure,
}

struct Shared {
    state: Mutex<JobState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, JobState>) -> MutexGuard<'a, JobState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completes when one particular run has exited.
pub struct JobFuture {
    shared: Arc<Shared>,
    id: RunId,
}

impl JobFuture {
    #[must_use]
    pub fn is_done(&self) -> bool {
        !self.shared.lock().is_in_flight(self.id)
    }

    pub fn wait(&self) {
        let mut state = self.shared.lock();
        while state.is_in_flight(self.id) {
            state = self.shared.wait(state);
        }
    }
}

pub struct PreRebootJob {
    config: PreRebootConfig,
    shared: Arc<Shared>,
    driver: Arc<dyn PreRebootDriver>,
    jobs: Arc<dyn JobScheduler>,
    flags: Arc<dyn RemoteFlags>,
}

impl PreRebootJob {
    pub fn new(config: PreRebootConfig, effects: &Effects) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(JobState::new()),
                changed: Condvar::new(),
            }),
            driver: Arc::clone(&effects.pre_reboot),
            jobs: Arc::clone(&effects.jobs),
            flags: Arc::clone(&effects.flags),
        }
    }

    /// Whether pre-reboot dexopt may run at all. The kill switch wins over every enable.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        if self.config.disable_bg_dexopt || self.flags.flag(KILL_SWITCH_FLAG) == Some(true) {
            return false;
        }
        self.config.enabled || self.flags.flag(ENABLE_FLAG) == Some(true)
    }

    /// Supersedes any previous request and schedules a job for the staged update.
    ///
    /// `ota_slot` is `None` for a Mainline update. A slot that conflicts with the one already
    /// established is `IllegalState` and changes nothing.
    pub fn on_update_ready(&self, ota_slot: Option<&str>) -> Result<ScheduleOutcome> {
        let slot = parse_slot(ota_slot)?;
        let mut state = self.shared.lock();
        if !self.is_enabled() {
            state = self.supersede_locked(state, None)?;
            self.reset_locked(&mut state);
            info!("pre-reboot dexopt is disabled");
            return Ok(ScheduleOutcome::DisabledBySetting);
        }
        check_slot(&state, slot)?;
        state = self.supersede_locked(state, slot)?;
        self.reset_locked(&mut state);
        establish_slot(&mut state, slot);
        state.map_snapshots_for_ota = state.ota_slot.is_some() && !self.config.update_engine_api;

        let ticket = state.mint();
        match self.jobs.schedule(&JobSpec::pre_reboot(ticket)) {
            ScheduleResult::Success => {
                state.phase = Phase::Scheduled { ticket };
                state.current_run = Some(ticket);
                info!(
                    ticket = %ticket,
                    ota_slot = ?state.ota_slot,
                    "pre-reboot dexopt job scheduled"
                );
                Ok(ScheduleOutcome::Success)
            }
            ScheduleResult::Failure => {
                error!(ticket = %ticket, "failed to schedule pre-reboot dexopt job");
                Ok(ScheduleOutcome::JobSchedulerFailure)
            }
        }
    }

    /// Called by the OS scheduler when the job may start. Returns whether a run was started.
    pub fn on_start_signal(&self, ticket: RunId) -> bool {
        let mut state = self.shared.lock();
        let pending = self
            .jobs
            .pending_job(PRE_REBOOT_JOB_ID)
            .is_some_and(|spec| spec.ticket == ticket);
        let live = state.phase.scheduled_ticket() == Some(ticket)
            && state.current_run == Some(ticket);
        if !pending || !live {
            debug!(ticket = %ticket, "ignoring start signal for a superseded job");
            return false;
        }
        match self.start_locked(&mut state, Some(ticket)) {
            Ok(run) => {
                info!(ticket = %ticket, run = %run, "pre-reboot dexopt job started");
                true
            }
            Err(err) => {
                error!(ticket = %ticket, "{err:#}");
                self.jobs.job_finished(PRE_REBOOT_JOB_ID, ticket, false);
                false
            }
        }
    }

    /// Called by the OS scheduler when the job must stop. Only the live run is cancelled.
    pub fn on_stop_signal(&self, ticket: RunId) {
        let mut state = self.shared.lock();
        let target = state
            .in_flight
            .as_ref()
            .filter(|flight| flight.started_by == Some(ticket))
            .map(|flight| (flight.id, flight.cancel.clone()));
        match target {
            Some((run, cancel)) if state.current_run == Some(run) => {
                cancel.cancel();
                state.phase = Phase::CancelRequested { run };
                info!(ticket = %ticket, run = %run, "pre-reboot dexopt job stop requested");
            }
            _ => debug!(ticket = %ticket, "ignoring stop signal for a superseded job"),
        }
    }

    /// Starts a run immediately, bypassing the OS scheduler.
    ///
    /// Returns `None` when disabled. `engine_ready` tells whether the update engine already
    /// mapped the snapshot devices.
    pub fn on_update_ready_start_now(
        &self,
        ota_slot: Option<&str>,
        engine_ready: bool,
    ) -> Result<Option<JobFuture>> {
        let slot = parse_slot(ota_slot)?;
        let mut state = self.shared.lock();
        if !self.is_enabled() {
            debug!("pre-reboot dexopt is disabled, not starting");
            return Ok(None);
        }
        check_slot(&state, slot)?;
        state = self.supersede_locked(state, slot)?;
        self.reset_locked(&mut state);
        establish_slot(&mut state, slot);
        state.map_snapshots_for_ota =
            state.ota_slot.is_some() && !engine_ready && !self.config.update_engine_api;
        let id = self.start_locked(&mut state, None)?;
        info!(run = %id, ota_slot = ?state.ota_slot, "pre-reboot dexopt started immediately");
        Ok(Some(JobFuture {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }

    /// Cancels the run behind `future` and blocks until it has exited.
    ///
    /// An interruption (see [`Self::interrupt_waiters`]) ends the wait early only when
    /// `expect_interrupt` is set.
    pub fn cancel_given(&self, future: &JobFuture, expect_interrupt: bool) {
        let mut state = self.shared.lock();
        let target = state
            .in_flight
            .as_ref()
            .filter(|flight| flight.id == future.id)
            .map(|flight| flight.cancel.clone());
        if let Some(cancel) = target {
            cancel.cancel();
            if state.current_run == Some(future.id) {
                state.phase = Phase::CancelRequested { run: future.id };
            }
        }
        let mut seen = state.interrupt_epoch;
        while state.is_in_flight(future.id) {
            state = self.shared.wait(state);
            if state.interrupt_epoch != seen {
                seen = state.interrupt_epoch;
                if expect_interrupt {
                    debug!(run = %future.id, "wait for cancelled run interrupted");
                    return;
                }
                error!(
                    run = %future.id,
                    "interrupted while waiting for pre-reboot dexopt to exit, still waiting"
                );
            }
        }
    }

    /// Unschedules the pending job and waits until no run is in flight.
    pub fn cancel_any(&self) {
        let state = self.shared.lock();
        // Without a requested slot there is nothing to conflict with.
        drop(self.supersede_locked(state, None));
    }

    #[must_use]
    pub fn has_running_job(&self) -> bool {
        self.shared.lock().in_flight.is_some()
    }

    pub fn wait_for_running_job(&self) {
        let mut state = self.shared.lock();
        while state.in_flight.is_some() {
            state = self.shared.wait(state);
        }
    }

    /// Wakes every blocked `cancel_given` caller as if its thread had been interrupted.
    pub fn interrupt_waiters(&self) {
        let mut state = self.shared.lock();
        state.interrupt_epoch += 1;
        self.shared.changed.notify_all();
    }

    /// Unschedules the pending job and waits for the in-flight run to exit.
    ///
    /// The lock is released while waiting, so `requested` is checked against the
    /// established slot again before every change. A conflict leaves the state as the
    /// winning caller set it.
    fn supersede_locked<'a>(
        &'a self,
        mut state: MutexGuard<'a, JobState>,
        requested: Option<OtaSlot>,
    ) -> Result<MutexGuard<'a, JobState>> {
        self.jobs.cancel(PRE_REBOOT_JOB_ID);
        loop {
            check_slot(&state, requested)?;
            state.current_run = None;
            let Some(flight) = state.in_flight.as_ref() else {
                break;
            };
            let run = flight.id;
            flight.cancel.cancel();
            state.phase = Phase::CancelRequested { run };
            debug!(run = %run, "waiting for superseded pre-reboot dexopt run to exit");
            state = self.shared.wait(state);
        }
        if let Some(run) = state.phase.active_run() {
            debug!(run = %run, "superseded pre-reboot dexopt run exited");
        }
        state.phase = Phase::Idle;
        Ok(state)
    }

    fn reset_locked(&self, state: &mut JobState) {
        if !state.has_started {
            return;
        }
        if let Err(err) = self.driver.clean_up_staged_files() {
            warn!("failed to clean up staged pre-reboot files: {err:#}");
        }
        state.has_started = false;
    }

    fn start_locked(&self, state: &mut JobState, started_by: Option<RunId>) -> Result<RunId> {
        let id = state.mint();
        let cancel = CancellationSignal::new();
        state.current_run = Some(id);
        state.phase = Phase::Running { run: id };
        state.in_flight = Some(InFlight {
            id,
            cancel: cancel.clone(),
            started_by,
        });

        let run = Run {
            id,
            ota_slot: state.ota_slot,
            legacy_map_snapshots: state.map_snapshots_for_ota,
            cancel,
            started_by,
            driver: Arc::clone(&self.driver),
            shared: Arc::clone(&self.shared),
            jobs: Arc::clone(&self.jobs),
        };
        let spawned = thread::Builder::new()
            .name("pre-reboot-dexopt".to_string())
            .spawn(move || run.execute());
        match spawned {
            Ok(_) => {
                state.has_started = true;
                Ok(id)
            }
            Err(err) => {
                state.in_flight = None;
                state.current_run = None;
                state.phase = Phase::Idle;
                Err(err).context("failed to spawn pre-reboot dexopt thread")
            }
        }
    }
}

fn parse_slot(ota_slot: Option<&str>) -> Result<Option<OtaSlot>> {
    OtaSlot::parse_optional(ota_slot).map_err(|err| DexoptError::illegal(err.to_string()))
}

fn check_slot(state: &JobState, requested: Option<OtaSlot>) -> Result<()> {
    match (state.ota_slot, requested) {
        (Some(established), Some(requested)) if established != requested => {
            Err(DexoptError::illegal(format!(
                "OTA slot {requested} conflicts with already established slot {established}"
            )))
        }
        _ => Ok(()),
    }
}

fn establish_slot(state: &mut JobState, requested: Option<OtaSlot>) {
    if state.ota_slot.is_none() {
        state.ota_slot = requested;
    }
}

struct Run {
    id: RunId,
    ota_slot: Option<OtaSlot>,
    legacy_map_snapshots: bool,
    cancel: CancellationSignal,
    started_by: Option<RunId>,
    driver: Arc<dyn PreRebootDriver>,
    shared: Arc<Shared>,
    jobs: Arc<dyn JobScheduler>,
}

impl Run {
    fn execute(self) {
        let Run {
            id,
            ota_slot,
            legacy_map_snapshots,
            cancel,
            started_by,
            driver,
            shared,
            jobs,
        } = self;
        let guard = RunGuard {
            shared,
            jobs,
            id,
            started_by,
        };
        let stopwatch = Stopwatch::start(Timed::PreRebootRun);
        let outcome = driver.run(ota_slot, legacy_map_snapshots, &cancel);
        stopwatch.finish(cancel.is_cancelled());
        match outcome {
            Ok(result) => info!(
                run = %id,
                success = result.success,
                cancelled = cancel.is_cancelled(),
                "pre-reboot dexopt finished"
            ),
            Err(err) => error!(run = %id, "pre-reboot dexopt failed: {err:#}"),
        }
        drop(guard);
    }
}

/// Releases a run on every exit path, including a panicking driver.
struct RunGuard {
    shared: Arc<Shared>,
    jobs: Arc<dyn JobScheduler>,
    id: RunId,
    started_by: Option<RunId>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.is_in_flight(self.id) {
            state.in_flight = None;
        }
        if state.current_run == Some(self.id) {
            state.current_run = None;
            state.phase = Phase::Idle;
            if let Some(ticket) = self.started_by {
                self.jobs.job_finished(PRE_REBOOT_JOB_ID, ticket, false);
            }
        } else {
            debug!(run = %self.id, "dropping completion of a superseded run");
        }
        self.shared.changed.notify_all();
    }
}
