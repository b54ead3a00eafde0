use std::fmt;
use std::time::Duration;

use dexopt_domain::OtaSlot;

use crate::core::cancel::CancellationSignal;

/// OS job id of the pre-reboot dexopt job.
pub const PRE_REBOOT_JOB_ID: u32 = 27_873_781;

const MIN_LATENCY: Duration = Duration::from_secs(10 * 60);

/// Token identifying one schedule request or one run. Never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(u64);

impl RunId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What gets registered with the OS job scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    pub job_id: u32,
    /// Handed back by the scheduler in start and stop signals.
    pub ticket: RunId,
    pub requires_device_idle: bool,
    pub requires_charging: bool,
    pub requires_battery_not_low: bool,
    pub min_latency: Duration,
}

impl JobSpec {
    pub(crate) fn pre_reboot(ticket: RunId) -> Self {
        Self {
            job_id: PRE_REBOOT_JOB_ID,
            ticket,
            requires_device_idle: true,
            requires_charging: true,
            requires_battery_not_low: true,
            min_latency: MIN_LATENCY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Scheduled { ticket: RunId },
    Running { run: RunId },
    CancelRequested { run: RunId },
}

impl Phase {
    pub(crate) fn scheduled_ticket(self) -> Option<RunId> {
        match self {
            Phase::Scheduled { ticket } => Some(ticket),
            _ => None,
        }
    }

    pub(crate) fn active_run(self) -> Option<RunId> {
        match self {
            Phase::Running { run } | Phase::CancelRequested { run } => Some(run),
            Phase::Idle | Phase::Scheduled { .. } => None,
        }
    }
}

pub(crate) struct InFlight {
    pub(crate) id: RunId,
    pub(crate) cancel: CancellationSignal,
    /// The schedule ticket that started this run, `None` for immediate starts.
    pub(crate) started_by: Option<RunId>,
}

pub(crate) struct JobState {
    pub(crate) phase: Phase,
    /// Fixed by the first OTA request; Mainline requests never clear it.
    pub(crate) ota_slot: Option<OtaSlot>,
    pub(crate) map_snapshots_for_ota: bool,
    /// The only token allowed to make progress. `None` invalidates everything in flight.
    pub(crate) current_run: Option<RunId>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) has_started: bool,
    pub(crate) interrupt_epoch: u64,
    next_id: u64,
}

impl JobState {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Idle,
            ota_slot: None,
            map_snapshots_for_ota: false,
            current_run: None,
            in_flight: None,
            has_started: false,
            interrupt_epoch: 0,
            next_id: 1,
        }
    }

    pub(crate) fn mint(&mut self) -> RunId {
        let id = RunId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn is_in_flight(&self, id: RunId) -> bool {
        self.in_flight.as_ref().is_some_and(|flight| flight.id == id)
    }
}
