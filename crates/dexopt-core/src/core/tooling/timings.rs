//! Opt-in wall-clock measurements, switched on by `DEXOPT_TIMINGS`.

use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use dexopt_domain::BatchPass;
use tracing::info;

use crate::core::config::settings::EnvSnapshot;

fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| EnvSnapshot::capture().flag_is_enabled("DEXOPT_TIMINGS"))
}

/// A unit of work worth measuring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Timed {
    Pass(BatchPass),
    PreRebootRun,
}

impl fmt::Display for Timed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass(pass) => write!(f, "batch:{pass}"),
            Self::PreRebootRun => f.write_str("pre-reboot-run"),
        }
    }
}

/// Measures one [`Timed`] unit. Nothing is reported unless [`Stopwatch::finish`] is called.
#[derive(Debug)]
pub(crate) struct Stopwatch {
    what: Timed,
    started: Option<Instant>,
}

impl Stopwatch {
    pub(crate) fn start(what: Timed) -> Self {
        Self {
            what,
            started: enabled().then(Instant::now),
        }
    }

    pub(crate) fn finish(self, cancelled: bool) {
        let Some(started) = self.started else {
            return;
        };
        info!(
            dexopt_timing = %self.what,
            elapsed_ms = whole_millis(started.elapsed()),
            cancelled,
            "timing"
        );
    }
}

fn whole_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
