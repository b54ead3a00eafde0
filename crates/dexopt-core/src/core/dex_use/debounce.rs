use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

/// A one-shot timer that restarts on every `schedule` call.
///
/// The action runs on a dedicated thread once `delay` passes without another `schedule`.
/// It returns `false` when the timer should stop for good.
pub(crate) struct Debouncer {
    shared: Arc<Shared>,
    delay: Duration,
}

impl Debouncer {
    pub(crate) fn spawn<F>(name: &str, delay: Duration, action: F) -> Result<Self>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&worker, &action))
            .with_context(|| format!("failed to spawn {name} thread"))?;
        Ok(Self { shared, delay })
    }

    /// Cancels any pending deadline and starts a new one.
    pub(crate) fn schedule(&self) {
        let mut state = self.lock();
        state.deadline = Some(Instant::now() + self.delay);
        self.shared.changed.notify_all();
    }

    pub(crate) fn cancel(&self) {
        let mut state = self.lock();
        state.deadline = None;
        self.shared.changed.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.shutdown = true;
        state.deadline = None;
        self.shared.changed.notify_all();
    }
}

fn run(shared: &Shared, action: &dyn Fn() -> bool) {
    let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => {
                state = shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    state = shared
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                    continue;
                }
                state.deadline = None;
                drop(state);
                let keep_going = action();
                state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
                if !keep_going {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn rescheduling_coalesces_into_one_run() {
        let (tx, rx) = mpsc::channel();
        let debouncer = Debouncer::spawn("debounce-test", Duration::from_millis(50), move || {
            tx.send(()).is_ok()
        })
        .unwrap();
        for _ in 0..5 {
            debouncer.schedule();
        }
        rx.recv_timeout(Duration::from_secs(5)).expect("action ran");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn cancelled_deadline_never_fires() {
        let (tx, rx) = mpsc::channel();
        let debouncer = Debouncer::spawn("debounce-test", Duration::from_millis(20), move || {
            tx.send(()).is_ok()
        })
        .unwrap();
        debouncer.schedule();
        debouncer.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }
}
