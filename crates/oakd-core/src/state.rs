//! State shared between the pipeline thread, the watchdog thread and
//! the owning [`PipelineWorker`](crate::PipelineWorker).

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lifecycle of a worker as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    StopRequested,
    Stopped,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Running,
            1 => WorkerState::StopRequested,
            _ => WorkerState::Stopped,
        }
    }
}

/// Where the pipeline thread currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    SessionOpen,
    Draining,
    /// Failure threshold exceeded; waiting for the reconfigure action.
    Escalated,
    Stopping,
    Stopped,
}

impl WorkerPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerPhase::Idle,
            1 => WorkerPhase::SessionOpen,
            2 => WorkerPhase::Draining,
            3 => WorkerPhase::Escalated,
            4 => WorkerPhase::Stopping,
            _ => WorkerPhase::Stopped,
        }
    }
}

/// Reconfigure bookkeeping. Escalations are numbered so each one is served exactly once.
#[derive(Debug, Default)]
struct Escalation {
    needs_reconfigure: bool,
    requested: u64,
    completed: u64,
}

pub(crate) struct SharedState {
    state: AtomicU8,
    phase: AtomicU8,
    failures: AtomicU32,
    sessions_opened: AtomicU64,
    reconfigurations: AtomicU64,
    escalation: Mutex<Escalation>,
    changed: Condvar,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Running as u8),
            phase: AtomicU8::new(WorkerPhase::Idle as u8),
            failures: AtomicU32::new(0),
            sessions_opened: AtomicU64::new(0),
            reconfigurations: AtomicU64::new(0),
            escalation: Mutex::new(Escalation::default()),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Escalation> {
        self.escalation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.state() != WorkerState::Running
    }

    /// `Running → StopRequested`. Returns false if a stop was already requested.
    pub(crate) fn request_stop(&self) -> bool {
        let changed = self
            .state
            .compare_exchange(
                WorkerState::Running as u8,
                WorkerState::StopRequested as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        // Taking the lock orders this notify after any waiter's predicate check.
        let _guard = self.lock();
        self.changed.notify_all();
        changed
    }

    pub(crate) fn mark_stopped(&self) {
        self.state
            .store(WorkerState::Stopped as u8, Ordering::SeqCst);
        self.set_phase(WorkerPhase::Stopped);
    }

    pub(crate) fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn set_phase(&self, phase: WorkerPhase) {
        let previous = WorkerPhase::from_u8(self.phase.swap(phase as u8, Ordering::SeqCst));
        if previous != phase {
            tracing::debug!(from = ?previous, to = ?phase, "worker phase transition");
        }
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Count one failure and return the new total.
    pub(crate) fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reset the failure counter, returning the previous value.
    pub(crate) fn reset_failures(&self) -> u32 {
        self.failures.swap(0, Ordering::SeqCst)
    }

    pub(crate) fn record_session_opened(&self) -> u64 {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub(crate) fn reconfigurations(&self) -> u64 {
        self.reconfigurations.load(Ordering::SeqCst)
    }

    pub(crate) fn reconfigure_pending(&self) -> bool {
        self.lock().needs_reconfigure
    }

    /// Raise the reconfigure flag for a new escalation and return its number.
    pub(crate) fn escalate(&self) -> u64 {
        let mut esc = self.lock();
        esc.needs_reconfigure = true;
        esc.requested += 1;
        self.changed.notify_all();
        esc.requested
    }

    /// The escalation the watchdog still has to serve, if any.
    pub(crate) fn pending_escalation(&self) -> Option<u64> {
        let esc = self.lock();
        (esc.needs_reconfigure && esc.completed < esc.requested).then_some(esc.requested)
    }

    /// Mark `escalation` as served by a successful reconfigure action.
    pub(crate) fn complete_reconfigure(&self, escalation: u64) {
        let mut esc = self.lock();
        esc.completed = esc.completed.max(escalation);
        self.reconfigurations.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_all();
    }

    /// Lower the reconfigure flag. Returns whether it was set.
    pub(crate) fn clear_reconfigure_flag(&self) -> bool {
        std::mem::replace(&mut self.lock().needs_reconfigure, false)
    }

    /// Block until `escalation` has been served. Returns false if a stop was requested first.
    pub(crate) fn wait_for_reconfigure(&self, escalation: u64, poll: Duration) -> bool {
        let mut esc = self.lock();
        loop {
            if self.stop_requested() {
                return false;
            }
            if esc.completed >= escalation {
                return true;
            }
            esc = match self.changed.wait_timeout(esc, poll) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Sleep for one watchdog period. Returns false if a stop was requested.
    pub(crate) fn wait_tick(&self, period: Duration) -> bool {
        let guard = self.lock();
        let result = self
            .changed
            .wait_timeout_while(guard, period, |_| !self.stop_requested());
        drop(result);
        !self.stop_requested()
    }
}
