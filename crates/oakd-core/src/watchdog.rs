//! Supervisor watchdog: turns a raised reconfigure flag into a call to the
//! externally supplied reconfigure action.
//!
//! The watchdog ticks on a fixed period. It never clears the flag itself;
//! a successful action marks the current escalation as served, which
//! releases the pipeline thread to rebuild, and the pipeline thread lowers
//! the flag once a new session is open. A failed action is retried on the
//! next tick.

use crate::state::SharedState;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The reconfigure action. Runs on the watchdog thread.
pub type ReconfigureFn = Box<dyn FnMut() -> Result<(), BoxError> + Send>;

#[derive(Error, Debug)]
pub enum ReconfigureActionError {
    #[error("reconfigure action failed: {0}")]
    Failed(BoxError),
    #[error("reconfigure action panicked: {0}")]
    Panicked(String),
}

pub(crate) fn spawn_watchdog(
    shared: Arc<SharedState>,
    period: Duration,
    mut reconfigure: ReconfigureFn,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("oakd-watchdog".into())
        .spawn(move || {
            tracing::debug!(period_ms = period.as_millis() as u64, "starting watchdog");
            while shared.wait_tick(period) {
                tracing::trace!("checking if worker must be reconfigured");
                let Some(escalation) = shared.pending_escalation() else {
                    continue;
                };

                tracing::info!(escalation, "worker needs reconfiguring; running reconfigure action");
                match run_reconfigure(&mut reconfigure) {
                    Ok(()) => {
                        shared.complete_reconfigure(escalation);
                        tracing::info!(escalation, "reconfigure action completed");
                    }
                    Err(err) => {
                        tracing::error!(
                            escalation,
                            error = %err,
                            "reconfigure action failed; retrying on next tick"
                        );
                    }
                }
            }
            tracing::debug!("watchdog exiting");
        })
}

fn run_reconfigure(action: &mut ReconfigureFn) -> Result<(), ReconfigureActionError> {
    match panic::catch_unwind(AssertUnwindSafe(|| action())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ReconfigureActionError::Failed(err)),
        Err(payload) => Err(ReconfigureActionError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn counting_action(
        calls: Arc<AtomicU32>,
        mut outcome: impl FnMut(u32) -> Result<(), BoxError> + Send + 'static,
    ) -> ReconfigureFn {
        Box::new(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            outcome(n)
        })
    }

    #[test]
    fn test_no_escalation_no_action() {
        let shared = Arc::new(SharedState::new());
        let calls = Arc::new(AtomicU32::new(0));
        let handle = spawn_watchdog(
            Arc::clone(&shared),
            Duration::from_millis(2),
            counting_action(Arc::clone(&calls), |_| Ok(())),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        shared.request_stop();
        handle.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_escalation_served_exactly_once() {
        let shared = Arc::new(SharedState::new());
        let calls = Arc::new(AtomicU32::new(0));
        let handle = spawn_watchdog(
            Arc::clone(&shared),
            Duration::from_millis(2),
            counting_action(Arc::clone(&calls), |_| Ok(())),
        )
        .unwrap();

        let id = shared.escalate();
        assert!(shared.wait_for_reconfigure(id, Duration::from_secs(2)));
        // Flag is still raised; further ticks must not re-run the action.
        thread::sleep(Duration::from_millis(30));
        assert!(shared.reconfigure_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        shared.request_stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_failed_action_retried_next_tick() {
        let shared = Arc::new(SharedState::new());
        let calls = Arc::new(AtomicU32::new(0));
        let handle = spawn_watchdog(
            Arc::clone(&shared),
            Duration::from_millis(2),
            counting_action(Arc::clone(&calls), |n| {
                if n < 3 {
                    Err("device still enumerating".into())
                } else {
                    Ok(())
                }
            }),
        )
        .unwrap();

        let id = shared.escalate();
        assert!(shared.wait_for_reconfigure(id, Duration::from_secs(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(shared.reconfigurations(), 1);

        shared.request_stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_panicking_action_does_not_kill_watchdog() {
        let shared = Arc::new(SharedState::new());
        let calls = Arc::new(AtomicU32::new(0));
        let handle = spawn_watchdog(
            Arc::clone(&shared),
            Duration::from_millis(2),
            counting_action(Arc::clone(&calls), |n| {
                if n == 1 {
                    panic!("reconfigure blew up");
                }
                Ok(())
            }),
        )
        .unwrap();

        let id = shared.escalate();
        assert!(shared.wait_for_reconfigure(id, Duration::from_secs(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        shared.request_stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_interrupts_long_period() {
        let shared = Arc::new(SharedState::new());
        let calls = Arc::new(AtomicU32::new(0));
        let handle = spawn_watchdog(
            Arc::clone(&shared),
            Duration::from_secs(60),
            counting_action(calls, |_| Ok(())),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(10));
        let start = Instant::now();
        shared.request_stop();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
