//! One-shot deadline abort for in-flight worker requests.
//!
//! The platform kills the sandbox at its deadline with no recovery
//! opportunity, so the facade aborts the request one second early and lets
//! the application's error paths run. A single timer thread lives as long as
//! the facade. Arming hands it an absolute fire time; the transport then
//! points it at the connection it is about to read. On fire the thread sets
//! the fired flag and shuts the connection down underfoot, which unblocks the
//! read; the facade translates that failure into `DeadlineReached`.

use crate::error::Error;
use fpmlink_fcgi::client::ShutdownHandle;
use slog::{debug, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// When the one-shot abort fires, relative to now:
/// `max(1, floor(remaining_ms / 1000) - 1)` seconds, leaving the last second
/// for error handling before the platform pulls the plug.
pub fn arm_delay(remaining_ms: u64) -> Duration {
    Duration::from_secs((remaining_ms / 1000).saturating_sub(1).max(1))
}

struct TimerState {
    /// Absolute fire time while armed.
    fire_at: Option<Instant>,
    /// The connection to shut down when the timer fires.
    target: Option<ShutdownHandle>,
    thread_running: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
    fired: AtomicBool,
}

/// One-shot abort timer owned by the handler facade; the facade exists once
/// per process, so the timer thread does too.
pub struct DeadlineInterrupter {
    shared: Arc<Shared>,
    log: Logger,
}

impl DeadlineInterrupter {
    /// Spawn the timer thread.
    pub fn install(log: Logger) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                fire_at: None,
                target: None,
                thread_running: true,
                shutdown: false,
            }),
            cond: Condvar::new(),
            fired: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let thread_log = log.clone();
        thread::spawn(move || {
            timer_main(&thread_shared, &thread_log);
            thread_shared.state.lock().unwrap().thread_running = false;
        });
        DeadlineInterrupter { shared, log }
    }

    /// Arm the one-shot abort. Fails when the timer thread is gone, which is
    /// a misconfiguration the sandbox cannot serve through.
    pub fn enable(&self, remaining_ms: u64) -> Result<(), Error> {
        let delay = arm_delay(remaining_ms);
        let mut state = self.shared.state.lock().unwrap();
        if !state.thread_running {
            return Err(Error::InterrupterUnavailable);
        }
        debug!(self.log, "arming deadline abort"; "delay_secs" => delay.as_secs());
        self.shared.fired.store(false, Ordering::SeqCst);
        state.fire_at = Some(Instant::now() + delay);
        state.target = None;
        drop(state);
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Point the armed abort at a connection. If the timer already fired, the
    /// connection is shut down on the spot.
    pub fn watch(&self, handle: ShutdownHandle) {
        let mut state = self.shared.state.lock().unwrap();
        if self.shared.fired.load(Ordering::SeqCst) {
            drop(state);
            handle.shutdown();
            return;
        }
        state.target = Some(handle);
    }

    /// Whether the abort fired since the last `enable`.
    pub fn fired(&self) -> bool {
        self.shared.fired.load(Ordering::SeqCst)
    }

    /// Disarm. Idempotent, and safe before any `enable`, so a fresh facade
    /// can always reset first.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.fire_at = None;
        state.target = None;
        self.shared.fired.store(false, Ordering::SeqCst);
    }
}

impl Drop for DeadlineInterrupter {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.shutdown = true;
        }
        self.shared.cond.notify_one();
    }
}

fn timer_main(shared: &Shared, log: &Logger) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        match state.fire_at {
            None => {
                state = shared.cond.wait(state).unwrap();
            }
            Some(fire_at) => {
                let now = Instant::now();
                if now < fire_at {
                    // Re-check after waking: the invocation may have finished
                    // and disarmed, or the next one may have re-armed.
                    let (next, _) = shared.cond.wait_timeout(state, fire_at - now).unwrap();
                    state = next;
                    continue;
                }
                state.fire_at = None;
                let target = state.target.take();
                shared.fired.store(true, Ordering::SeqCst);
                debug!(log, "deadline abort fired");
                drop(state);
                if let Some(target) = target {
                    target.shutdown();
                }
                state = shared.state.lock().unwrap();
            }
        }
    }
}
