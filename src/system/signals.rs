//! Cancellation of the running job from termination signals.
//!
//! The signal path is async-signal-safe: the installed handler only performs
//! atomic loads/stores and a `kill(2)` call. No allocation, no locks, no I/O.
//!
//! A [`CancelToken`] is armed by the supervisor with the pid of the primary
//! process while it runs. That process leads its own process group and the
//! termination signal goes to the whole group. [`SignalBridge`] publishes one token to the handler
//! for as long as the bridge is alive and restores the previous signal
//! dispositions on drop.

// The handler needs a raw pointer to the shared token state and `sigaction`
// is unsafe by nature; both are confined to this module.
#![allow(unsafe_code)]

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use tracing::{debug, instrument, warn};

/// Signals that cancel the running job.
pub const CANCEL_SIGNALS: [Signal; 6] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// No process is currently tracked.
const NO_PID: i32 = 0;

#[derive(Debug, Default)]
struct CancelState {
    /// Set once cancellation was requested, even with no process running.
    requested: AtomicBool,
    /// Pid of the primary process, or `NO_PID`.
    pid: AtomicI32,
    /// Number of termination signals actually delivered.
    delivered: AtomicU32,
    /// Last signal number that triggered a cancellation, 0 if none.
    last_signal: AtomicI32,
}

impl CancelState {
    /// Async-signal-safe cancellation.
    fn cancel(&self) -> bool {
        self.requested.store(true, Ordering::SeqCst);

        // Swap so concurrent or repeated requests terminate the process only once.
        let pid = self.pid.swap(NO_PID, Ordering::SeqCst);
        if pid <= NO_PID {
            return false;
        }

        if signal::kill(Pid::from_raw(-pid), Signal::SIGTERM).is_ok() {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

/// Thread-safe and signal-safe cancellation request for the running job.
///
/// Clones share state. Cancelling while no process is armed is a no-op apart
/// from recording the request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// Creates a new, unarmed token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `pid` as the process to terminate on cancellation.
    ///
    /// `pid` must lead its own process group; the group is signalled.
    pub fn arm(&self, pid: u32) {
        self.state.pid.store(pid as i32, Ordering::SeqCst);
    }

    /// Stops tracking any process.
    pub fn disarm(&self) {
        self.state.pid.store(NO_PID, Ordering::SeqCst);
    }

    /// Returns true if a process is currently tracked.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state.pid.load(Ordering::SeqCst) > NO_PID
    }

    /// Requests termination of the tracked process group.
    ///
    /// Returns true if a termination signal was delivered by this call.
    /// Never blocks and never panics.
    pub fn cancel(&self) -> bool {
        self.state.cancel()
    }

    /// Returns true if cancellation was requested at least once.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    /// Number of termination signals delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u32 {
        self.state.delivered.load(Ordering::SeqCst)
    }

    /// Last signal that triggered a cancellation through a [`SignalBridge`], if any.
    #[must_use]
    pub fn last_signal(&self) -> Option<Signal> {
        match self.state.last_signal.load(Ordering::SeqCst) {
            0 => None,
            signo => Signal::try_from(signo).ok(),
        }
    }
}

/// Token state published to the signal handler.
static ACTIVE: AtomicPtr<CancelState> = AtomicPtr::new(ptr::null_mut());

extern "C" fn handle_signal(signo: nix::libc::c_int) {
    let state = ACTIVE.load(Ordering::SeqCst);
    if state.is_null() {
        return;
    }
    // SAFETY: the pointer comes from `Arc::into_raw` in `SignalBridge::install`
    // and stays valid until the bridge has restored the previous handlers.
    let state = unsafe { &*state };
    state.last_signal.store(signo, Ordering::SeqCst);
    state.cancel();
}

/// Installed signal handlers forwarding termination signals to a [`CancelToken`].
///
/// Only one bridge can be active at a time. Dropping the bridge restores the
/// previous handlers.
#[derive(Debug)]
pub struct SignalBridge {
    previous: Vec<(Signal, SigAction)>,
    state: *const CancelState,
}

impl SignalBridge {
    /// Installs handlers for [`CANCEL_SIGNALS`] that cancel `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if another bridge is already installed or if a
    /// handler cannot be installed (handlers installed so far are restored).
    #[instrument(skip(token))]
    pub fn install(token: &CancelToken) -> std::io::Result<Self> {
        let raw = Arc::into_raw(Arc::clone(&token.state));
        if ACTIVE
            .compare_exchange(
                ptr::null_mut(),
                raw.cast_mut(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            // SAFETY: `raw` was produced by `Arc::into_raw` just above and never published.
            drop(unsafe { Arc::from_raw(raw) });
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a signal bridge is already installed",
            ));
        }

        let mut bridge = Self {
            previous: Vec::with_capacity(CANCEL_SIGNALS.len()),
            state: raw,
        };

        let action = SigAction::new(
            SigHandler::Handler(handle_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in CANCEL_SIGNALS {
            // SAFETY: the handler only touches atomics and calls kill(2).
            match unsafe { signal::sigaction(sig, &action) } {
                Ok(previous) => bridge.previous.push((sig, previous)),
                Err(e) => {
                    warn!(signal = %sig, error = %e, "Failed to install signal handler");
                    // Drop restores what was installed and releases the token.
                    return Err(std::io::Error::from(e));
                }
            }
        }

        debug!("Signal handlers installed (HUP, INT, QUIT, TERM, USR1, USR2)");
        Ok(bridge)
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for (sig, previous) in self.previous.drain(..).rev() {
            // SAFETY: restoring a disposition previously returned by sigaction.
            if let Err(e) = unsafe { signal::sigaction(sig, &previous) } {
                warn!(signal = %sig, error = %e, "Failed to restore signal handler");
            }
        }

        let published = ACTIVE.swap(ptr::null_mut(), Ordering::SeqCst);
        debug_assert_eq!(published.cast_const(), self.state);
        // SAFETY: handlers no longer reference the state; reclaim the Arc leaked in install.
        drop(unsafe { Arc::from_raw(self.state) });
        debug!("Signal handlers restored");
    }
}
