//! Scoped signal handler installation.
//!
//! [`SignalScope`] swaps in handlers for a set of signals and restores the
//! previous disposition of every one of them when it is dropped, whether the
//! scope ends normally, through `?` or by unwinding.
//!
//! The signal-handler table is process-global. Nothing else in this crate
//! reads or writes it, and two scopes covering the same signal must not be
//! alive on different threads at the same time.

use crate::config::types::{Result, RunError};
use log::debug;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Installed handlers, restored on drop
pub struct SignalScope {
    previous: Vec<(Signal, SigAction)>,
}

impl SignalScope {
    /// Install `handlers` and return the guard that restores the old ones.
    ///
    /// If one installation fails the already swapped handlers are put back
    /// before the error is returned. Installation is not atomic across
    /// signals, so a signal arriving during a failed install may still see a
    /// new handler briefly.
    pub fn install<I>(handlers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Signal, SigHandler)>,
    {
        let mut scope = Self {
            previous: Vec::new(),
        };

        for (sig, handler) in handlers {
            let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
            // SAFETY: the handlers passed in are either SIG_DFL/SIG_IGN or
            // extern "C" functions; async-signal safety of their bodies is the
            // caller's contract.
            match unsafe { signal::sigaction(sig, &action) } {
                Ok(old) => scope.previous.push((sig, old)),
                Err(e) => {
                    // Dropping `scope` restores whatever was installed so far.
                    return Err(RunError::Signal(format!(
                        "Failed to install {} handler: {}",
                        sig, e
                    )));
                }
            }
        }

        debug!(
            "Signal scope installed for {:?}",
            scope.previous.iter().map(|(sig, _)| *sig).collect::<Vec<_>>()
        );
        Ok(scope)
    }

    /// Signals covered by this scope, in installation order
    pub fn signals(&self) -> impl Iterator<Item = Signal> + '_ {
        self.previous.iter().map(|(sig, _)| *sig)
    }
}

impl Drop for SignalScope {
    fn drop(&mut self) {
        // Each signal gets its own prior action back, independent of order.
        for (sig, old) in self.previous.drain(..).rev() {
            // SAFETY: `old` was returned by sigaction for this very signal.
            if let Err(e) = unsafe { signal::sigaction(sig, &old) } {
                log::error!("Failed to restore {} handler: {}", sig, e);
            }
        }
    }
}

/// Snapshot of a signal's installed disposition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disposition {
    /// Handler address (`SIG_DFL`/`SIG_IGN` are 0/1)
    pub handler: usize,
    pub flags: libc::c_int,
    /// Blocked signals during the handler, bit `n - 1` for signal `n`
    pub mask: u64,
}

/// Highest signal number a [`Disposition`] mask covers
const MASK_SIGNALS: libc::c_int = 64;

/// Read the current disposition of `sig` without changing it.
pub fn current_disposition(sig: Signal) -> Result<Disposition> {
    let mut old = std::mem::MaybeUninit::<libc::sigaction>::zeroed();
    // SAFETY: a null `act` makes sigaction a pure query.
    let rc = unsafe { libc::sigaction(sig as libc::c_int, std::ptr::null(), old.as_mut_ptr()) };
    if rc != 0 {
        return Err(RunError::Signal(format!(
            "Failed to query {} handler: {}",
            sig,
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: the kernel filled the struct on success.
    let old = unsafe { old.assume_init() };

    // The kernel only fills the words it knows about, so the rest of
    // `sigset_t` is not compared.
    let mut mask = 0u64;
    for signo in 1..=MASK_SIGNALS {
        // SAFETY: `sa_mask` is an initialized sigset_t.
        if unsafe { libc::sigismember(&old.sa_mask, signo) } == 1 {
            mask |= 1u64 << (signo - 1);
        }
    }

    Ok(Disposition {
        handler: old.sa_sigaction,
        flags: old.sa_flags,
        mask,
    })
}

/// Serializes unit tests that touch the process-wide signal table
#[cfg(test)]
pub(crate) static SIGNAL_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
