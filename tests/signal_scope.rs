//! Signal scope restoration against the live handler table

mod common;

use common::serial;
use nix::sys::signal::{raise, SigHandler, Signal};
use runexec::kernel::signal::{current_disposition, SignalScope};
use runexec::RunError;
use std::sync::atomic::{AtomicI32, Ordering};

static LAST_SIGINFO_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_with_info(sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // SAFETY: the kernel passes a valid siginfo to SA_SIGINFO handlers.
    let signo = unsafe { (*info).si_signo };
    if signo == sig {
        LAST_SIGINFO_SIGNAL.store(sig, Ordering::SeqCst);
    }
}

const TERMINATION: [Signal; 3] = [Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGINT];

#[test]
fn test_empty_scope_leaves_dispositions_unchanged() {
    let _serial = serial();
    let before: Vec<_> = TERMINATION
        .iter()
        .map(|sig| current_disposition(*sig).unwrap())
        .collect();

    drop(SignalScope::install(std::iter::empty()).unwrap());

    let after: Vec<_> = TERMINATION
        .iter()
        .map(|sig| current_disposition(*sig).unwrap())
        .collect();
    assert_eq!(before, after);
}

#[test]
fn test_all_handler_kinds_restored() {
    let _serial = serial();
    let before: Vec<_> = [Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGHUP]
        .iter()
        .map(|sig| current_disposition(*sig).unwrap())
        .collect();

    {
        let scope = SignalScope::install([
            (Signal::SIGUSR1, SigHandler::SigAction(record_with_info)),
            (Signal::SIGUSR2, SigHandler::SigIgn),
            (Signal::SIGHUP, SigHandler::SigDfl),
        ])
        .unwrap();
        assert_eq!(
            scope.signals().collect::<Vec<_>>(),
            vec![Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGHUP]
        );

        LAST_SIGINFO_SIGNAL.store(0, Ordering::SeqCst);
        raise(Signal::SIGUSR1).unwrap();
        assert_eq!(LAST_SIGINFO_SIGNAL.load(Ordering::SeqCst), libc::SIGUSR1);

        // Ignored for the lifetime of the scope.
        raise(Signal::SIGUSR2).unwrap();
    }

    let after: Vec<_> = [Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGHUP]
        .iter()
        .map(|sig| current_disposition(*sig).unwrap())
        .collect();
    assert_eq!(before, after);
}

#[test]
fn test_uncatchable_signal_fails_install() {
    let _serial = serial();
    let before = current_disposition(Signal::SIGTERM).unwrap();

    let result = SignalScope::install([
        (Signal::SIGTERM, SigHandler::SigIgn),
        (Signal::SIGSTOP, SigHandler::SigIgn),
    ]);
    assert!(matches!(result, Err(RunError::Signal(_))));
    assert_eq!(current_disposition(Signal::SIGTERM).unwrap(), before);
}
