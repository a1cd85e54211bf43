//! The async-signal-safe shutdown flag and the `SIGINT`/`SIGTERM` handler
//! that sets it.
//!
//! The handler body is the minimum possible: a single relaxed store. It
//! must never log (syslog is not async-signal-safe), matching the
//! distilled spec's concurrency model exactly.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Polled at the top of every watch-loop iteration.
#[must_use]
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Test-only hook to simulate a signal without actually raising one.
#[cfg(test)]
pub fn request_shutdown_for_test() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn handle_shutdown_signal(_sig_no: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// Installs the shared handler for `SIGINT` and `SIGTERM` with
/// `SA_RESTART` set, so blocking syscalls the supervisor happens to be in
/// (the handshake-pipe `read`, the respawn-delay `sleep`) resume
/// transparently instead of failing with `EINTR`.
pub fn install() -> std::io::Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handle_shutdown_signal as usize;
    action.sa_flags = libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&raw mut action.sa_mask);
    }

    for signal in [libc::SIGINT, libc::SIGTERM] {
        let rc = unsafe { libc::sigaction(signal, &raw const action, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{request_shutdown_for_test, shutdown_requested};

    #[test]
    fn flag_observes_a_simulated_signal() {
        assert_eq!(shutdown_requested(), false);
        request_shutdown_for_test();
        assert_eq!(shutdown_requested(), true);
    }
}
