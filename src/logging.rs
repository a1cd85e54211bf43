//! A level-filtered text sink with a one-way runtime switch between
//! standard-error (used before daemonizing) and the system log (used once
//! the supervisor has detached).
//!
//! Implemented as a `log::Log` backend so the rest of the crate can just
//! use `log::{debug,info,warn,error}!`, but the backend itself is the raw
//! `libc::openlog`/`libc::syslog` pair rather than a separate syslog crate,
//! to stay in the same raw-syscall idiom as [`crate::daemonize`].

use std::ffi::CString;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use log::{Level, Log, Metadata, Record};

static SYSLOG_ENABLED: AtomicBool = AtomicBool::new(false);
static IDENT: OnceLock<CString> = OnceLock::new();

struct DualSink;

impl Log for DualSink {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if SYSLOG_ENABLED.load(Ordering::Acquire) {
            log_to_syslog(record.level(), &record.args().to_string());
        } else {
            log_to_stderr(record.level(), &record.args().to_string());
        }
    }

    fn flush(&self) {
        let _r = std::io::stderr().flush();
    }
}

fn log_to_stderr(level: Level, message: &str) {
    let mut stderr = std::io::stderr();
    let _r = writeln!(stderr, "{level}: {message}");
    let _r = stderr.flush();
}

fn syslog_priority(level: Level) -> libc::c_int {
    match level {
        Level::Trace | Level::Debug => libc::LOG_DEBUG,
        Level::Info => libc::LOG_INFO,
        Level::Warn => libc::LOG_WARNING,
        Level::Error => libc::LOG_ERR,
    }
}

fn log_to_syslog(level: Level, message: &str) {
    let Ok(c_message) = CString::new(message) else {
        return;
    };

    unsafe {
        // `libc::syslog`'s format string is fixed to `"%s"`, so no
        // attacker-controlled data ever reaches it as a format directive.
        libc::syslog(syslog_priority(level), c"%s".as_ptr(), c_message.as_ptr());
    }
}

/// Installs the dual-sink logger and opens the syslog connection (inactive
/// until [`enable_syslog`] is called). `ident` is the program identity
/// prefix syslog will tag every message with.
pub fn init(ident: &str) {
    let c_ident = CString::new(ident).unwrap_or_else(|_err| CString::new("wardend").unwrap());

    unsafe {
        libc::openlog(c_ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON);
    }

    // `openlog` is permitted to retain the pointer rather than copy it, so
    // the `CString` must outlive the process; keep it in a static.
    let _r = IDENT.set(c_ident);

    log::set_max_level(log::LevelFilter::Debug);
    // `set_logger` only fails if called twice; `init` is only ever called
    // once from `main`, so a failure here means a caller bug, not a
    // runtime condition worth propagating.
    let _r = log::set_logger(&DualSink);
}

/// One-way switch from stderr to syslog. Called once, immediately after
/// daemonizing succeeds.
pub fn enable_syslog() {
    SYSLOG_ENABLED.store(true, Ordering::Release);
}

/// Logs a message tagged as fatal. Rust's `log` facade has no level hotter
/// than `Error`, so a fatal condition is an `Error`-level record with an
/// explicit tag, mirroring the distilled level set (`debug`, `info`,
/// `warn`, `error`, `fatal`) without inventing a sixth `log::Level` variant.
#[macro_export]
macro_rules! log_fatal {
    ($($arg:tt)+) => {
        log::error!("fatal: {}", format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::syslog_priority;

    #[test]
    fn level_to_priority_mapping_is_monotonic_in_severity() {
        assert_eq!(syslog_priority(log::Level::Debug), libc::LOG_DEBUG);
        assert_eq!(syslog_priority(log::Level::Info), libc::LOG_INFO);
        assert_eq!(syslog_priority(log::Level::Warn), libc::LOG_WARNING);
        assert_eq!(syslog_priority(log::Level::Error), libc::LOG_ERR);
    }
}
