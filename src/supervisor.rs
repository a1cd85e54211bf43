//! The fork/exec/watch/respawn loop that runs once daemonization has
//! completed.
//!
//! Grounded directly on `main.c`'s `main()`: the nested `while (1)` loops,
//! `check_respawn_required`, and `graceful_shutdown` are kept as separate,
//! independently testable pieces (`classify_exit`, `decide_respawn`) rather
//! than one large function, but the control flow they drive is unchanged.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::options::Options;
use crate::runtime::RuntimeFds;
use crate::signals;

/// Reserved exit code a forked child uses when it fails before `execv`,
/// distinguishing supervisor-side setup failures from the target's own
/// exit statuses.
const CHILD_SETUP_FAILED_CODE: i32 = 254;

const PROGRAM_NAME: &str = "wardend";

/// Failure domain for the supervise loop itself, as distinct from a
/// `ConfigError` (parse time) or `DaemonizeError` (handshake time).
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("failed to fork: {0}")]
    Fork(#[source] std::io::Error),
    #[error("failed to wait for target: {0}")]
    Wait(#[source] std::io::Error),
}

pub struct Supervisor {
    options: Options,
    fds: RuntimeFds,
}

impl Supervisor {
    #[must_use]
    pub fn new(options: Options, pid_fd: Option<RawFd>) -> Self {
        let mut fds = RuntimeFds::new();
        fds.pid_fd = pid_fd.unwrap_or(-1);

        Self { options, fds }
    }

    /// Runs the supervise loop until the target is no longer respawned,
    /// a shutdown signal is observed, or an unrecoverable error occurs.
    /// Returns the process exit code.
    pub fn run(mut self) -> i32 {
        let mut respawn_cnt: u32 = 0;

        loop {
            let pid = match spawn_child(&self.options) {
                Ok(pid) => pid,
                Err(err) => {
                    log::error!("{err}");
                    return self.finish(1);
                }
            };

            match self.watch(pid, &mut respawn_cnt) {
                WatchOutcome::Respawn => continue,
                WatchOutcome::Stop { exit_code } => return self.finish(exit_code),
            }
        }
    }

    fn watch(&mut self, pid: libc::pid_t, respawn_cnt: &mut u32) -> WatchOutcome {
        loop {
            if signals::shutdown_requested() {
                log::info!("graceful shutdown {}", self.options.target.display());
                graceful_shutdown(pid, &self.options);
                return WatchOutcome::Stop { exit_code: 0 };
            }

            match try_wait(pid) {
                WaitResult::StillRunning => {
                    std::thread::sleep(Duration::from_millis(200));
                }
                WaitResult::Error(err) => {
                    log::error!("{}", SupervisorError::Wait(err));
                    return WatchOutcome::Stop { exit_code: 1 };
                }
                WaitResult::Exited(status) => {
                    let class = classify_exit(status);
                    log_exit(&self.options, &class);

                    let (new_cnt, decision) = decide_respawn(&self.options, &class, *respawn_cnt);
                    *respawn_cnt = new_cnt;

                    return match decision {
                        RespawnDecision::Stop { exit_code } => WatchOutcome::Stop { exit_code },
                        RespawnDecision::Respawn => {
                            if self.options.respawn_delay.is_zero() {
                                log::info!("{} respawning immediately", self.options.target.display());
                            } else {
                                log::info!(
                                    "{} respawning in {:?}",
                                    self.options.target.display(),
                                    self.options.respawn_delay
                                );
                                std::thread::sleep(self.options.respawn_delay);
                            }
                            WatchOutcome::Respawn
                        }
                    };
                }
            }
        }
    }

    fn finish(mut self, exit_code: i32) -> i32 {
        log::info!("{PROGRAM_NAME} exited");
        self.fds.cleanup(self.options.pid_file.as_deref());
        exit_code
    }
}

enum WatchOutcome {
    Respawn,
    Stop { exit_code: i32 },
}

/// The classified `waitpid` status of a terminated target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Exited(i32),
    Signaled(i32),
    Other,
}

#[must_use]
pub fn classify_exit(status: libc::c_int) -> ExitClass {
    if libc::WIFEXITED(status) {
        ExitClass::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitClass::Signaled(libc::WTERMSIG(status))
    } else {
        ExitClass::Other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespawnDecision {
    Respawn,
    Stop { exit_code: i32 },
}

/// Decides whether the target should be respawned, and the resulting exit
/// code if not. Mirrors `check_respawn_required` plus the surrounding
/// bookkeeping in `main.c`'s watch loop: a setup failure (exit 254) always
/// stops with a failure code regardless of `--respawn`; otherwise the
/// respawn counter is incremented first, then capped by `--max-respawns`,
/// then gated by `--respawn`/`--respawn-code`.
#[must_use]
pub fn decide_respawn(options: &Options, class: &ExitClass, respawn_cnt: u32) -> (u32, RespawnDecision) {
    if *class == ExitClass::Exited(CHILD_SETUP_FAILED_CODE) {
        return (respawn_cnt, RespawnDecision::Stop { exit_code: 1 });
    }

    let respawn_required = match class {
        ExitClass::Exited(code) => options.respawn && options.respawn_code_bits.contains(*code),
        ExitClass::Signaled(_) | ExitClass::Other => options.respawn,
    };

    let respawn_cnt = respawn_cnt + 1;

    if options.max_respawn_cnt != 0 && respawn_cnt > options.max_respawn_cnt {
        return (respawn_cnt, RespawnDecision::Stop { exit_code: 0 });
    }

    if !respawn_required {
        return (respawn_cnt, RespawnDecision::Stop { exit_code: 0 });
    }

    (respawn_cnt, RespawnDecision::Respawn)
}

fn log_exit(options: &Options, class: &ExitClass) {
    match class {
        ExitClass::Exited(code) => {
            log::warn!("{} exited, status: {code}", options.target.display());
        }
        ExitClass::Signaled(signal) => {
            log::warn!("{} exited, signal: {signal}", options.target.display());
        }
        ExitClass::Other => {
            log::warn!("{} exited abnormally", options.target.display());
        }
    }
}

enum WaitResult {
    StillRunning,
    Exited(libc::c_int),
    Error(std::io::Error),
}

fn try_wait(pid: libc::pid_t) -> WaitResult {
    let mut status: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(pid, &raw mut status, libc::WNOHANG) };

    if rc == 0 {
        WaitResult::StillRunning
    } else if rc == pid {
        WaitResult::Exited(status)
    } else {
        WaitResult::Error(std::io::Error::last_os_error())
    }
}

/// Sends `SIGTERM`, polls every 200ms for up to 10 seconds, then escalates
/// to `SIGKILL` and waits synchronously. Mirrors `main.c`'s
/// `graceful_shutdown`.
fn graceful_shutdown(pid: libc::pid_t, options: &Options) {
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    for _ in 0..50 {
        std::thread::sleep(Duration::from_millis(200));

        let rc = unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
        if rc == pid {
            return;
        }
    }

    log::warn!(
        "waiting for {} to exit timed out; force terminating it",
        options.target.display()
    );

    unsafe {
        libc::kill(pid, libc::SIGKILL);
        libc::waitpid(pid, std::ptr::null_mut(), 0);
    }
}

fn spawn_child(options: &Options) -> Result<libc::pid_t, SupervisorError> {
    let pid = cvt::cvt(unsafe { libc::fork() }).map_err(SupervisorError::Fork)?;

    if pid == 0 {
        run_child(options);
    }

    Ok(pid)
}

/// Runs entirely inside the freshly forked child, up to `execv`. Any setup
/// failure exits with [`CHILD_SETUP_FAILED_CODE`] rather than returning,
/// since returning into the supervisor's own call stack post-fork would be
/// incorrect.
fn run_child(options: &Options) -> ! {
    if unsafe { libc::setsid() } < 0 {
        std::process::exit(CHILD_SETUP_FAILED_CODE);
    }

    unsafe {
        libc::umask(0);
    }

    if let Some(dir) = &options.working_dir {
        if std::env::set_current_dir(dir).is_err() {
            log::error!("failed to chdir to {}", dir.display());
        }
    }

    for (name, value) in &options.environments {
        // SAFETY: run_child executes single-threaded, immediately after
        // fork and before exec; no other thread can observe a torn
        // environment here.
        unsafe {
            std::env::set_var(name, value);
        }
    }

    redirect_std_fds(options);

    if let (Some(user), Some(uid), Some(gid)) = (&options.run_user, options.uid, options.gid) {
        if let Err(err) = crate::privdrop::drop_privileges(user, uid, gid) {
            log::error!("failed to drop privileges: {err}");
            std::process::exit(CHILD_SETUP_FAILED_CODE);
        }

        unsafe {
            std::env::set_var("USER", user);
            std::env::set_var("LOGNAME", user);
            if let Some(home) = &options.home_dir {
                std::env::set_var("HOME", home);
            }
        }
    }

    log::info!("start to execute {}", options.target.display());

    exec_target(options);
}

fn redirect_std_fds(options: &Options) {
    if let Some(path) = &options.stdout_path {
        match crate::runtime::open_append(path) {
            Ok(fd) => {
                unsafe {
                    libc::dup2(fd, libc::STDOUT_FILENO);
                }
            }
            Err(err) => log::error!("failed to open {}: {err}", path.display()),
        }
    }

    if let Some(path) = &options.stderr_path {
        match crate::runtime::open_append(path) {
            Ok(fd) => {
                unsafe {
                    libc::dup2(fd, libc::STDERR_FILENO);
                }
            }
            Err(err) => log::error!("failed to open {}: {err}", path.display()),
        }
    }
}

fn exec_target(options: &Options) -> ! {
    let Ok(path) = CString::new(options.target.as_os_str().as_encoded_bytes()) else {
        std::process::exit(CHILD_SETUP_FAILED_CODE);
    };

    let mut c_argv = Vec::with_capacity(options.target_argv.len());
    for arg in &options.target_argv {
        match CString::new(arg.as_str()) {
            Ok(c_arg) => c_argv.push(c_arg),
            Err(_err) => std::process::exit(CHILD_SETUP_FAILED_CODE),
        }
    }

    let mut argv_ptrs: Vec<*const libc::c_char> = c_argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    unsafe {
        libc::execv(path.as_ptr(), argv_ptrs.as_ptr());
    }

    std::process::exit(CHILD_SETUP_FAILED_CODE);
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{classify_exit, decide_respawn, ExitClass, RespawnDecision, CHILD_SETUP_FAILED_CODE};
    use crate::options::Options;
    use crate::respawn::RespawnBits;

    fn encode_exited(code: i32) -> libc::c_int {
        code << 8
    }

    fn encode_signaled(signal: i32) -> libc::c_int {
        signal
    }

    fn options_with(respawn: bool, bits: RespawnBits, max_respawn_cnt: u32) -> Options {
        Options {
            stdout_path: None,
            stderr_path: None,
            working_dir: None,
            run_user: None,
            home_dir: None,
            uid: None,
            gid: None,
            environments: Vec::new(),
            pid_file: None,
            respawn,
            respawn_code_bits: bits,
            respawn_delay: Duration::from_secs(0),
            max_respawn_cnt,
            target: PathBuf::from("/usr/bin/true"),
            target_argv: vec!["true".to_owned()],
        }
    }

    #[test]
    fn classify_exit_distinguishes_exited_and_signaled() {
        assert_eq!(classify_exit(encode_exited(0)), ExitClass::Exited(0));
        assert_eq!(classify_exit(encode_exited(17)), ExitClass::Exited(17));
        assert_eq!(classify_exit(encode_signaled(libc::SIGKILL)), ExitClass::Signaled(libc::SIGKILL));
    }

    #[test]
    fn child_setup_failure_always_stops_with_failure_regardless_of_respawn() {
        let options = options_with(true, RespawnBits::DEFAULT, 0);

        let (cnt, decision) = decide_respawn(&options, &ExitClass::Exited(CHILD_SETUP_FAILED_CODE), 0);

        assert_eq!(cnt, 0);
        assert_eq!(decision, RespawnDecision::Stop { exit_code: 1 });
    }

    #[test]
    fn without_respawn_flag_target_exit_always_stops_successfully() {
        let options = options_with(false, RespawnBits::DEFAULT, 0);

        let (cnt, decision) = decide_respawn(&options, &ExitClass::Exited(1), 0);

        assert_eq!(cnt, 1);
        assert_eq!(decision, RespawnDecision::Stop { exit_code: 0 });
    }

    #[test]
    fn respawn_is_gated_by_the_code_bitset() {
        let mut bits = RespawnBits::NONE;
        bits.set(9);
        let options = options_with(true, bits, 0);

        let (_, respawn_nine) = decide_respawn(&options, &ExitClass::Exited(9), 0);
        let (_, no_respawn_three) = decide_respawn(&options, &ExitClass::Exited(3), 0);

        assert_eq!(respawn_nine, RespawnDecision::Respawn);
        assert_eq!(no_respawn_three, RespawnDecision::Stop { exit_code: 0 });
    }

    #[test]
    fn a_signal_death_respawns_whenever_the_flag_is_set_regardless_of_bitset() {
        let options = options_with(true, RespawnBits::NONE, 0);

        let (_, decision) = decide_respawn(&options, &ExitClass::Signaled(libc::SIGSEGV), 0);

        assert_eq!(decision, RespawnDecision::Respawn);
    }

    #[test]
    fn max_respawn_cap_stops_once_exceeded() {
        let options = options_with(true, RespawnBits::DEFAULT, 2);

        let (cnt_1, decision_1) = decide_respawn(&options, &ExitClass::Exited(1), 0);
        let (cnt_2, decision_2) = decide_respawn(&options, &ExitClass::Exited(1), cnt_1);
        let (cnt_3, decision_3) = decide_respawn(&options, &ExitClass::Exited(1), cnt_2);

        assert_eq!(cnt_3, 3);
        assert_eq!(decision_1, RespawnDecision::Respawn);
        assert_eq!(decision_2, RespawnDecision::Respawn);
        assert_eq!(decision_3, RespawnDecision::Stop { exit_code: 0 });
    }

    #[test]
    fn zero_means_unlimited_respawns() {
        let options = options_with(true, RespawnBits::DEFAULT, 0);

        let mut cnt = 0;
        for _ in 0..1000 {
            let (new_cnt, decision) = decide_respawn(&options, &ExitClass::Exited(1), cnt);
            cnt = new_cnt;
            assert_eq!(decision, RespawnDecision::Respawn);
        }
    }
}
