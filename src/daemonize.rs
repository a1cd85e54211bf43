//! The single-fork daemonization handshake: acquire the pid-file lock in
//! the original process, fork, hand the lock off to the child over a pipe,
//! detach the session, and point stdin/stdout/stderr at `/dev/null`.
//!
//! Grounded on `daemonize.c`'s `test_running`/`daemonize`, translated into
//! [`kristof-mattei-fork-rs`]'s small `cvt`-wrapped syscall style rather
//! than that file's raw `errno` checks.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum DaemonizeError {
    #[error("{0}: another instance is already running")]
    AlreadyRunning(PathBuf),
    #[error("failed to open pid file {path}: {source}")]
    PidFileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write pid file {path}: {source}")]
    PidFileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create synchronization pipe: {0}")]
    Pipe(#[source] std::io::Error),
    #[error("fork failed: {0}")]
    Fork(#[source] std::io::Error),
    #[error("failed to detach from the controlling terminal: {0}")]
    Setsid(#[source] std::io::Error),
    #[error("failed to open /dev/null: {0}")]
    DevNull(#[source] std::io::Error),
}

/// Which side of the fork the caller is now running as.
pub enum DaemonizeOutcome {
    /// The original process. It has nothing left to do but exit 0.
    Parent,
    /// The detached child that should continue on to run the supervisor
    /// loop, holding the pid-file lock for as long as `pid_fd` stays open.
    Child { pid_fd: Option<RawFd> },
}

/// Runs the full daemonization handshake described above.
///
/// # Errors
///
/// Returns an error if the pid file is already locked by a running
/// instance, or if any of the underlying syscalls (`pipe`, `fork`,
/// `setsid`, opening `/dev/null`) fail.
pub fn daemonize(pid_file: Option<&Path>) -> Result<DaemonizeOutcome, DaemonizeError> {
    let Some(pid_file) = pid_file else {
        return match fork().map_err(DaemonizeError::Fork)? {
            Fork::Parent => Ok(DaemonizeOutcome::Parent),
            Fork::Child => daemonize_detach(None),
        };
    };

    let pid_fd = lock_pid_file(pid_file)?;

    let (read_end, write_end) = pipe().map_err(DaemonizeError::Pipe)?;

    match fork().map_err(DaemonizeError::Fork)? {
        Fork::Parent => {
            let _r = close(read_end);
            // Closing our copy of the lock releases it so the child can
            // re-acquire a lock that will outlive this process.
            let _r = close(pid_fd);

            let sync_byte = [0_u8];
            let _r = write_all(write_end, &sync_byte);
            let _r = close(write_end);

            Ok(DaemonizeOutcome::Parent)
        }
        Fork::Child => {
            let _r = close(write_end);
            let _r = close(pid_fd);

            let mut sync_byte = [0_u8];
            let _r = read_exact(read_end, &mut sync_byte);
            let _r = close(read_end);

            let pid_fd = lock_pid_file(pid_file)?;

            daemonize_detach(Some(pid_fd))
        }
    }
}

fn daemonize_detach(pid_fd: Option<RawFd>) -> Result<DaemonizeOutcome, DaemonizeError> {
    setsid().map_err(DaemonizeError::Setsid)?;

    unsafe {
        libc::umask(0);
    }

    // Matches the distilled spec's default working directory when none was
    // requested; `--chdir` (applied later, inside the target's own fork)
    // can still move the supervised child elsewhere.
    let _r = std::env::set_current_dir("/");

    let null_fd = open_dev_null().map_err(DaemonizeError::DevNull)?;

    for target_fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        let _r = dup2(null_fd, target_fd);
    }
    if null_fd != libc::STDIN_FILENO && null_fd != libc::STDOUT_FILENO && null_fd != libc::STDERR_FILENO {
        let _r = close(null_fd);
    }

    Ok(DaemonizeOutcome::Child { pid_fd })
}

/// Opens (creating if absent) and exclusively locks `pid_file`, truncates
/// it, and writes the caller's own pid. Mirrors `daemonize.c`'s
/// `test_running`.
fn lock_pid_file(pid_file: &Path) -> Result<RawFd, DaemonizeError> {
    let c_path = CString::new(pid_file.as_os_str().as_encoded_bytes()).map_err(|_err| DaemonizeError::PidFileOpen {
        path: pid_file.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "interior NUL in path"),
    })?;

    let fd = cvt::cvt(unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_RDWR | libc::O_CREAT,
            libc::S_IRUSR | libc::S_IWUSR | libc::S_IRGRP | libc::S_IROTH,
        )
    })
    .map_err(|source| DaemonizeError::PidFileOpen {
        path: pid_file.to_path_buf(),
        source,
    })?;

    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;

    if unsafe { libc::fcntl(fd, libc::F_SETLK, &raw const lock) } < 0 {
        let _r = close(fd);
        return Err(DaemonizeError::AlreadyRunning(pid_file.to_path_buf()));
    }

    if let Err(source) = write_pid(fd) {
        let _r = close(fd);
        return Err(DaemonizeError::PidFileWrite {
            path: pid_file.to_path_buf(),
            source,
        });
    }

    Ok(fd)
}

fn write_pid(fd: RawFd) -> std::io::Result<()> {
    cvt::cvt(unsafe { libc::ftruncate(fd, 0) })?;
    cvt::cvt(unsafe { libc::lseek(fd, 0, libc::SEEK_SET) })?;

    let text = format!("{}\n", unsafe { libc::getpid() });
    write_all(fd, text.as_bytes())
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let written = cvt::cvt_r(|| unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })?;
        let written = usize::try_from(written).expect("write(2) never returns a negative success value");
        buf = &buf[written..];
    }
    Ok(())
}

fn read_exact(fd: RawFd, mut buf: &mut [u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let bytes_read = cvt::cvt_r(|| unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })?;
        let bytes_read = usize::try_from(bytes_read).expect("read(2) never returns a negative success value");
        if bytes_read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "synchronization pipe closed before signaling",
            ));
        }
        buf = &mut buf[bytes_read..];
    }
    Ok(())
}

/// Which side of a `fork()` the caller is now running as. The handshake
/// only needs to distinguish the two sides; neither branch here needs the
/// child's pid (the daemonizer never waits on it).
enum Fork {
    Parent,
    Child,
}

fn fork() -> std::io::Result<Fork> {
    let pid = cvt::cvt(unsafe { libc::fork() })?;

    if pid == 0 {
        Ok(Fork::Child)
    } else {
        Ok(Fork::Parent)
    }
}

fn setsid() -> std::io::Result<()> {
    cvt::cvt(unsafe { libc::setsid() }).map(|_| ())
}

fn close(fd: RawFd) -> std::io::Result<()> {
    cvt::cvt(unsafe { libc::close(fd) }).map(|_| ())
}

fn dup2(from: RawFd, to: RawFd) -> std::io::Result<()> {
    cvt::cvt_r(|| unsafe { libc::dup2(from, to) }).map(|_| ())
}

fn pipe() -> std::io::Result<(RawFd, RawFd)> {
    let mut fds = [0_i32; 2];
    cvt::cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    Ok((fds[0], fds[1]))
}

fn open_dev_null() -> std::io::Result<RawFd> {
    cvt::cvt(unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{pipe, read_exact, write_all};

    #[test]
    fn pipe_round_trips_a_sync_byte() {
        let (read_end, write_end) = pipe().expect("pipe(2) should succeed in a test sandbox");

        write_all(write_end, &[7_u8]).unwrap();
        let mut buf = [0_u8];
        read_exact(read_end, &mut buf).unwrap();

        assert_eq!(buf[0], 7);

        unsafe {
            libc::close(read_end);
            libc::close(write_end);
        }
    }
}
