//! Resolution of `--user NAME` to a uid/gid/home directory, and the
//! `initgroups` -> `setgid` -> `setuid` sequence that drops into it.
//!
//! Kept in the same raw-libc-plus-`cvt` idiom as [`crate::daemonize`]: every
//! syscall is a small free function returning `std::io::Result`.

use std::ffi::CString;
use std::path::PathBuf;

/// A resolved system account: the pieces of `getpwnam` the supervisor needs.
#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    pub home_dir: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum UserError {
    #[error("user {0:?} does not exist")]
    NotFound(String),
    #[error("user name {0:?} contains an interior NUL byte")]
    InvalidName(String),
    #[error("failed to look up user {name:?}: {source}")]
    Lookup {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves `name` via `getpwnam_r`. Run at option-parse time (not inside
/// the forked child), so an unknown `--user` is reported as a config error
/// before daemonizing.
pub fn resolve_user(name: &str) -> Result<ResolvedUser, UserError> {
    let c_name =
        CString::new(name).map_err(|_err| UserError::InvalidName(name.to_owned()))?;

    // `getpwnam_r` writes into caller-supplied storage instead of a static
    // buffer, so it is safe to call from a process that may later fork.
    let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0_u8; 16 * 1024];

    loop {
        let rc = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                &raw mut passwd,
                buf.as_mut_ptr().cast::<libc::c_char>(),
                buf.len(),
                &raw mut result,
            )
        };

        if rc == 0 {
            break;
        }

        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }

        return Err(UserError::Lookup {
            name: name.to_owned(),
            source: std::io::Error::from_raw_os_error(rc),
        });
    }

    if result.is_null() {
        return Err(UserError::NotFound(name.to_owned()));
    }

    let home_dir = unsafe { std::ffi::CStr::from_ptr(passwd.pw_dir) }
        .to_string_lossy()
        .into_owned();

    Ok(ResolvedUser {
        uid: passwd.pw_uid,
        gid: passwd.pw_gid,
        home_dir: PathBuf::from(home_dir),
    })
}

#[derive(thiserror::Error, Debug)]
pub enum PrivDropError {
    #[error("failed to init supplementary groups for {user:?}: {source}")]
    InitGroups {
        user: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to set group id {gid}: {source}")]
    SetGid {
        gid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to set user id {uid}: {source}")]
    SetUid {
        uid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// `initgroups(user, gid)` -> `setgid(gid)` -> `setuid(uid)`, in that order.
///
/// Note the order matters: `setgid` must run while still privileged enough
/// to change it, and `setuid` must come last since it is (on POSIX systems)
/// irreversible. This intentionally sets the uid from `uid`, not `gid` -- a
/// bug present in the program this supervisor's design was distilled from.
pub fn drop_privileges(user: &str, uid: u32, gid: u32) -> Result<(), PrivDropError> {
    let c_user = CString::new(user).map_err(|_err| PrivDropError::InitGroups {
        user: user.to_owned(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "interior NUL in username"),
    })?;

    let rc = unsafe { libc::initgroups(c_user.as_ptr(), gid) };
    if rc != 0 {
        return Err(PrivDropError::InitGroups {
            user: user.to_owned(),
            source: std::io::Error::last_os_error(),
        });
    }

    let rc = unsafe { libc::setgid(gid) };
    if rc != 0 {
        return Err(PrivDropError::SetGid {
            gid,
            source: std::io::Error::last_os_error(),
        });
    }

    let rc = unsafe { libc::setuid(uid) };
    if rc != 0 {
        return Err(PrivDropError::SetUid {
            uid,
            source: std::io::Error::last_os_error(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::resolve_user;

    #[test]
    fn root_resolves_to_uid_zero() {
        let resolved = resolve_user("root").expect("root always exists on a POSIX system");

        assert_eq!(resolved.uid, 0);
        assert_eq!(resolved.gid, 0);
    }

    #[test]
    fn unknown_user_is_reported_as_not_found() {
        let err = resolve_user("definitely-not-a-real-account-xyz").unwrap_err();

        assert!(matches!(err, super::UserError::NotFound(_)));
    }

    #[test]
    fn embedded_nul_is_rejected_before_the_syscall() {
        let err = resolve_user("bad\0name").unwrap_err();

        assert!(matches!(err, super::UserError::InvalidName(_)));
    }
}
