//! The option model (`Options`) and the command-line parser (`Cli`) that
//! builds it.
//!
//! `Cli` only describes syntax (flag names, repeatability, the trailing
//! target/argv capture); every semantic check -- path existence,
//! executability, the user lookup, the respawn-bitset construction -- lives
//! in [`Cli::into_options`], grounded on `option.c`'s
//! `general_parse_file`/`parse_working_dir`/`check_target`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::privdrop::{resolve_user, UserError};
use crate::respawn::RespawnBits;

/// Parsed, validated, read-only configuration for one supervised target.
#[derive(Debug, Clone)]
pub struct Options {
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub run_user: Option<String>,
    pub home_dir: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub environments: Vec<(String, String)>,
    pub pid_file: Option<PathBuf>,
    pub respawn: bool,
    pub respawn_code_bits: RespawnBits,
    pub respawn_delay: Duration,
    pub max_respawn_cnt: u32,
    pub target: PathBuf,
    pub target_argv: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}: not a directory")]
    NotADirectory(PathBuf),
    #[error("target must be an absolute path")]
    TargetNotAbsolute,
    #[error("{0}: not a regular file")]
    TargetNotRegularFile(PathBuf),
    #[error("{0}: not executable")]
    TargetNotExecutable(PathBuf),
    #[error("invalid --env entry {0:?}: expected NAME=VALUE with a non-empty NAME")]
    InvalidEnv(String),
    #[error("invalid --respawn-code {0}: must be -1 or in 0..=127")]
    RespawnCodeOutOfRange(i64),
    #[error(transparent)]
    UnknownUser(#[from] UserError),
    #[error("{0}")]
    ArgParse(String),
}

/// The three-way outcome of parsing argv, matching the distilled spec's
/// `continue` / `exit-success` / `exit-failure` contract.
pub enum ParseOutcome {
    Continue(Box<Options>),
    /// `--help`/`--version` text to print to stdout before exiting 0.
    ExitSuccess(String),
    ExitFailure(ConfigError),
}

#[derive(Parser, Debug)]
#[command(name = "wardend", version, about = "Supervise a target executable under a respawn policy", disable_help_subcommand = true)]
pub struct Cli {
    /// Redirect the target's stdout to FILE (default: /dev/null)
    #[arg(short = 'o', long = "stdout", value_name = "FILE")]
    pub stdout_path: Option<PathBuf>,

    /// Redirect the target's stderr to FILE (default: /dev/null)
    #[arg(short = 'e', long = "stderr", value_name = "FILE")]
    pub stderr_path: Option<PathBuf>,

    /// Change the target's working directory to DIR
    #[arg(short = 'c', long = "chdir", value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Set an environment variable for the target, NAME=VALUE. Repeatable.
    #[arg(short = 'E', long = "env", value_name = "NAME=VALUE")]
    pub env: Vec<String>,

    /// Path to the pid/lock file enforcing single-instance execution
    #[arg(short = 'p', long = "pidfile", value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Automatically respawn the target on abnormal exit
    #[arg(short = 'r', long = "respawn")]
    pub respawn: bool,

    /// Respawn when the exit code equals CODE (-1 means "all codes").
    /// Repeatable; the first occurrence clears the default mask.
    #[arg(long = "respawn-code", value_name = "CODE", allow_hyphen_values = true)]
    pub respawn_code: Vec<i64>,

    /// Seconds to wait before respawning (default: 3)
    #[arg(long = "respawn-delay", value_name = "SECONDS")]
    pub respawn_delay: Option<u64>,

    /// Maximum respawn attempts (default: 0 = unlimited)
    #[arg(long = "max-respawns", value_name = "N")]
    pub max_respawns: Option<u32>,

    /// Drop privileges to this user account before exec'ing the target
    #[arg(long = "user", value_name = "NAME")]
    pub user: Option<String>,

    /// The target executable followed by its own arguments. Parsing stops
    /// at this point: anything after it, including flags, is passed
    /// through to the target untouched.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub target_args: Vec<String>,
}

impl Cli {
    /// Parses `args` (including `args[0]`, the program name) into a
    /// [`ParseOutcome`].
    pub fn parse_outcome<I, T>(args: I) -> ParseOutcome
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        match Cli::try_parse_from(args) {
            Ok(cli) => match cli.into_options() {
                Ok(options) => ParseOutcome::Continue(Box::new(options)),
                Err(err) => ParseOutcome::ExitFailure(err),
            },
            Err(err) => {
                use clap::error::ErrorKind;
                match err.kind() {
                    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                        ParseOutcome::ExitSuccess(err.render().to_string())
                    }
                    _ => ParseOutcome::ExitFailure(ConfigError::ArgParse(err.render().to_string())),
                }
            }
        }
    }

    /// Validates and resolves everything `Cli`'s syntax-only parse left
    /// unchecked: paths, the target, the user, and the respawn bitset.
    pub fn into_options(self) -> Result<Options, ConfigError> {
        let stdout_path = self
            .stdout_path
            .as_deref()
            .map(validate_sibling_path)
            .transpose()?;
        let stderr_path = self
            .stderr_path
            .as_deref()
            .map(validate_sibling_path)
            .transpose()?;
        let pid_file = self
            .pid_file
            .as_deref()
            .map(validate_sibling_path)
            .transpose()?;
        let working_dir = self
            .working_dir
            .as_deref()
            .map(validate_working_dir)
            .transpose()?;

        let target = validate_target(&self.target_args[0])?;
        let target_argv = self.target_args;

        let environments = self
            .env
            .iter()
            .map(|entry| parse_env_entry(entry))
            .collect::<Result<Vec<_>, _>>()?;

        let (run_user, home_dir, uid, gid) = match &self.user {
            None => (None, None, None, None),
            Some(name) => {
                let resolved = resolve_user(name)?;
                (
                    Some(name.clone()),
                    Some(resolved.home_dir),
                    Some(resolved.uid),
                    Some(resolved.gid),
                )
            }
        };

        let respawn_code_bits = build_respawn_bits(&self.respawn_code)?;

        Ok(Options {
            stdout_path,
            stderr_path,
            working_dir,
            run_user,
            home_dir,
            uid,
            gid,
            environments,
            pid_file,
            respawn: self.respawn,
            respawn_code_bits,
            respawn_delay: Duration::from_secs(self.respawn_delay.unwrap_or(3)),
            max_respawn_cnt: self.max_respawns.unwrap_or(0),
            target,
            target_argv,
        })
    }
}

/// Validates the *parent directory* of a file that may not exist yet
/// (stdout/stderr redirect targets, the pid file): the parent must exist
/// and be a searchable directory. Mirrors `option.c`'s
/// `general_parse_file`.
fn validate_sibling_path(path: &Path) -> Result<PathBuf, ConfigError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let canonical_parent = parent.canonicalize().map_err(|source| ConfigError::Io {
        path: parent.to_path_buf(),
        source,
    })?;

    ensure_searchable_directory(&canonical_parent)?;

    let file_name = path.file_name().ok_or_else(|| ConfigError::NotADirectory(path.to_path_buf()))?;

    Ok(canonical_parent.join(file_name))
}

/// Validates a directory the child will `chdir` into: it must exist and be
/// searchable. Mirrors `option.c`'s `parse_working_dir`.
fn validate_working_dir(path: &Path) -> Result<PathBuf, ConfigError> {
    let canonical = path.canonicalize().map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    ensure_searchable_directory(&canonical)?;

    Ok(canonical)
}

fn ensure_searchable_directory(path: &Path) -> Result<(), ConfigError> {
    let metadata = std::fs::metadata(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if !metadata.is_dir() {
        return Err(ConfigError::NotADirectory(path.to_path_buf()));
    }

    check_access(path, libc::X_OK)
}

/// Absolute-path, regular-file, executable checks for the target program.
/// Mirrors `option.c`'s `check_target`.
fn validate_target(raw: &str) -> Result<PathBuf, ConfigError> {
    let path = PathBuf::from(raw);

    if !path.is_absolute() {
        return Err(ConfigError::TargetNotAbsolute);
    }

    let metadata = std::fs::metadata(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;

    if !metadata.is_file() {
        return Err(ConfigError::TargetNotRegularFile(path));
    }

    check_access(&path, libc::X_OK).map_err(|_err| ConfigError::TargetNotExecutable(path.clone()))?;

    Ok(path)
}

fn check_access(path: &Path, mode: libc::c_int) -> Result<(), ConfigError> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_err| ConfigError::NotADirectory(path.to_path_buf()))?;

    let rc = unsafe { libc::access(c_path.as_ptr(), mode) };
    if rc != 0 {
        return Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::last_os_error(),
        });
    }

    Ok(())
}

fn parse_env_entry(entry: &str) -> Result<(String, String), ConfigError> {
    let Some((name, value)) = entry.split_once('=') else {
        return Err(ConfigError::InvalidEnv(entry.to_owned()));
    };

    if name.is_empty() || name.contains('=') {
        return Err(ConfigError::InvalidEnv(entry.to_owned()));
    }

    Ok((name.to_owned(), value.to_owned()))
}

/// Builds the effective respawn bitset from the repeated `--respawn-code`
/// values: the default mask unless at least one was given, in which case
/// the first clears the default and each (including the first) sets or
/// sets-all its own bit(s).
fn build_respawn_bits(codes: &[i64]) -> Result<RespawnBits, ConfigError> {
    if codes.is_empty() {
        return Ok(RespawnBits::DEFAULT);
    }

    let mut bits = RespawnBits::NONE;

    for &code in codes {
        if code == -1 {
            bits.set_all();
        } else if (0..=127).contains(&code) {
            bits.set(i32::try_from(code).expect("checked against 0..=127 above"));
        } else {
            return Err(ConfigError::RespawnCodeOutOfRange(code));
        }
    }

    Ok(bits)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{build_respawn_bits, parse_env_entry};
    use crate::respawn::RespawnBits;

    #[test]
    fn no_respawn_codes_uses_the_default_mask() {
        let bits = build_respawn_bits(&[]).unwrap();

        assert_eq!(bits, RespawnBits::DEFAULT);
    }

    #[test]
    fn first_explicit_code_clears_the_default_mask() {
        let bits = build_respawn_bits(&[42]).unwrap();

        assert_eq!(bits.contains(42), true);
        assert_eq!(bits.contains(7), false);
        assert_eq!(bits.contains(1), false);
    }

    #[test]
    fn subsequent_codes_or_into_the_cleared_mask() {
        let bits = build_respawn_bits(&[42, 7]).unwrap();

        assert_eq!(bits.contains(42), true);
        assert_eq!(bits.contains(7), true);
        assert_eq!(bits.contains(8), false);
    }

    #[test]
    fn minus_one_sets_every_code() {
        let bits = build_respawn_bits(&[-1]).unwrap();

        for code in 0..128 {
            assert_eq!(bits.contains(code), true);
        }
    }

    #[test]
    fn out_of_range_code_is_rejected() {
        assert!(build_respawn_bits(&[128]).is_err());
        assert!(build_respawn_bits(&[-2]).is_err());
    }

    #[test]
    fn env_entry_requires_nonempty_name() {
        assert_eq!(
            parse_env_entry("FOO=bar").unwrap(),
            ("FOO".to_owned(), "bar".to_owned())
        );
        assert_eq!(
            parse_env_entry("FOO=").unwrap(),
            ("FOO".to_owned(), String::new())
        );
        assert!(parse_env_entry("=bar").is_err());
        assert!(parse_env_entry("noequals").is_err());
    }
}
