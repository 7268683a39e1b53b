//! Common error types for the mini-docker runtime.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`MinidockError`].
pub type MinidockResult<T> = Result<T, MinidockError>;

/// Errors across the mini-docker runtime.
///
/// Each variant corresponds to one of the error kinds the runtime must
/// distinguish; [`MinidockError::exit_code`] maps them onto the CLI exit
/// codes.
#[derive(Error, Diagnostic, Debug)]
pub enum MinidockError {
    /// Malformed user input: a bad flag value, an unknown image, an
    /// unparsable limit.
    #[error("invalid configuration: {message}")]
    #[diagnostic(code(minidock::config::invalid))]
    ConfigInvalid {
        /// What was wrong with the input.
        message: String,
    },

    /// Container, pod, or image does not exist.
    #[error("no such {kind}: {id}")]
    #[diagnostic(code(minidock::state::not_found))]
    NotFound {
        /// "container", "pod", or "image".
        kind: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// A state-store conflict: duplicate name, ambiguous prefix, removing a
    /// running container without --force.
    #[error("{message}")]
    #[diagnostic(code(minidock::state::conflict))]
    StateConflict {
        /// Description of the conflict.
        message: String,
    },

    /// The kernel rejected a syscall. Carries the operation name and the
    /// symbolic errno.
    #[error("{op}: {errno}")]
    #[diagnostic(code(minidock::resource::kernel))]
    Kernel {
        /// The syscall or operation that failed.
        op: &'static str,
        /// Symbolic errno name (e.g. "EPERM").
        errno: &'static str,
    },

    /// Cgroup path missing or controller not enabled. Fatal in privileged
    /// mode; downgraded to a warning in rootless mode unless a limit was
    /// explicitly requested.
    #[error("cgroup: {message}")]
    #[diagnostic(code(minidock::resource::cgroup))]
    Cgroup {
        /// What failed.
        message: String,
    },

    /// A requested bind-mount host path does not exist.
    #[error("bind mount source does not exist: {path}")]
    #[diagnostic(
        code(minidock::fs::bind_missing),
        help("check the host side of the --volume argument")
    )]
    BindMissing {
        /// The missing host path.
        path: PathBuf,
    },

    /// Bridge or NAT setup failed.
    #[error("bridge unavailable: {message}")]
    #[diagnostic(code(minidock::net::bridge_unavailable))]
    BridgeUnavailable {
        /// What failed.
        message: String,
    },

    /// The child died before signalling readiness over the handshake pipe.
    #[error("container setup failed before exec: {detail}")]
    #[diagnostic(code(minidock::launch::handshake_broken))]
    HandshakeBroken {
        /// The one-line failure report the child wrote, or a description of
        /// how the pipe broke.
        detail: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(minidock::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    #[diagnostic(code(minidock::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {message}")]
    #[diagnostic(code(minidock::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl MinidockError {
    /// Construct a kernel error from the current `errno`.
    pub fn kernel_last(op: &'static str) -> Self {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::Kernel {
            op,
            errno: errno_name(code),
        }
    }

    /// Construct a kernel error from an `io::Error`.
    pub fn kernel(op: &'static str, err: &std::io::Error) -> Self {
        Self::Kernel {
            op,
            errno: errno_name(err.raw_os_error().unwrap_or(0)),
        }
    }

    /// Map the error kind onto the CLI exit code.
    ///
    /// 2 for invalid arguments, 125 for runtime errors that occur before the
    /// user command executes, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigInvalid { .. } => 2,
            Self::Kernel { .. }
            | Self::Cgroup { .. }
            | Self::BindMissing { .. }
            | Self::BridgeUnavailable { .. }
            | Self::HandshakeBroken { .. } => 125,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for MinidockError {
    fn from(err: serde_json::Error) -> Self {
        MinidockError::Serialization(err.to_string())
    }
}

/// Symbolic name for an errno value.
pub fn errno_name(code: i32) -> &'static str {
    match code {
        libc::EPERM => "EPERM",
        libc::ENOENT => "ENOENT",
        libc::ESRCH => "ESRCH",
        libc::EINTR => "EINTR",
        libc::EIO => "EIO",
        libc::E2BIG => "E2BIG",
        libc::EBADF => "EBADF",
        libc::ECHILD => "ECHILD",
        libc::EAGAIN => "EAGAIN",
        libc::ENOMEM => "ENOMEM",
        libc::EACCES => "EACCES",
        libc::EFAULT => "EFAULT",
        libc::EBUSY => "EBUSY",
        libc::EEXIST => "EEXIST",
        libc::EXDEV => "EXDEV",
        libc::ENODEV => "ENODEV",
        libc::ENOTDIR => "ENOTDIR",
        libc::EISDIR => "EISDIR",
        libc::EINVAL => "EINVAL",
        libc::ENFILE => "ENFILE",
        libc::EMFILE => "EMFILE",
        libc::ENOSPC => "ENOSPC",
        libc::EROFS => "EROFS",
        libc::EMLINK => "EMLINK",
        libc::EPIPE => "EPIPE",
        libc::ERANGE => "ERANGE",
        libc::ENAMETOOLONG => "ENAMETOOLONG",
        libc::ENOSYS => "ENOSYS",
        libc::ENOTEMPTY => "ENOTEMPTY",
        libc::ELOOP => "ELOOP",
        libc::EOPNOTSUPP => "EOPNOTSUPP",
        libc::EOVERFLOW => "EOVERFLOW",
        libc::ETIMEDOUT => "ETIMEDOUT",
        0 => "OK",
        _ => "errno",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MinidockError::NotFound {
            kind: "container",
            id: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "no such container: abc123");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MinidockError = io_err.into();
        assert!(matches!(err, MinidockError::Io(_)));
    }

    #[test]
    fn exit_codes() {
        assert_eq!(
            MinidockError::ConfigInvalid {
                message: "bad".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            MinidockError::Kernel {
                op: "clone",
                errno: "EPERM"
            }
            .exit_code(),
            125
        );
        assert_eq!(
            MinidockError::StateConflict {
                message: "dup".into()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn errno_names() {
        assert_eq!(errno_name(libc::EPERM), "EPERM");
        assert_eq!(errno_name(libc::ENOENT), "ENOENT");
        assert_eq!(errno_name(-1), "errno");
    }
}
