//! Container security: capability drop, NO_NEW_PRIVS, seccomp filter.
//!
//! Ordering is load-bearing: capabilities are dropped after all mounts and
//! cgroup writes; NO_NEW_PRIVS is set before the seccomp install, which
//! happens last before `execve`.

mod capabilities;
mod seccomp;

pub use capabilities::{apply_container_caps, KEPT_CAPABILITIES};
pub use seccomp::{allowed_syscalls, forbidden_syscalls, install_filter};

use minidock_common::MinidockResult;

use crate::sys;

/// Apply the full pre-exec security sequence: drop capabilities, switch to
/// the requested uid/gid, set NO_NEW_PRIVS, install seccomp.
pub fn apply_pre_exec(user: Option<(u32, u32)>, rootless: bool) -> MinidockResult<()> {
    match apply_container_caps() {
        Ok(()) => {}
        Err(e) if rootless => {
            tracing::warn!(error = %e, "Capability drop failed in rootless mode");
        }
        Err(e) => return Err(e),
    }

    if let Some((uid, gid)) = user {
        sys::setresgid(gid)?;
        sys::setresuid(uid)?;
    }

    sys::set_no_new_privs()?;
    install_filter()?;
    Ok(())
}
