//! Thin typed wrappers over the Linux syscalls the launcher needs.
//!
//! Every operation maps to a single syscall and reports the underlying
//! errno symbolically via [`MinidockError::Kernel`]. No other I/O happens
//! here.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use minidock_common::{MinidockError, MinidockResult};

/// Outcome of a `waitpid` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Child exited normally with this code.
    Exited(i32),
    /// Child was killed by this signal.
    Signaled(i32),
    /// Child is still running (WNOHANG).
    StillRunning,
}

impl WaitOutcome {
    /// CLI exit code for the outcome: the code itself, or `128 + signal`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(sig) => 128 + sig,
            Self::StillRunning => 0,
        }
    }
}

fn cstring(path: &Path) -> MinidockResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| MinidockError::ConfigInvalid {
        message: format!("path contains a NUL byte: {}", path.display()),
    })
}

/// `unshare(2)` with the given CLONE_NEW* flags.
pub fn unshare(flags: libc::c_int) -> MinidockResult<()> {
    // SAFETY: plain syscall, flags validated by the kernel.
    if unsafe { libc::unshare(flags) } != 0 {
        return Err(MinidockError::kernel_last("unshare"));
    }
    Ok(())
}

/// `setns(2)`: join the namespace referred to by `fd`.
pub fn setns(fd: libc::c_int, nstype: libc::c_int) -> MinidockResult<()> {
    // SAFETY: fd ownership stays with the caller.
    if unsafe { libc::setns(fd, nstype) } != 0 {
        return Err(MinidockError::kernel_last("setns"));
    }
    Ok(())
}

/// `clone(2)` used as a fork that places the child in new namespaces.
///
/// Returns the child pid in the parent and 0 in the child, exactly like
/// `fork`. The child is PID 1 of the new PID namespace when
/// `CLONE_NEWPID` is among the flags.
pub fn clone_with_namespaces(flags: libc::c_int) -> MinidockResult<i32> {
    // SAFETY: stack pointer 0 makes clone behave like fork (copy-on-write
    // stack); the remaining tid/tls arguments are unused.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone,
            (flags as libc::c_long) | (libc::SIGCHLD as libc::c_long),
            0usize,
            0usize,
            0usize,
            0usize,
        )
    };
    if ret < 0 {
        return Err(MinidockError::kernel_last("clone"));
    }
    Ok(ret as i32)
}

/// Plain `fork(2)`.
pub fn fork() -> MinidockResult<i32> {
    // SAFETY: standard fork; callers are single-threaded at this point.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(MinidockError::kernel_last("fork"));
    }
    Ok(pid)
}

/// `pivot_root(2)`.
pub fn pivot_root(new_root: &Path, put_old: &Path) -> MinidockResult<()> {
    let new_root = cstring(new_root)?;
    let put_old = cstring(put_old)?;
    // SAFETY: both paths are valid C strings.
    let ret = unsafe { libc::syscall(libc::SYS_pivot_root, new_root.as_ptr(), put_old.as_ptr()) };
    if ret != 0 {
        return Err(MinidockError::kernel_last("pivot_root"));
    }
    Ok(())
}

/// `chroot(2)`.
pub fn chroot(path: &Path) -> MinidockResult<()> {
    let path = cstring(path)?;
    // SAFETY: valid C string.
    if unsafe { libc::chroot(path.as_ptr()) } != 0 {
        return Err(MinidockError::kernel_last("chroot"));
    }
    Ok(())
}

/// `sethostname(2)`.
pub fn sethostname(name: &str) -> MinidockResult<()> {
    // SAFETY: pointer and length describe the same buffer.
    if unsafe { libc::sethostname(name.as_ptr().cast(), name.len()) } != 0 {
        return Err(MinidockError::kernel_last("sethostname"));
    }
    Ok(())
}

/// `umount2(2)`.
pub fn umount2(target: &Path, flags: libc::c_int) -> MinidockResult<()> {
    let target = cstring(target)?;
    // SAFETY: valid C string.
    if unsafe { libc::umount2(target.as_ptr(), flags) } != 0 {
        return Err(MinidockError::kernel_last("umount2"));
    }
    Ok(())
}

/// Raw `mount(2)`, used where the flag set (MS_REC | MS_PRIVATE) has no
/// rustix equivalent.
pub fn mount_raw(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> MinidockResult<()> {
    let source = match source {
        Some(p) => Some(cstring(p)?),
        None => None,
    };
    let target = cstring(target)?;
    let fstype = match fstype {
        Some(s) => Some(CString::new(s).expect("no NUL in fstype")),
        None => None,
    };
    let data = match data {
        Some(s) => Some(CString::new(s).expect("no NUL in mount data")),
        None => None,
    };

    // SAFETY: all pointers are either null or valid C strings for the call.
    let ret = unsafe {
        libc::mount(
            source.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            target.as_ptr(),
            fstype.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            data.as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr().cast()),
        )
    };
    if ret != 0 {
        return Err(MinidockError::kernel_last("mount"));
    }
    Ok(())
}

/// `mknod(2)` for a character device.
pub fn mknod_char(path: &Path, major: u32, minor: u32, mode: u32) -> MinidockResult<()> {
    let path = cstring(path)?;
    // SAFETY: valid C string; makedev composes the device number.
    let ret = unsafe {
        libc::mknod(
            path.as_ptr(),
            libc::S_IFCHR | mode,
            libc::makedev(major, minor),
        )
    };
    if ret != 0 {
        return Err(MinidockError::kernel_last("mknod"));
    }
    Ok(())
}

/// `prctl(PR_SET_NO_NEW_PRIVS, 1)`.
pub fn set_no_new_privs() -> MinidockResult<()> {
    // SAFETY: plain prctl.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(MinidockError::kernel_last("prctl(PR_SET_NO_NEW_PRIVS)"));
    }
    Ok(())
}

/// `prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL)`.
pub fn clear_ambient_caps() -> MinidockResult<()> {
    // SAFETY: plain prctl.
    if unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        )
    } != 0
    {
        return Err(MinidockError::kernel_last("prctl(PR_CAP_AMBIENT)"));
    }
    Ok(())
}

/// `setresgid(2)`.
pub fn setresgid(gid: u32) -> MinidockResult<()> {
    // SAFETY: plain syscall.
    if unsafe { libc::setresgid(gid, gid, gid) } != 0 {
        return Err(MinidockError::kernel_last("setresgid"));
    }
    Ok(())
}

/// `setresuid(2)`.
pub fn setresuid(uid: u32) -> MinidockResult<()> {
    // SAFETY: plain syscall.
    if unsafe { libc::setresuid(uid, uid, uid) } != 0 {
        return Err(MinidockError::kernel_last("setresuid"));
    }
    Ok(())
}

/// `setsid(2)`.
pub fn setsid() -> MinidockResult<()> {
    // SAFETY: plain syscall.
    if unsafe { libc::setsid() } < 0 {
        return Err(MinidockError::kernel_last("setsid"));
    }
    Ok(())
}

/// `dup2(2)`.
pub fn dup2(old_fd: libc::c_int, new_fd: libc::c_int) -> MinidockResult<()> {
    // SAFETY: fd validity checked by the kernel.
    if unsafe { libc::dup2(old_fd, new_fd) } < 0 {
        return Err(MinidockError::kernel_last("dup2"));
    }
    Ok(())
}

/// `kill(2)`.
pub fn kill(pid: i32, signal: libc::c_int) -> MinidockResult<()> {
    // SAFETY: plain syscall.
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(MinidockError::kernel_last("kill"));
    }
    Ok(())
}

/// True when a process with this pid exists (signal 0 probe).
#[must_use]
pub fn process_exists(pid: i32) -> bool {
    // SAFETY: signal 0 performs existence/permission checks only.
    unsafe { libc::kill(pid, 0) == 0 || *libc::__errno_location() == libc::EPERM }
}

/// `waitpid(2)`, retrying on EINTR.
pub fn waitpid(pid: i32, nohang: bool) -> MinidockResult<WaitOutcome> {
    let options = if nohang { libc::WNOHANG } else { 0 };
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status out-pointer is valid.
        let ret = unsafe { libc::waitpid(pid, &mut status, options) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(MinidockError::kernel("waitpid", &err));
        }
        if ret == 0 {
            return Ok(WaitOutcome::StillRunning);
        }
        return Ok(if libc::WIFEXITED(status) {
            WaitOutcome::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            WaitOutcome::Signaled(libc::WTERMSIG(status))
        } else {
            WaitOutcome::Exited(1)
        });
    }
}

/// `execvp(3)`. Only returns on failure; the caller maps errno onto the
/// 126/127 convention.
pub fn execvp(argv: &[String]) -> MinidockError {
    let c_args: Vec<CString> = argv
        .iter()
        .filter_map(|a| CString::new(a.as_bytes()).ok())
        .collect();
    if c_args.len() != argv.len() || c_args.is_empty() {
        return MinidockError::ConfigInvalid {
            message: "command contains a NUL byte or is empty".to_string(),
        };
    }
    let mut ptrs: Vec<*const libc::c_char> = c_args.iter().map(|a| a.as_ptr()).collect();
    ptrs.push(std::ptr::null());

    // SAFETY: argv is a NULL-terminated array of valid C strings.
    unsafe { libc::execvp(ptrs[0], ptrs.as_ptr()) };
    MinidockError::kernel_last("execve")
}

/// Start time of a process in clock ticks, read from field 22 of
/// `/proc/<pid>/stat`. `None` when the process is gone.
#[must_use]
pub fn proc_start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parentheses; fields resume after the
    // last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_start_time_is_readable() {
        let ticks = proc_start_time(std::process::id()).unwrap();
        assert!(ticks > 0);
    }

    #[test]
    fn missing_process_has_no_start_time() {
        assert_eq!(proc_start_time(u32::MAX - 1), None);
    }

    #[test]
    fn own_process_exists() {
        assert!(process_exists(std::process::id() as i32));
    }

    #[test]
    fn wait_outcome_exit_codes() {
        assert_eq!(WaitOutcome::Exited(3).exit_code(), 3);
        assert_eq!(WaitOutcome::Signaled(libc::SIGKILL).exit_code(), 137);
        assert_eq!(WaitOutcome::Signaled(libc::SIGTERM).exit_code(), 143);
    }

    #[test]
    fn fork_and_wait_child() {
        let pid = fork().unwrap();
        if pid == 0 {
            // SAFETY: immediate exit from the child.
            unsafe { libc::_exit(7) };
        }
        assert_eq!(waitpid(pid, false).unwrap(), WaitOutcome::Exited(7));
    }
}
