//! PTY allocation and terminal raw mode for `--tty`.

#![allow(unsafe_code)]

use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use minidock_common::{MinidockError, MinidockResult};

/// A master/slave PTY pair.
pub struct Pty {
    /// Parent-side master.
    pub master: OwnedFd,
    /// Slave handed to the child as stdin/stdout/stderr.
    pub slave: OwnedFd,
}

/// Allocate a PTY pair.
pub fn open_pty() -> MinidockResult<Pty> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;

    // SAFETY: out-pointers are valid; name/termios/winsize may be null.
    let ret = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null(),
            std::ptr::null(),
        )
    };
    if ret != 0 {
        return Err(MinidockError::kernel_last("openpty"));
    }

    // The raw pair must not leak into the exec'd command; the dup2'd
    // copies on 0/1/2 survive.
    // SAFETY: openpty returned two fresh fds we now own.
    unsafe {
        libc::fcntl(master, libc::F_SETFD, libc::FD_CLOEXEC);
        libc::fcntl(slave, libc::F_SETFD, libc::FD_CLOEXEC);
        Ok(Pty {
            master: OwnedFd::from_raw_fd(master),
            slave: OwnedFd::from_raw_fd(slave),
        })
    }
}

/// Make the slave the controlling terminal of the calling session. The
/// child runs this after `setsid`.
pub fn set_controlling_tty(slave: RawFd) -> MinidockResult<()> {
    // SAFETY: plain ioctl on a valid fd.
    if unsafe { libc::ioctl(slave, libc::TIOCSCTTY as _, 0) } != 0 {
        return Err(MinidockError::kernel_last("ioctl(TIOCSCTTY)"));
    }
    Ok(())
}

/// Puts the invoking terminal into raw mode, restoring it on drop.
pub struct RawModeGuard {
    fd: RawFd,
    saved: libc::termios,
}

impl RawModeGuard {
    /// Enter raw mode on `fd` if it is a terminal.
    #[must_use]
    pub fn new(fd: RawFd) -> Option<Self> {
        // SAFETY: isatty/tcgetattr/tcsetattr on a caller-owned fd.
        unsafe {
            if libc::isatty(fd) != 1 {
                return None;
            }
            let mut saved: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut saved) != 0 {
                return None;
            }
            let mut raw = saved;
            libc::cfmakeraw(&mut raw);
            if libc::tcsetattr(fd, libc::TCSANOW, &raw) != 0 {
                return None;
            }
            Some(Self { fd, saved })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // SAFETY: restoring the attributes we saved.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn pty_pair_opens() {
        let pty = open_pty().unwrap();
        assert!(pty.master.as_raw_fd() >= 0);
        assert!(pty.slave.as_raw_fd() >= 0);
        // SAFETY: fd validity probe.
        assert_eq!(unsafe { libc::isatty(pty.slave.as_raw_fd()) }, 1);
    }

    #[test]
    fn raw_mode_on_non_tty_is_none() {
        let file = std::fs::File::open("/dev/null").unwrap();
        assert!(RawModeGuard::new(file.as_raw_fd()).is_none());
    }
}
