//! Network namespace helpers.

use std::path::PathBuf;

use minidock_common::{MinidockError, MinidockResult};

/// Path to a namespace handle of a live process.
#[must_use]
pub fn ns_path(pid: u32, ns: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/{ns}"))
}

/// Bring the loopback interface up in the calling process's network
/// namespace.
///
/// Implemented with `SIOCGIFFLAGS`/`SIOCSIFFLAGS` ioctls so it works inside
/// a freshly created namespace with no `ip` binary in reach.
pub fn loopback_up() -> MinidockResult<()> {
    // SAFETY: plain socket/ioctl sequence on a zeroed ifreq for "lo"; the
    // fd is closed on every path.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(MinidockError::kernel_last("socket"));
        }

        let mut req: libc::ifreq = std::mem::zeroed();
        for (dst, src) in req.ifr_name.iter_mut().zip(b"lo\0") {
            *dst = *src as libc::c_char;
        }

        if libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut req) < 0 {
            let err = MinidockError::kernel_last("ioctl(SIOCGIFFLAGS)");
            libc::close(fd);
            return Err(err);
        }

        req.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;

        if libc::ioctl(fd, libc::SIOCSIFFLAGS, &req) < 0 {
            let err = MinidockError::kernel_last("ioctl(SIOCSIFFLAGS)");
            libc::close(fd);
            return Err(err);
        }

        libc::close(fd);
    }

    tracing::debug!("Loopback up");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ns_path_format() {
        assert_eq!(
            ns_path(42, "net"),
            PathBuf::from("/proc/42/ns/net")
        );
    }
}
