//! Linux namespace management: clone flags, uid/gid mappings, and entry
//! into existing namespaces.

use std::os::unix::io::AsRawFd;
use std::path::Path;

use minidock_common::{MinidockError, MinidockResult};

use crate::sys;

/// Namespace name → CLONE flag, in the order `exec` joins them.
pub const NAMESPACE_TYPES: &[(&str, libc::c_int)] = &[
    ("user", libc::CLONE_NEWUSER),
    ("mnt", libc::CLONE_NEWNS),
    ("uts", libc::CLONE_NEWUTS),
    ("ipc", libc::CLONE_NEWIPC),
    ("net", libc::CLONE_NEWNET),
    ("pid", libc::CLONE_NEWPID),
];

/// Namespaces a pod pins and its members join instead of creating.
pub const POD_SHARED_NAMESPACES: &[(&str, libc::c_int)] = &[
    ("net", libc::CLONE_NEWNET),
    ("ipc", libc::CLONE_NEWIPC),
    ("uts", libc::CLONE_NEWUTS),
];

/// Which namespaces a launch creates.
#[derive(Debug, Clone, Default)]
pub struct NamespaceConfig {
    /// PID namespace.
    pub pid: bool,
    /// Mount namespace.
    pub mount: bool,
    /// UTS namespace.
    pub uts: bool,
    /// IPC namespace.
    pub ipc: bool,
    /// Network namespace.
    pub net: bool,
    /// User namespace (rootless mode).
    pub user: bool,
}

impl NamespaceConfig {
    /// The standard container set: pid + mount + uts + ipc, plus a network
    /// namespace unless the container joins a pod's, plus a user namespace
    /// in rootless mode.
    #[must_use]
    pub fn for_launch(new_net: bool, rootless: bool) -> Self {
        Self {
            pid: true,
            mount: true,
            uts: true,
            ipc: true,
            net: new_net,
            user: rootless,
        }
    }

    /// Combined CLONE flags.
    #[must_use]
    pub fn flags(&self) -> libc::c_int {
        let mut flags = 0;
        if self.pid {
            flags |= libc::CLONE_NEWPID;
        }
        if self.mount {
            flags |= libc::CLONE_NEWNS;
        }
        if self.uts {
            flags |= libc::CLONE_NEWUTS;
        }
        if self.ipc {
            flags |= libc::CLONE_NEWIPC;
        }
        if self.net {
            flags |= libc::CLONE_NEWNET;
        }
        if self.user {
            flags |= libc::CLONE_NEWUSER;
        }
        flags
    }
}

/// One uid/gid mapping range.
#[derive(Debug, Clone, Copy)]
pub struct IdMapping {
    /// Start of the range inside the namespace.
    pub inside: u32,
    /// Start of the range outside.
    pub outside: u32,
    /// Length of the range.
    pub size: u32,
}

impl IdMapping {
    /// Map namespace-root onto the invoking user.
    #[must_use]
    pub fn root_to(outside: u32) -> Self {
        Self {
            inside: 0,
            outside,
            size: 1,
        }
    }

    fn render(mappings: &[IdMapping]) -> String {
        mappings
            .iter()
            .map(|m| format!("{} {} {}", m.inside, m.outside, m.size))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Write `/proc/<pid>/uid_map`.
pub fn write_uid_map(pid: u32, mappings: &[IdMapping]) -> MinidockResult<()> {
    let path = format!("/proc/{pid}/uid_map");
    std::fs::write(&path, IdMapping::render(mappings))
        .map_err(|e| MinidockError::kernel("write(uid_map)", &e))?;
    tracing::debug!(pid, "Wrote uid_map");
    Ok(())
}

/// Write `/proc/<pid>/gid_map`, denying setgroups first as required for
/// unprivileged user namespaces.
pub fn write_gid_map(pid: u32, mappings: &[IdMapping]) -> MinidockResult<()> {
    let setgroups = format!("/proc/{pid}/setgroups");
    if Path::new(&setgroups).exists() {
        let _ = std::fs::write(&setgroups, "deny");
    }
    let path = format!("/proc/{pid}/gid_map");
    std::fs::write(&path, IdMapping::render(mappings))
        .map_err(|e| MinidockError::kernel("write(gid_map)", &e))?;
    tracing::debug!(pid, "Wrote gid_map");
    Ok(())
}

/// Join the namespace behind a handle path (a `/proc/<pid>/ns/*` file or a
/// pinned bind mount).
pub fn enter_path(path: &Path, nstype: libc::c_int) -> MinidockResult<()> {
    let file = std::fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MinidockError::StateConflict {
                message: format!("namespace handle is gone: {}", path.display()),
            }
        } else {
            MinidockError::Io(e)
        }
    })?;
    sys::setns(file.as_raw_fd(), nstype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_flags() {
        let config = NamespaceConfig::for_launch(true, false);
        let flags = config.flags();
        assert!(flags & libc::CLONE_NEWPID != 0);
        assert!(flags & libc::CLONE_NEWNS != 0);
        assert!(flags & libc::CLONE_NEWUTS != 0);
        assert!(flags & libc::CLONE_NEWIPC != 0);
        assert!(flags & libc::CLONE_NEWNET != 0);
        assert!(flags & libc::CLONE_NEWUSER == 0);
    }

    #[test]
    fn pod_member_flags_skip_shared() {
        let config = NamespaceConfig::for_launch(false, false);
        assert!(config.flags() & libc::CLONE_NEWNET == 0);
    }

    #[test]
    fn rootless_adds_user_namespace() {
        let config = NamespaceConfig::for_launch(true, true);
        assert!(config.flags() & libc::CLONE_NEWUSER != 0);
    }

    #[test]
    fn mapping_render() {
        let text = IdMapping::render(&[IdMapping::root_to(1000)]);
        assert_eq!(text, "0 1000 1");
    }

    #[test]
    fn missing_handle_is_state_conflict() {
        let err =
            enter_path(Path::new("/nonexistent/ns/net"), libc::CLONE_NEWNET).unwrap_err();
        assert!(matches!(err, MinidockError::StateConflict { .. }));
    }
}
