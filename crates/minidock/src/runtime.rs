//! Per-invocation runtime configuration.
//!
//! One `Runtime` is constructed in `main` and passed downward; nothing here
//! is process-global.

use minidock_common::StorePaths;

/// What this process is allowed to do, computed once at startup and queried
/// at each decision point instead of re-checking uids across the codebase.
#[derive(Debug, Clone)]
pub struct CapabilityProfile {
    /// Effective uid of the process.
    pub euid: u32,
    /// Operating in rootless mode (requested or forced by non-root euid).
    pub rootless: bool,
    /// May mount filesystems outside a user namespace.
    pub can_mount: bool,
    /// May write the system cgroup hierarchy.
    pub can_write_cgroups: bool,
    /// May create bridges, veth pairs, and NAT rules.
    pub can_manage_network: bool,
}

impl CapabilityProfile {
    /// Detect the profile for this invocation.
    #[must_use]
    pub fn detect(rootless_requested: bool) -> Self {
        // SAFETY: geteuid has no failure modes.
        let euid = unsafe { libc::geteuid() };
        let rootless = rootless_requested || euid != 0;
        Self {
            euid,
            rootless,
            can_mount: !rootless,
            can_write_cgroups: !rootless,
            can_manage_network: !rootless,
        }
    }
}

/// Runtime context threaded through every component.
#[derive(Debug, Clone)]
pub struct Runtime {
    /// State-store paths.
    pub paths: StorePaths,
    /// Capability profile for this invocation.
    pub profile: CapabilityProfile,
    /// Verbose diagnostics requested.
    pub debug: bool,
}

impl Runtime {
    /// Build a runtime rooted at the default store location.
    #[must_use]
    pub fn new(rootless: bool, debug: bool) -> Self {
        Self {
            paths: StorePaths::new(),
            profile: CapabilityProfile::detect(rootless),
            debug,
        }
    }

    /// Build a runtime with a custom store root.
    #[must_use]
    pub fn with_root(root: impl Into<std::path::PathBuf>, rootless: bool, debug: bool) -> Self {
        Self {
            paths: StorePaths::with_root(root),
            profile: CapabilityProfile::detect(rootless),
            debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rootless_request_forces_rootless_profile() {
        let profile = CapabilityProfile::detect(true);
        assert!(profile.rootless);
        assert!(!profile.can_mount);
        assert!(!profile.can_write_cgroups);
        assert!(!profile.can_manage_network);
    }

    #[test]
    fn non_root_euid_is_rootless() {
        let profile = CapabilityProfile::detect(false);
        if profile.euid != 0 {
            assert!(profile.rootless);
        } else {
            assert!(!profile.rootless);
        }
    }
}
