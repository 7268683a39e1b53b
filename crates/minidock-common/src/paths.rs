//! Standard filesystem paths for the mini-docker state store.
//!
//! Layout under the store root:
//!
//! ```text
//! containers/<id>/config.json
//! containers/<id>/state.json
//! containers/<id>/container.log
//! containers/<id>/rootfs/{lower,upper,work,merged}
//! pods/<id>/pod.json
//! pods/<id>/ns/{net,ipc,uts}
//! images/<name_tag>.json
//! network/leases.json
//! network/.lock
//! ```

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default store root, resolved once per process.
///
/// `MINI_DOCKER_HOST` overrides; otherwise `/var/lib/mini-docker` when the
/// effective uid is 0, else `$XDG_DATA_HOME/mini-docker`.
pub static DEFAULT_ROOT: Lazy<PathBuf> = Lazy::new(default_root);

fn default_root() -> PathBuf {
    if let Ok(root) = std::env::var("MINI_DOCKER_HOST") {
        return PathBuf::from(root);
    }
    // SAFETY: geteuid has no failure modes.
    if unsafe { libc::geteuid() } == 0 {
        return PathBuf::from("/var/lib/mini-docker");
    }
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_home.join("mini-docker")
}

/// Standard paths used by the runtime.
#[derive(Debug, Clone)]
pub struct StorePaths {
    /// Root data directory.
    pub root: PathBuf,
}

impl StorePaths {
    /// Paths rooted at the default location.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: DEFAULT_ROOT.clone(),
        }
    }

    /// Paths rooted at a custom directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for container state.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.containers().join(id)
    }

    /// Container config file.
    #[must_use]
    pub fn container_config(&self, id: &str) -> PathBuf {
        self.container(id).join("config.json")
    }

    /// Container state file.
    #[must_use]
    pub fn container_state(&self, id: &str) -> PathBuf {
        self.container(id).join("state.json")
    }

    /// Container log file (combined stdout + stderr).
    #[must_use]
    pub fn container_log(&self, id: &str) -> PathBuf {
        self.container(id).join("container.log")
    }

    /// Per-container advisory lock serialising stop/rm/exec.
    #[must_use]
    pub fn container_lock(&self, id: &str) -> PathBuf {
        self.container(id).join(".lock")
    }

    /// Base directory of the container's rootfs layers.
    #[must_use]
    pub fn container_rootfs(&self, id: &str) -> PathBuf {
        self.container(id).join("rootfs")
    }

    /// Overlay lower link, upper, work, and merged directories.
    #[must_use]
    pub fn overlay_dirs(&self, id: &str) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
        let base = self.container_rootfs(id);
        (
            base.join("lower"),
            base.join("upper"),
            base.join("work"),
            base.join("merged"),
        )
    }

    /// Directory for pods.
    #[must_use]
    pub fn pods(&self) -> PathBuf {
        self.root.join("pods")
    }

    /// Directory for a specific pod.
    #[must_use]
    pub fn pod(&self, id: &str) -> PathBuf {
        self.pods().join(id)
    }

    /// Pod config file.
    #[must_use]
    pub fn pod_config(&self, id: &str) -> PathBuf {
        self.pod(id).join("pod.json")
    }

    /// Directory holding a pod's pinned namespace handles.
    #[must_use]
    pub fn pod_ns_dir(&self, id: &str) -> PathBuf {
        self.pod(id).join("ns")
    }

    /// A pod's pinned namespace handle ("net", "ipc", or "uts").
    #[must_use]
    pub fn pod_ns(&self, id: &str, ns: &str) -> PathBuf {
        self.pod_ns_dir(id).join(ns)
    }

    /// Directory for image records and built image trees.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Image record file for `name:tag`.
    #[must_use]
    pub fn image_record(&self, name: &str, tag: &str) -> PathBuf {
        self.images().join(format!("{name}_{tag}.json"))
    }

    /// Directory for shared network state.
    #[must_use]
    pub fn network(&self) -> PathBuf {
        self.root.join("network")
    }

    /// The IP lease map.
    #[must_use]
    pub fn leases(&self) -> PathBuf {
        self.network().join("leases.json")
    }

    /// Advisory lock guarding bridge setup and the lease map.
    #[must_use]
    pub fn network_lock(&self) -> PathBuf {
        self.network().join(".lock")
    }

    /// Create the store skeleton.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.root.as_path(),
            &self.containers(),
            &self.pods(),
            &self.images(),
            &self.network(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Default for StorePaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root_layout() {
        let paths = StorePaths::with_root("/tmp/md-test");
        assert_eq!(
            paths.container_config("abc123def456"),
            PathBuf::from("/tmp/md-test/containers/abc123def456/config.json")
        );
        assert_eq!(
            paths.pod_ns("abc123def456", "net"),
            PathBuf::from("/tmp/md-test/pods/abc123def456/ns/net")
        );
        assert_eq!(
            paths.image_record("alpine", "latest"),
            PathBuf::from("/tmp/md-test/images/alpine_latest.json")
        );
        assert_eq!(paths.leases(), PathBuf::from("/tmp/md-test/network/leases.json"));
    }

    #[test]
    fn overlay_layout() {
        let paths = StorePaths::with_root("/tmp/md-test");
        let (lower, upper, work, merged) = paths.overlay_dirs("abc123def456");
        let base = PathBuf::from("/tmp/md-test/containers/abc123def456/rootfs");
        assert_eq!(lower, base.join("lower"));
        assert_eq!(upper, base.join("upper"));
        assert_eq!(work, base.join("work"));
        assert_eq!(merged, base.join("merged"));
    }

    #[test]
    fn create_dirs_builds_skeleton() {
        let temp = tempfile::tempdir().unwrap();
        let paths = StorePaths::with_root(temp.path());
        paths.create_dirs().unwrap();
        assert!(paths.containers().is_dir());
        assert!(paths.pods().is_dir());
        assert!(paths.images().is_dir());
        assert!(paths.network().is_dir());
    }
}
