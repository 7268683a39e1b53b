//! Container configuration and runtime state records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use minidock_common::{Limits, MinidockError, MinidockResult};
use serde::{Deserialize, Serialize};

/// Container lifecycle status.
///
/// ```text
/// created --run--> running --exit--> exited --rm--> (gone)
///                     |
///                     +--orphaned--> dead --rm--> (gone)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Configured but never started.
    Created,
    /// Host process alive.
    Running,
    /// Exited with a recorded code.
    Exited,
    /// Host process disappeared without a recorded exit.
    Dead,
}

impl ContainerStatus {
    /// Counted as "live" for name-uniqueness purposes.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !matches!(self, Self::Dead)
    }

    /// May be removed without `--force`.
    #[must_use]
    pub const fn can_remove(&self) -> bool {
        matches!(self, Self::Created | Self::Exited | Self::Dead)
    }

    /// May be started.
    #[must_use]
    pub const fn can_start(&self) -> bool {
        matches!(self, Self::Created)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// How the container's root was constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootfsMode {
    /// OverlayFS: image as lower, per-container upper/work.
    Overlay,
    /// Bind-mount fallback (also used by chroot-only mode).
    Bind,
}

/// Network mode of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum NetMode {
    /// New namespace with loopback only.
    None,
    /// New namespace wired to the host bridge.
    Bridge,
    /// Join a pod's pinned network namespace.
    Pod {
        /// The pod id.
        pod_id: String,
    },
}

impl NetMode {
    /// Whether the launch creates a fresh network namespace.
    #[must_use]
    pub fn creates_namespace(&self) -> bool {
        !matches!(self, Self::Pod { .. })
    }
}

/// One user bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Host side.
    pub host_path: PathBuf,
    /// Target inside the container.
    pub container_path: PathBuf,
    /// Remount read-only after binding.
    pub read_only: bool,
}

/// Persistent container configuration (`config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// 12-hex container id.
    pub id: String,
    /// Human-unique name among live containers.
    pub name: String,
    /// Absolute path to the read-only image root.
    pub image_root: PathBuf,
    /// Command and arguments executed as PID 1.
    pub argv: Vec<String>,
    /// Environment, ordered `KEY=VALUE` strings.
    pub env: Vec<String>,
    /// Initial working directory.
    pub workdir: PathBuf,
    /// `uid[:gid]` to run as, numeric.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// UTS hostname.
    pub hostname: String,
    /// Resource limits.
    #[serde(default)]
    pub limits: Limits,
    /// User bind mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<BindMount>,
    /// Network mode.
    pub net_mode: NetMode,
    /// Requested rootfs mode.
    pub rootfs_mode: RootfsMode,
    /// Rootless operating mode.
    pub rootless: bool,
    /// Pod membership.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<String>,
    /// Leased bridge address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ContainerConfig {
    /// Parse the `user` field into numeric (uid, gid).
    pub fn parse_user(&self) -> MinidockResult<Option<(u32, u32)>> {
        let Some(user) = &self.user else {
            return Ok(None);
        };
        let invalid = || MinidockError::ConfigInvalid {
            message: format!("invalid --user (need uid[:gid]): {user}"),
        };
        let (uid_str, gid_str) = match user.split_once(':') {
            Some((u, g)) => (u, Some(g)),
            None => (user.as_str(), None),
        };
        let uid: u32 = uid_str.parse().map_err(|_| invalid())?;
        let gid: u32 = match gid_str {
            Some(g) => g.parse().map_err(|_| invalid())?,
            None => uid,
        };
        Ok(Some((uid, gid)))
    }
}

/// Mutable runtime state (`state.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    /// Container id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Lifecycle status.
    pub status: ContainerStatus,
    /// Host pid of PID 1, valid iff running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// `/proc/<pid>/stat` start time, guards against pid reuse.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time_ticks: Option<u64>,
    /// Exit code, valid iff exited or dead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Exit time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Rootfs mode actually used (overlay may have fallen back).
    pub rootfs_mode: RootfsMode,
}

impl ContainerState {
    /// Fresh state for a just-created container.
    #[must_use]
    pub fn new(config: &ContainerConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            status: ContainerStatus::Created,
            pid: None,
            start_time_ticks: None,
            exit_code: None,
            created_at: config.created_at,
            started_at: None,
            finished_at: None,
            rootfs_mode: config.rootfs_mode,
        }
    }

    /// Transition to running.
    pub fn set_running(&mut self, pid: u32, start_time_ticks: Option<u64>) {
        self.status = ContainerStatus::Running;
        self.pid = Some(pid);
        self.start_time_ticks = start_time_ticks;
        self.started_at = Some(Utc::now());
        self.exit_code = None;
        self.finished_at = None;
    }

    /// Transition to exited with a code.
    pub fn set_exited(&mut self, exit_code: i32) {
        self.status = ContainerStatus::Exited;
        self.exit_code = Some(exit_code);
        self.finished_at = Some(Utc::now());
        self.pid = None;
        self.start_time_ticks = None;
    }

    /// Transition to dead (orphaned without a recorded exit).
    pub fn set_dead(&mut self) {
        self.status = ContainerStatus::Dead;
        self.finished_at = Some(Utc::now());
        self.pid = None;
        self.start_time_ticks = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ContainerConfig {
        ContainerConfig {
            id: "a1b2c3d4e5f6".to_string(),
            name: "web".to_string(),
            image_root: "/images/base".into(),
            argv: vec!["/bin/sh".to_string()],
            env: Vec::new(),
            workdir: "/".into(),
            user: None,
            hostname: "a1b2c3d4e5f6".to_string(),
            limits: Limits::default(),
            mounts: Vec::new(),
            net_mode: NetMode::None,
            rootfs_mode: RootfsMode::Overlay,
            rootless: false,
            pod_id: None,
            ip: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_transitions() {
        let config = config();
        let mut state = ContainerState::new(&config);
        assert_eq!(state.status, ContainerStatus::Created);
        assert!(state.status.can_start());

        state.set_running(4242, Some(100));
        assert_eq!(state.status, ContainerStatus::Running);
        assert_eq!(state.pid, Some(4242));
        assert!(!state.status.can_remove());

        state.set_exited(143);
        assert_eq!(state.status, ContainerStatus::Exited);
        assert_eq!(state.exit_code, Some(143));
        assert_eq!(state.pid, None);
        assert!(state.status.can_remove());
    }

    #[test]
    fn dead_is_not_live() {
        let mut state = ContainerState::new(&config());
        state.set_running(1, None);
        state.set_dead();
        assert!(!state.status.is_live());
        assert!(state.status.can_remove());
    }

    #[test]
    fn user_parsing() {
        let mut c = config();
        assert_eq!(c.parse_user().unwrap(), None);

        c.user = Some("1000".to_string());
        assert_eq!(c.parse_user().unwrap(), Some((1000, 1000)));

        c.user = Some("1000:2000".to_string());
        assert_eq!(c.parse_user().unwrap(), Some((1000, 2000)));

        c.user = Some("alice".to_string());
        assert!(c.parse_user().is_err());
    }

    #[test]
    fn net_mode_serde() {
        let json = serde_json::to_string(&NetMode::Pod {
            pod_id: "abc".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"mode\":\"pod\""));
        let back: NetMode = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back,
            NetMode::Pod {
                pod_id: "abc".to_string()
            }
        );
        assert!(!back.creates_namespace());
        assert!(NetMode::Bridge.creates_namespace());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ContainerStatus::Exited).unwrap();
        assert_eq!(json, "\"exited\"");
    }
}
