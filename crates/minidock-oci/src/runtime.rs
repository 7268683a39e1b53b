//! OCI runtime configuration types.
//!
//! Based on the OCI Runtime Specification:
//! <https://github.com/opencontainers/runtime-spec/blob/main/config.md>
//!
//! Only the fields the launcher consumes are modelled; everything else in a
//! bundle's `config.json` is ignored.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// OCI runtime configuration (`config.json`), launcher subset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// OCI version string.
    #[serde(default)]
    pub oci_version: String,

    /// Container root filesystem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,

    /// Container process configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,

    /// Container hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Additional mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    /// Linux-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

/// Root filesystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    /// Path to the root filesystem, absolute or relative to the bundle.
    pub path: PathBuf,

    /// Whether the root filesystem is read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// Process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Whether to run with a terminal.
    #[serde(default)]
    pub terminal: bool,

    /// User to run as.
    #[serde(default)]
    pub user: User,

    /// Command and arguments.
    pub args: Vec<String>,

    /// Environment, `KEY=VALUE` strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Working directory.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,

    /// No new privileges flag.
    #[serde(default)]
    pub no_new_privileges: bool,
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

/// User and group IDs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    /// User ID.
    #[serde(default)]
    pub uid: u32,
    /// Group ID.
    #[serde(default)]
    pub gid: u32,
}

/// A mount entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    /// Mount destination inside the container.
    pub destination: PathBuf,
    /// Mount type ("bind", "proc", "tmpfs", ...).
    #[serde(default, rename = "type")]
    pub mount_type: String,
    /// Mount source.
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Mount options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Mount {
    /// True for user bind mounts the filesystem builder applies.
    #[must_use]
    pub fn is_bind(&self) -> bool {
        self.mount_type == "bind" || self.options.iter().any(|o| o == "bind" || o == "rbind")
    }

    /// True when the options request a read-only mount.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Linux {
    /// Namespaces to create or join.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<LinuxNamespace>,

    /// Resource limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<LinuxResources>,
}

/// A namespace entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinuxNamespace {
    /// Namespace type.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Existing namespace path to join, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Namespace types the launcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// PID namespace.
    Pid,
    /// Mount namespace.
    Mount,
    /// UTS namespace.
    Uts,
    /// IPC namespace.
    Ipc,
    /// Network namespace.
    Network,
    /// User namespace.
    User,
    /// Cgroup namespace (accepted, not created).
    Cgroup,
}

/// Resource limits subset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinuxResources {
    /// Memory limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryLimit>,
    /// CPU limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuLimit>,
    /// PID limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<PidsLimit>,
}

/// Memory limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryLimit {
    /// Limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

/// CPU limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuLimit {
    /// Quota in microseconds per period.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    /// Period in microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

/// Maximum number of tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PidsLimit {
    /// The limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let json = r#"{
            "ociVersion": "1.0.2",
            "process": {"args": ["/bin/sh"], "cwd": "/"},
            "root": {"path": "rootfs"}
        }"#;
        let spec: Spec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.process.unwrap().args, vec!["/bin/sh"]);
        assert_eq!(spec.root.unwrap().path, PathBuf::from("rootfs"));
    }

    #[test]
    fn ignores_unknown_fields() {
        let json = r#"{
            "ociVersion": "1.0.2",
            "process": {"args": ["/bin/true"], "cwd": "/", "apparmorProfile": "x"},
            "root": {"path": "rootfs"},
            "annotations": {"a": "b"},
            "windows": {"servicing": true}
        }"#;
        let spec: Spec = serde_json::from_str(json).unwrap();
        assert!(spec.hostname.is_none());
    }

    #[test]
    fn parses_namespaces_and_resources() {
        let json = r#"{
            "linux": {
                "namespaces": [
                    {"type": "pid"},
                    {"type": "network", "path": "/proc/123/ns/net"},
                    {"type": "mount"}
                ],
                "resources": {
                    "memory": {"limit": 20971520},
                    "cpu": {"quota": 50000, "period": 100000},
                    "pids": {"limit": 64}
                }
            }
        }"#;
        let spec: Spec = serde_json::from_str(json).unwrap();
        let linux = spec.linux.unwrap();
        assert_eq!(linux.namespaces.len(), 3);
        assert_eq!(linux.namespaces[0].ns_type, NamespaceType::Pid);
        assert_eq!(
            linux.namespaces[1].path.as_deref(),
            Some(std::path::Path::new("/proc/123/ns/net"))
        );
        let resources = linux.resources.unwrap();
        assert_eq!(resources.memory.unwrap().limit, Some(20_971_520));
        assert_eq!(resources.cpu.unwrap().quota, Some(50_000));
        assert_eq!(resources.pids.unwrap().limit, Some(64));
    }

    #[test]
    fn bind_mount_detection() {
        let mount = Mount {
            destination: PathBuf::from("/data"),
            mount_type: "bind".to_string(),
            source: Some(PathBuf::from("/host/data")),
            options: vec!["ro".to_string()],
        };
        assert!(mount.is_bind());
        assert!(mount.is_readonly());

        let proc_mount = Mount {
            destination: PathBuf::from("/proc"),
            mount_type: "proc".to_string(),
            source: None,
            options: vec![],
        };
        assert!(!proc_mount.is_bind());
    }
}
