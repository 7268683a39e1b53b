//! Pods: groups of containers sharing network, IPC, and UTS namespaces.
//!
//! The shared namespaces are kept alive by "pinning": a short-lived
//! placeholder process unshares them, the parent bind-mounts
//! `/proc/<pid>/ns/{net,ipc,uts}` onto files under `pods/<id>/ns/`, and the
//! placeholder exits. The bind mounts hold the namespaces until the pod is
//! removed.

#![allow(unsafe_code)]

use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use minidock_common::id::{self, ContainerId};
use minidock_common::{MinidockError, MinidockResult};
use minidock_network::loopback_up;
use serde::{Deserialize, Serialize};

use crate::filesystem;
use crate::namespace::POD_SHARED_NAMESPACES;
use crate::runtime::Runtime;
use crate::sys;

/// Persistent pod record (`pod.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodConfig {
    /// 12-hex pod id.
    pub id: String,
    /// Pod name.
    pub name: String,
    /// Member container ids.
    #[serde(default)]
    pub members: Vec<String>,
    /// Namespaces the pod shares.
    pub shared_namespaces: Vec<String>,
    /// Pod hostname (UTS value of the shared namespace).
    pub hostname: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Pod store over the runtime paths.
pub struct PodManager<'a> {
    runtime: &'a Runtime,
}

impl<'a> PodManager<'a> {
    /// Create a manager.
    #[must_use]
    pub fn new(runtime: &'a Runtime) -> Self {
        Self { runtime }
    }

    /// Create a pod and pin its namespaces.
    pub fn create(&self, name: Option<String>) -> MinidockResult<PodConfig> {
        let pod_id = ContainerId::generate();
        let name = name.unwrap_or_else(id::generate_name);
        let config = PodConfig {
            id: pod_id.as_str().to_string(),
            name: name.clone(),
            members: Vec::new(),
            shared_namespaces: POD_SHARED_NAMESPACES
                .iter()
                .map(|(ns, _)| (*ns).to_string())
                .collect(),
            hostname: name,
            created_at: Utc::now(),
        };

        let ns_dir = self.runtime.paths.pod_ns_dir(&config.id);
        std::fs::create_dir_all(&ns_dir)?;

        pin_namespaces(&config, &ns_dir)?;
        self.save(&config)?;

        tracing::info!(pod_id = %config.id, name = %config.name, "Pod created");
        Ok(config)
    }

    /// Persist a pod record.
    pub fn save(&self, config: &PodConfig) -> MinidockResult<()> {
        let value = serde_json::to_value(config)?;
        let json = serde_json::to_string_pretty(&value)?;
        let path = self.runtime.paths.pod_config(&config.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a pod by full id.
    pub fn load(&self, pod_id: &str) -> MinidockResult<PodConfig> {
        let path = self.runtime.paths.pod_config(pod_id);
        if !path.exists() {
            return Err(MinidockError::NotFound {
                kind: "pod",
                id: pod_id.to_string(),
            });
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// All pods on disk, newest first.
    pub fn list(&self) -> MinidockResult<Vec<PodConfig>> {
        let dir = self.runtime.paths.pods();
        let mut pods = Vec::new();
        if !dir.exists() {
            return Ok(pods);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(pod_id) = entry.file_name().to_str() {
                if let Ok(config) = self.load(pod_id) {
                    pods.push(config);
                }
            }
        }
        pods.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pods)
    }

    /// Resolve a pod name, id, or unique id prefix.
    pub fn resolve(&self, reference: &str) -> MinidockResult<String> {
        let pods = self.list()?;

        if let Some(pod) = pods
            .iter()
            .find(|p| p.id == reference || p.name == reference)
        {
            return Ok(pod.id.clone());
        }

        if reference.len() >= ContainerId::MIN_PREFIX {
            let matches: Vec<&PodConfig> = pods
                .iter()
                .filter(|p| p.id.starts_with(reference))
                .collect();
            match matches.as_slice() {
                [single] => return Ok(single.id.clone()),
                [] => {}
                _ => {
                    return Err(MinidockError::StateConflict {
                        message: format!("ambiguous pod reference: {reference}"),
                    })
                }
            }
        }

        Err(MinidockError::NotFound {
            kind: "pod",
            id: reference.to_string(),
        })
    }

    /// Record a member container.
    pub fn add_member(&self, pod_id: &str, container_id: &str) -> MinidockResult<()> {
        let mut config = self.load(pod_id)?;
        if !config.members.iter().any(|m| m == container_id) {
            config.members.push(container_id.to_string());
            self.save(&config)?;
        }
        Ok(())
    }

    /// Drop a member container.
    pub fn remove_member(&self, pod_id: &str, container_id: &str) -> MinidockResult<()> {
        let mut config = self.load(pod_id)?;
        config.members.retain(|m| m != container_id);
        self.save(&config)
    }

    /// Remove a pod: unmount the pinned namespaces and delete its
    /// directory. The caller has already verified no member is running (or
    /// passed --force).
    pub fn remove(&self, pod_id: &str) -> MinidockResult<()> {
        let config = self.load(pod_id)?;

        for ns in &config.shared_namespaces {
            let handle = self.runtime.paths.pod_ns(pod_id, ns);
            if handle.exists() {
                if let Err(e) = filesystem::unmount_detach(&handle) {
                    tracing::warn!(pod_id = %pod_id, ns = %ns, error = %e, "Failed to unpin namespace");
                }
            }
        }

        std::fs::remove_dir_all(self.runtime.paths.pod(pod_id))?;
        tracing::info!(pod_id = %pod_id, "Pod removed");
        Ok(())
    }
}

/// Fork the placeholder, unshare the shared namespaces in it, bind-mount
/// its `/proc/<pid>/ns/*` handles, then let it exit.
fn pin_namespaces(config: &PodConfig, ns_dir: &Path) -> MinidockResult<()> {
    // Bind targets must exist as files.
    for (ns, _) in POD_SHARED_NAMESPACES {
        std::fs::write(ns_dir.join(ns), b"")?;
    }

    let (mut read_end, mut write_end) = {
        let (r, w) = rustix::pipe::pipe().map_err(|e| MinidockError::kernel("pipe2", &e.into()))?;
        (std::fs::File::from(r), std::fs::File::from(w))
    };

    let pid = sys::fork()?;
    if pid == 0 {
        // Placeholder: build the namespaces, signal, and idle until killed.
        drop(read_end);
        let result = (|| -> MinidockResult<()> {
            sys::unshare(libc::CLONE_NEWNET | libc::CLONE_NEWIPC | libc::CLONE_NEWUTS)?;
            let _ = sys::sethostname(&config.hostname);
            let _ = loopback_up();
            write_end.write_all(&[b'P'])?;
            Ok(())
        })();
        if result.is_err() {
            // SAFETY: child exit.
            unsafe { libc::_exit(1) };
        }
        loop {
            // SAFETY: parked until SIGKILL.
            unsafe { libc::pause() };
        }
    }

    drop(write_end);
    let mut buf = [0u8; 1];
    let pinned = read_end.read(&mut buf).map(|n| n == 1).unwrap_or(false);
    if !pinned {
        let _ = sys::kill(pid, libc::SIGKILL);
        let _ = sys::waitpid(pid, false);
        return Err(MinidockError::Kernel {
            op: "unshare",
            errno: "EPERM",
        });
    }

    let mut bind_result = Ok(());
    for (ns, _) in POD_SHARED_NAMESPACES {
        let source = minidock_network::ns_path(pid as u32, ns);
        let target = ns_dir.join(ns);
        if let Err(e) = filesystem::bind_mount(&source, &target, false) {
            bind_result = Err(e);
            break;
        }
    }

    let _ = sys::kill(pid, libc::SIGKILL);
    let _ = sys::waitpid(pid, false);
    bind_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn runtime(temp: &tempfile::TempDir) -> Runtime {
        Runtime::with_root(temp.path(), false, false)
    }

    fn write_pod(manager: &PodManager<'_>, id: &str, name: &str) -> PodConfig {
        let config = PodConfig {
            id: id.to_string(),
            name: name.to_string(),
            members: Vec::new(),
            shared_namespaces: vec!["net".into(), "ipc".into(), "uts".into()],
            hostname: name.to_string(),
            created_at: Utc::now(),
        };
        manager.save(&config).unwrap();
        config
    }

    #[test]
    fn save_load_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = runtime(&temp);
        let manager = PodManager::new(&runtime);

        write_pod(&manager, "abc123abc123", "frontend");
        let loaded = manager.load("abc123abc123").unwrap();
        assert_eq!(loaded.name, "frontend");
        assert_eq!(loaded.shared_namespaces, vec!["net", "ipc", "uts"]);
    }

    #[test]
    fn member_tracking() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = runtime(&temp);
        let manager = PodManager::new(&runtime);

        write_pod(&manager, "abc123abc123", "p");
        manager.add_member("abc123abc123", "c1c1c1c1c1c1").unwrap();
        manager.add_member("abc123abc123", "c1c1c1c1c1c1").unwrap();
        assert_eq!(manager.load("abc123abc123").unwrap().members.len(), 1);

        manager
            .remove_member("abc123abc123", "c1c1c1c1c1c1")
            .unwrap();
        assert!(manager.load("abc123abc123").unwrap().members.is_empty());
    }

    #[test]
    fn resolve_by_name_and_prefix() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = runtime(&temp);
        let manager = PodManager::new(&runtime);

        write_pod(&manager, "abc123abc123", "frontend");
        assert_eq!(manager.resolve("frontend").unwrap(), "abc123abc123");
        assert_eq!(manager.resolve("abc").unwrap(), "abc123abc123");
        assert!(matches!(
            manager.resolve("nothing").unwrap_err(),
            MinidockError::NotFound { kind: "pod", .. }
        ));
    }
}
