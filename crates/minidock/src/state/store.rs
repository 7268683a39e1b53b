//! The on-disk state store.
//!
//! `state.json` writes go through write-temp-then-rename. Reads are
//! optimistic: a stale `running` is reconciled by probing
//! `/proc/<pid>/stat` — a vanished process or a different start time means
//! the container is dead.

use std::fs::OpenOptions;
use std::path::PathBuf;

use minidock_common::id::ContainerId;
use minidock_common::{MinidockError, MinidockResult, StorePaths};
use rustix::fs::{flock, FlockOperation};
use serde::Serialize;

use super::{ContainerConfig, ContainerState, ContainerStatus};
use crate::sys;

/// Store handle bound to a set of paths.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: StorePaths,
}

/// Held flock on a container directory; released on drop.
pub struct ContainerLock {
    file: std::fs::File,
}

impl Drop for ContainerLock {
    fn drop(&mut self) {
        let _ = flock(&self.file, FlockOperation::Unlock);
    }
}

impl StateStore {
    /// Open the store.
    #[must_use]
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }

    /// The underlying paths.
    #[must_use]
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Serialize with sorted keys and write atomically.
    fn write_json<T: Serialize>(&self, path: &PathBuf, value: &T) -> MinidockResult<()> {
        // Round-tripping through Value sorts object keys.
        let value = serde_json::to_value(value)?;
        let json = serde_json::to_string_pretty(&value)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Persist a container's config.
    pub fn save_config(&self, config: &ContainerConfig) -> MinidockResult<()> {
        self.write_json(&self.paths.container_config(&config.id), config)
    }

    /// Load a container's config by full id.
    pub fn load_config(&self, id: &str) -> MinidockResult<ContainerConfig> {
        let path = self.paths.container_config(id);
        if !path.exists() {
            return Err(MinidockError::NotFound {
                kind: "container",
                id: id.to_string(),
            });
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// Persist a container's state.
    pub fn save_state(&self, state: &ContainerState) -> MinidockResult<()> {
        self.write_json(&self.paths.container_state(&state.id), state)?;
        tracing::debug!(container_id = %state.id, status = %state.status, "Saved state");
        Ok(())
    }

    /// Load a container's state by full id, reconciling stale `running`.
    pub fn load_state(&self, id: &str) -> MinidockResult<ContainerState> {
        let path = self.paths.container_state(id);
        if !path.exists() {
            return Err(MinidockError::NotFound {
                kind: "container",
                id: id.to_string(),
            });
        }
        let mut state: ContainerState = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if self.reconcile(&mut state) {
            self.save_state(&state)?;
        }
        Ok(state)
    }

    /// Probe a `running` state against the live process table. Returns true
    /// when the state was rewritten.
    pub fn reconcile(&self, state: &mut ContainerState) -> bool {
        if state.status != ContainerStatus::Running {
            return false;
        }
        let Some(pid) = state.pid else {
            state.set_dead();
            return true;
        };
        match sys::proc_start_time(pid) {
            Some(ticks) if state.start_time_ticks.is_none() || state.start_time_ticks == Some(ticks) => {
                false
            }
            _ => {
                tracing::debug!(container_id = %state.id, pid, "Process gone or pid reused; marking dead");
                state.set_dead();
                true
            }
        }
    }

    /// Remove a container's directory entirely.
    pub fn delete(&self, id: &str) -> MinidockResult<()> {
        let dir = self.paths.container(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            tracing::debug!(container_id = %id, "Deleted container state");
        }
        Ok(())
    }

    /// Full ids of every container on disk.
    pub fn list_ids(&self) -> MinidockResult<Vec<String>> {
        let dir = self.paths.containers();
        let mut ids = Vec::new();
        if !dir.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.path().join("config.json").exists() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load every container's (config, state), newest first, reconciling
    /// each.
    pub fn list(&self) -> MinidockResult<Vec<(ContainerConfig, ContainerState)>> {
        let mut entries = Vec::new();
        for id in self.list_ids()? {
            match (self.load_config(&id), self.load_state(&id)) {
                (Ok(config), Ok(state)) => entries.push((config, state)),
                _ => tracing::warn!(container_id = %id, "Skipping unreadable container entry"),
            }
        }
        entries.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at));
        Ok(entries)
    }

    /// Resolve a name, full id, or unique id prefix (≥3 chars) to a full id.
    pub fn resolve(&self, reference: &str) -> MinidockResult<String> {
        let ids = self.list_ids()?;

        // Exact id.
        if ids.iter().any(|id| id == reference) {
            return Ok(reference.to_string());
        }

        // Name among live containers.
        for id in &ids {
            if let (Ok(config), Ok(state)) = (self.load_config(id), self.load_state(id)) {
                if config.name == reference && state.status.is_live() {
                    return Ok(id.clone());
                }
            }
        }

        // Unique id prefix.
        if reference.len() >= ContainerId::MIN_PREFIX {
            let matches: Vec<&String> =
                ids.iter().filter(|id| id.starts_with(reference)).collect();
            match matches.as_slice() {
                [single] => return Ok((*single).clone()),
                [] => {}
                _ => {
                    return Err(MinidockError::StateConflict {
                        message: format!("ambiguous container reference: {reference}"),
                    })
                }
            }
        }

        Err(MinidockError::NotFound {
            kind: "container",
            id: reference.to_string(),
        })
    }

    /// Enforce name uniqueness among live containers.
    pub fn check_name_free(&self, name: &str) -> MinidockResult<()> {
        for id in self.list_ids()? {
            if let (Ok(config), Ok(state)) = (self.load_config(&id), self.load_state(&id)) {
                if config.name == name && state.status.is_live() {
                    return Err(MinidockError::StateConflict {
                        message: format!("container name already in use: {name}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Take the per-container lock serialising stop/rm/exec.
    pub fn lock(&self, id: &str) -> MinidockResult<ContainerLock> {
        let path = self.paths.container_lock(id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        flock(&file, FlockOperation::LockExclusive)
            .map_err(|e| MinidockError::kernel("flock", &e.into()))?;
        Ok(ContainerLock { file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NetMode, RootfsMode};
    use chrono::Utc;
    use minidock_common::Limits;

    fn config(id: &str, name: &str) -> ContainerConfig {
        ContainerConfig {
            id: id.to_string(),
            name: name.to_string(),
            image_root: "/images/base".into(),
            argv: vec!["/bin/sh".to_string()],
            env: Vec::new(),
            workdir: "/".into(),
            user: None,
            hostname: id.to_string(),
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

    fn store(temp: &tempfile::TempDir) -> StateStore {
        StateStore::new(StorePaths::with_root(temp.path()))
    }

    #[test]
    fn save_and_load_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(&temp);
        let config = config("a1b2c3d4e5f6", "web");
        store.save_config(&config).unwrap();
        store.save_state(&ContainerState::new(&config)).unwrap();

        let loaded = store.load_config("a1b2c3d4e5f6").unwrap();
        assert_eq!(loaded.name, "web");
        let state = store.load_state("a1b2c3d4e5f6").unwrap();
        assert_eq!(state.status, ContainerStatus::Created);
    }

    #[test]
    fn state_json_has_sorted_keys() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(&temp);
        let config = config("a1b2c3d4e5f6", "web");
        store.save_state(&ContainerState::new(&config)).unwrap();

        let json =
            std::fs::read_to_string(store.paths().container_state("a1b2c3d4e5f6")).unwrap();
        let created = json.find("\"created_at\"").unwrap();
        let id = json.find("\"id\"").unwrap();
        let status = json.find("\"status\"").unwrap();
        assert!(created < id && id < status);
    }

    #[test]
    fn resolve_by_name_prefix_and_id() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(&temp);
        for (id, name) in [("a1b2c3d4e5f6", "web"), ("a1ffffffffff", "db")] {
            let config = config(id, name);
            store.save_config(&config).unwrap();
            store.save_state(&ContainerState::new(&config)).unwrap();
        }

        assert_eq!(store.resolve("web").unwrap(), "a1b2c3d4e5f6");
        assert_eq!(store.resolve("a1b2c3d4e5f6").unwrap(), "a1b2c3d4e5f6");
        assert_eq!(store.resolve("a1f").unwrap(), "a1ffffffffff");
        // Ambiguous prefix.
        assert!(matches!(
            store.resolve("a1").unwrap_err(),
            MinidockError::NotFound { .. }
        ));
        assert!(matches!(
            store.resolve("a1b2c3").unwrap(),
            id if id == "a1b2c3d4e5f6"
        ));
    }

    #[test]
    fn ambiguous_prefix_conflicts() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(&temp);
        for id in ["a1b2c3d4e5f6", "a1b2ffffffff"] {
            let config = config(id, id);
            store.save_config(&config).unwrap();
            store.save_state(&ContainerState::new(&config)).unwrap();
        }
        assert!(matches!(
            store.resolve("a1b2").unwrap_err(),
            MinidockError::StateConflict { .. }
        ));
    }

    #[test]
    fn reconcile_marks_vanished_running_as_dead() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(&temp);
        let config = config("a1b2c3d4e5f6", "web");
        store.save_config(&config).unwrap();

        let mut state = ContainerState::new(&config);
        // A pid that cannot exist.
        state.set_running(u32::MAX - 2, Some(12345));
        store.save_state(&state).unwrap();

        let reconciled = store.load_state("a1b2c3d4e5f6").unwrap();
        assert_eq!(reconciled.status, ContainerStatus::Dead);

        // And the rewrite was persisted.
        let json =
            std::fs::read_to_string(store.paths().container_state("a1b2c3d4e5f6")).unwrap();
        assert!(json.contains("\"dead\""));
    }

    #[test]
    fn reconcile_detects_pid_reuse() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(&temp);
        let config = config("a1b2c3d4e5f6", "web");
        store.save_config(&config).unwrap();

        // Our own pid but a bogus start time: same pid, different process.
        let mut state = ContainerState::new(&config);
        state.set_running(std::process::id(), Some(1));
        store.save_state(&state).unwrap();

        let reconciled = store.load_state("a1b2c3d4e5f6").unwrap();
        assert_eq!(reconciled.status, ContainerStatus::Dead);
    }

    #[test]
    fn name_uniqueness_among_live_only() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(&temp);

        let config_a = config("a1b2c3d4e5f6", "web");
        store.save_config(&config_a).unwrap();
        let mut state = ContainerState::new(&config_a);
        store.save_state(&state).unwrap();

        assert!(store.check_name_free("web").is_err());

        state.set_running(1, None);
        state.set_dead();
        store.save_state(&state).unwrap();
        // Dead containers do not reserve their name.
        store.check_name_free("web").unwrap();
    }

    #[test]
    fn missing_container_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(&temp);
        assert!(matches!(
            store.load_config("ffffffffffff").unwrap_err(),
            MinidockError::NotFound { .. }
        ));
        assert!(matches!(
            store.resolve("nothing").unwrap_err(),
            MinidockError::NotFound { .. }
        ));
    }
}
