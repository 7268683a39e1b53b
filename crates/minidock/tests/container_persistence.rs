//! Integration tests for the state store: persistence across invocations,
//! reference resolution, and dead-container reconciliation.

use chrono::Utc;
use minidock::state::{
    ContainerConfig, ContainerState, ContainerStatus, NetMode, RootfsMode, StateStore,
};
use minidock_common::{Limits, StorePaths};
use tempfile::TempDir;

fn config(id: &str, name: &str) -> ContainerConfig {
    ContainerConfig {
        id: id.to_string(),
        name: name.to_string(),
        image_root: "/images/base".into(),
        argv: vec!["/bin/sleep".to_string(), "3600".to_string()],
        env: vec!["APP=test".to_string()],
        workdir: "/".into(),
        user: None,
        hostname: id.to_string(),
        limits: Limits {
            memory_bytes: Some(20 * 1024 * 1024),
            cpu_percent: Some(50),
            pids_max: Some(5),
        },
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
fn config_survives_store_reopen() {
    let temp = TempDir::new().unwrap();

    {
        let store = StateStore::new(StorePaths::with_root(temp.path()));
        let config = config("a1b2c3d4e5f6", "web");
        store.save_config(&config).unwrap();
        store.save_state(&ContainerState::new(&config)).unwrap();
    }

    // Simulate a fresh CLI invocation.
    let store = StateStore::new(StorePaths::with_root(temp.path()));
    let loaded = store.load_config("a1b2c3d4e5f6").unwrap();
    assert_eq!(loaded.name, "web");
    assert_eq!(loaded.limits.memory_bytes, Some(20 * 1024 * 1024));
    assert_eq!(loaded.argv, vec!["/bin/sleep", "3600"]);

    let state = store.load_state("a1b2c3d4e5f6").unwrap();
    assert_eq!(state.status, ContainerStatus::Created);
}

#[test]
fn running_state_records_pid_and_start_time() {
    let temp = TempDir::new().unwrap();
    let store = StateStore::new(StorePaths::with_root(temp.path()));
    let config = config("a1b2c3d4e5f6", "web");
    store.save_config(&config).unwrap();

    // Our own process stands in for a live container: reconciliation must
    // keep it running because pid and start time both match.
    let pid = std::process::id();
    let ticks = std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().nth(19)?.parse::<u64>().ok()
        });
    assert!(ticks.is_some());

    let mut state = ContainerState::new(&config);
    state.set_running(pid, ticks);
    store.save_state(&state).unwrap();

    let loaded = store.load_state("a1b2c3d4e5f6").unwrap();
    assert_eq!(loaded.status, ContainerStatus::Running);
    assert_eq!(loaded.pid, Some(pid));
}

#[test]
fn killed_host_process_reports_dead() {
    let temp = TempDir::new().unwrap();
    let store = StateStore::new(StorePaths::with_root(temp.path()));
    let config = config("a1b2c3d4e5f6", "web");
    store.save_config(&config).unwrap();

    let mut state = ContainerState::new(&config);
    // A pid that cannot be live.
    state.set_running(u32::MAX - 7, Some(1));
    store.save_state(&state).unwrap();

    // Listing reconciles and persists the transition.
    let entries = store.list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.status, ContainerStatus::Dead);

    let reread = store.load_state("a1b2c3d4e5f6").unwrap();
    assert_eq!(reread.status, ContainerStatus::Dead);
    assert_eq!(reread.pid, None);
}

#[test]
fn resolution_prefers_names_then_prefixes() {
    let temp = TempDir::new().unwrap();
    let store = StateStore::new(StorePaths::with_root(temp.path()));

    for (id, name) in [("aa11bb22cc33", "web"), ("aa99ff88ee77", "db")] {
        let config = config(id, name);
        store.save_config(&config).unwrap();
        store.save_state(&ContainerState::new(&config)).unwrap();
    }

    assert_eq!(store.resolve("db").unwrap(), "aa99ff88ee77");
    assert_eq!(store.resolve("aa11").unwrap(), "aa11bb22cc33");
    assert_eq!(store.resolve("aa99ff88ee77").unwrap(), "aa99ff88ee77");
    // Two-character prefixes are never considered.
    assert!(store.resolve("aa").is_err());
}

#[test]
fn delete_removes_the_directory() {
    let temp = TempDir::new().unwrap();
    let paths = StorePaths::with_root(temp.path());
    let store = StateStore::new(paths.clone());

    let config = config("a1b2c3d4e5f6", "web");
    store.save_config(&config).unwrap();
    store.save_state(&ContainerState::new(&config)).unwrap();
    assert!(paths.container("a1b2c3d4e5f6").exists());

    store.delete("a1b2c3d4e5f6").unwrap();
    assert!(!paths.container("a1b2c3d4e5f6").exists());
    assert!(store.list().unwrap().is_empty());
}
