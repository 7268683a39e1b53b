//! The user-facing verbs: run, stop, rm, ps, logs, inspect, cleanup, info,
//! plus exec and the pod commands in their submodules. Thin over the
//! launcher and the state store.

mod exec;
mod pods;

pub use exec::ExecRequest;
pub use pods::PodCommandOutcome;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use minidock_common::id::{self, ContainerId};
use minidock_common::resource::{parse_cpu_percent, parse_memory};
use minidock_common::{Limits, MinidockError, MinidockResult};
use minidock_image::{ImageBuilder, ImageRecord, ImageStore};
use minidock_network::{BridgeManager, LeaseStore};
use serde_json::json;

use crate::cgroup::CgroupManager;
use crate::filesystem::{parse_volume_spec, OverlayFs};
use crate::launcher::{LaunchOptions, Launcher};
use crate::pod::PodManager;
use crate::runtime::Runtime;
use crate::state::{
    BindMount, ContainerConfig, ContainerState, ContainerStatus, NetMode, RootfsMode, StateStore,
};
use crate::sys;

/// Everything `run` needs from the CLI.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Rootfs path or `image[:tag]`.
    pub image: String,
    /// Command; empty means the image's default.
    pub argv: Vec<String>,
    /// Container name.
    pub name: Option<String>,
    /// UTS hostname.
    pub hostname: Option<String>,
    /// Memory limit string.
    pub memory: Option<String>,
    /// CPU percentage.
    pub cpu: Option<u32>,
    /// Max tasks.
    pub pids: Option<u32>,
    /// `KEY=VALUE` environment pairs.
    pub env: Vec<String>,
    /// `host:container[:ro]` volume specs.
    pub volumes: Vec<String>,
    /// Working directory.
    pub workdir: Option<String>,
    /// `uid[:gid]`.
    pub user: Option<String>,
    /// Network mode: "none" or "bridge".
    pub net: Option<String>,
    /// Pod to join.
    pub pod: Option<String>,
    /// Disable overlay.
    pub no_overlay: bool,
    /// Detach after launch.
    pub detach: bool,
    /// Allocate a PTY.
    pub tty: bool,
    /// Keep stdin open.
    pub interactive: bool,
    /// Remove the container after it exits.
    pub remove_on_exit: bool,
}

/// The verb dispatcher.
pub struct Manager {
    runtime: Runtime,
    store: StateStore,
}

impl Manager {
    /// Create a manager.
    #[must_use]
    pub fn new(runtime: Runtime) -> Self {
        let store = StateStore::new(runtime.paths.clone());
        Self { runtime, store }
    }

    /// The runtime context.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn image_store(&self) -> MinidockResult<ImageStore> {
        ImageStore::new(self.runtime.paths.images())
    }

    fn lease_store(&self) -> LeaseStore {
        LeaseStore::new(
            self.runtime.paths.leases(),
            self.runtime.paths.network_lock(),
        )
    }

    /// `run`: create and start a container. Returns the CLI exit code.
    pub fn run(&self, req: RunRequest) -> MinidockResult<i32> {
        self.runtime.paths.create_dirs()?;

        let (image_root, image_defaults) = self.resolve_image(&req.image)?;
        let config = self.build_config(&req, image_root, image_defaults)?;

        self.store.save_config(&config)?;
        self.store.save_state(&ContainerState::new(&config))?;

        let opts = LaunchOptions {
            detach: req.detach,
            tty: req.tty,
            interactive: req.interactive,
        };
        let exit_code = Launcher::new(&self.runtime).launch(&config, opts)?;

        if req.detach {
            println!("{}", config.id);
        }

        if req.remove_on_exit && !req.detach {
            if let Err(e) = self.remove(&config.id, false, false) {
                tracing::warn!(container_id = %config.id, error = %e, "auto-remove failed");
            }
        }
        Ok(exit_code)
    }

    /// `run-oci`: launch an OCI bundle.
    pub fn run_oci(&self, bundle_path: &Path, detach: bool, rootless: bool) -> MinidockResult<i32> {
        self.runtime.paths.create_dirs()?;

        let bundle = minidock_oci::load_bundle(bundle_path)?;
        let process = bundle
            .spec
            .process
            .as_ref()
            .ok_or_else(|| MinidockError::ConfigInvalid {
                message: "bundle config has no process".to_string(),
            })?;

        let container_id = ContainerId::generate();
        let hostname = bundle
            .spec
            .hostname
            .clone()
            .unwrap_or_else(|| container_id.as_str().to_string());

        let mut limits = Limits::default();
        let mut net_requested = false;
        if let Some(linux) = &bundle.spec.linux {
            if let Some(resources) = &linux.resources {
                if let Some(memory) = resources.memory.as_ref().and_then(|m| m.limit) {
                    if memory > 0 {
                        limits.memory_bytes = Some(memory as u64);
                    }
                }
                if let Some(cpu) = &resources.cpu {
                    if let Some(quota) = cpu.quota {
                        let period = cpu.period.unwrap_or(100_000);
                        if quota > 0 && period > 0 {
                            let percent = ((quota as u64 * 100) / period).clamp(1, 100);
                            limits.cpu_percent = Some(percent as u32);
                        }
                    }
                }
                if let Some(pids) = resources.pids.as_ref().and_then(|p| p.limit) {
                    if pids > 0 {
                        limits.pids_max = Some(pids as u32);
                    }
                }
            }
            net_requested = linux
                .namespaces
                .iter()
                .any(|ns| ns.ns_type == minidock_oci::NamespaceType::Network);
        }

        let mounts = bundle
            .spec
            .mounts
            .iter()
            .filter(|m| m.is_bind())
            .filter_map(|m| {
                m.source.as_ref().map(|source| BindMount {
                    host_path: source.clone(),
                    container_path: m.destination.clone(),
                    read_only: m.is_readonly(),
                })
            })
            .collect();

        let rootless = rootless || self.runtime.profile.rootless;
        let config = ContainerConfig {
            id: container_id.as_str().to_string(),
            name: id::generate_name(),
            image_root: bundle.rootfs(),
            argv: process.args.clone(),
            env: process.env.clone(),
            workdir: process.cwd.clone(),
            user: Some(format!("{}:{}", process.user.uid, process.user.gid)),
            hostname,
            limits,
            mounts,
            net_mode: if net_requested && !rootless {
                NetMode::Bridge
            } else {
                NetMode::None
            },
            // A read-only root maps onto bind mode, whose lower stays ro.
            rootfs_mode: if bundle.spec.root.as_ref().is_some_and(|r| r.readonly) {
                RootfsMode::Bind
            } else {
                RootfsMode::Overlay
            },
            rootless,
            pod_id: None,
            ip: None,
            created_at: Utc::now(),
        };

        let config = self.allocate_network(config)?;
        self.store.save_config(&config)?;
        self.store.save_state(&ContainerState::new(&config))?;

        let exit_code = Launcher::new(&self.runtime).launch(
            &config,
            LaunchOptions {
                detach,
                tty: process.terminal && !detach,
                interactive: false,
            },
        )?;
        if detach {
            println!("{}", config.id);
        }
        Ok(exit_code)
    }

    /// Resolve the `run` image argument: an existing directory wins, else
    /// the image store.
    fn resolve_image(&self, reference: &str) -> MinidockResult<(PathBuf, Option<ImageRecord>)> {
        let as_path = Path::new(reference);
        if as_path.is_dir() {
            let canonical = std::fs::canonicalize(as_path)?;
            return Ok((canonical, None));
        }
        let record = self.image_store()?.resolve(reference)?;
        Ok((record.rootfs.clone(), Some(record)))
    }

    fn build_config(
        &self,
        req: &RunRequest,
        image_root: PathBuf,
        image: Option<ImageRecord>,
    ) -> MinidockResult<ContainerConfig> {
        let container_id = ContainerId::generate();

        let name = match &req.name {
            Some(name) => {
                self.store.check_name_free(name)?;
                name.clone()
            }
            None => id::generate_name(),
        };

        let mut argv = req.argv.clone();
        let mut env = Vec::new();
        let mut workdir = req.workdir.clone();
        if let Some(image) = &image {
            if argv.is_empty() {
                argv = image.default_cmd.clone();
            }
            if !image.entrypoint.is_empty() {
                let mut combined = image.entrypoint.clone();
                combined.extend(argv);
                argv = combined;
            }
            env.extend(image.default_env.iter().cloned());
            if workdir.is_none() {
                workdir = image.workdir.clone();
            }
        }
        env.extend(req.env.iter().cloned());

        if argv.is_empty() {
            return Err(MinidockError::ConfigInvalid {
                message: "no command given and the image has no default".to_string(),
            });
        }

        let limits = Limits {
            memory_bytes: req.memory.as_deref().map(parse_memory).transpose()?,
            cpu_percent: req.cpu.map(parse_cpu_percent).transpose()?,
            pids_max: req.pids,
        };

        let mounts = req
            .volumes
            .iter()
            .map(|spec| parse_volume_spec(spec))
            .collect::<MinidockResult<Vec<_>>>()?;

        let rootless = self.runtime.profile.rootless;

        let net_mode = if let Some(pod_ref) = &req.pod {
            let pod_id = PodManager::new(&self.runtime).resolve(pod_ref)?;
            NetMode::Pod { pod_id }
        } else {
            match req.net.as_deref() {
                None | Some("none") => NetMode::None,
                Some("bridge") if rootless => {
                    return Err(MinidockError::BridgeUnavailable {
                        message: "bridge networking requires privileged mode".to_string(),
                    })
                }
                Some("bridge") => NetMode::Bridge,
                Some(other) => {
                    return Err(MinidockError::ConfigInvalid {
                        message: format!("unknown network mode: {other}"),
                    })
                }
            }
        };

        let pod_id = match &net_mode {
            NetMode::Pod { pod_id } => Some(pod_id.clone()),
            _ => None,
        };

        let config = ContainerConfig {
            id: container_id.as_str().to_string(),
            name,
            image_root,
            argv,
            env,
            workdir: PathBuf::from(workdir.unwrap_or_else(|| "/".to_string())),
            user: req.user.clone(),
            hostname: req
                .hostname
                .clone()
                .unwrap_or_else(|| container_id.as_str().to_string()),
            limits,
            mounts,
            net_mode,
            rootfs_mode: if req.no_overlay {
                RootfsMode::Bind
            } else {
                RootfsMode::Overlay
            },
            rootless,
            pod_id,
            ip: None,
            created_at: Utc::now(),
        };

        if let Some(pod_id) = &config.pod_id {
            PodManager::new(&self.runtime).add_member(pod_id, &config.id)?;
        }

        self.allocate_network(config)
    }

    /// Allocate the bridge lease for bridge-mode containers.
    fn allocate_network(&self, mut config: ContainerConfig) -> MinidockResult<ContainerConfig> {
        if config.net_mode == NetMode::Bridge {
            let ip = self.lease_store().allocate(&config.id)?;
            tracing::debug!(container_id = %config.id, ip = %ip, "Leased address");
            config.ip = Some(ip);
        }
        Ok(config)
    }

    /// `stop`: SIGTERM, bounded wait on a monotonic deadline, SIGKILL.
    pub fn stop(&self, reference: &str, timeout_secs: u64, force: bool) -> MinidockResult<()> {
        let id = self.store.resolve(reference)?;
        let _lock = self.store.lock(&id)?;

        let config = self.store.load_config(&id)?;
        let mut state = self.store.load_state(&id)?;
        if state.status != ContainerStatus::Running {
            tracing::debug!(container_id = %id, status = %state.status, "Already stopped");
            return Ok(());
        }
        let pid = state.pid.ok_or_else(|| MinidockError::Internal {
            message: "running container without a pid".to_string(),
        })? as i32;
        let expected_ticks = state.start_time_ticks;

        let first_signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        let mut sent_kill = force;
        match sys::kill(pid, first_signal) {
            Ok(()) | Err(MinidockError::Kernel { errno: "ESRCH", .. }) => {}
            Err(e) => return Err(e),
        }

        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        while pid_matches(pid as u32, expected_ticks) {
            if Instant::now() >= deadline {
                tracing::debug!(container_id = %id, "Stop timeout, escalating to SIGKILL");
                let _ = sys::kill(pid, libc::SIGKILL);
                sent_kill = true;
                // Give the kernel a moment to reap.
                std::thread::sleep(Duration::from_millis(200));
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        // The container was launched by another invocation, so it is not
        // our child to reap; record the signal-derived exit code.
        let exit_code = match sys::waitpid(pid, true) {
            Ok(outcome @ (sys::WaitOutcome::Exited(_) | sys::WaitOutcome::Signaled(_))) => {
                outcome.exit_code()
            }
            _ => {
                if sent_kill {
                    128 + libc::SIGKILL
                } else {
                    128 + libc::SIGTERM
                }
            }
        };

        state.set_exited(exit_code);
        self.store.save_state(&state)?;

        Launcher::new(&self.runtime).teardown(
            &config,
            CgroupManager::open(&id, config.rootless).as_ref(),
        );
        tracing::info!(container_id = %id, exit_code, "Container stopped");
        Ok(())
    }

    /// `rm`: delete a container and its residue.
    pub fn remove(&self, reference: &str, force: bool, _volumes: bool) -> MinidockResult<()> {
        let id = self.store.resolve(reference)?;
        {
            let _lock = self.store.lock(&id)?;
            let state = self.store.load_state(&id)?;
            if state.status == ContainerStatus::Running && !force {
                return Err(MinidockError::StateConflict {
                    message: format!("container {id} is running; stop it first or use --force"),
                });
            }
        }
        // stop() takes the lock itself; forced removal still asks nicely
        // before escalating to SIGKILL.
        let running = self.store.load_state(&id)?.status == ContainerStatus::Running;
        if running {
            self.stop(&id, 5, false)?;
        }

        let _lock = self.store.lock(&id)?;
        let config = self.store.load_config(&id)?;

        // Overlay residue.
        let (lower, upper, work, merged) = self.runtime.paths.overlay_dirs(&id);
        let overlay = OverlayFs {
            lower,
            upper,
            work,
            merged,
            image_root: config.image_root.clone(),
        };
        if let Err(e) = overlay.remove_dirs() {
            tracing::warn!(container_id = %id, error = %e, "Overlay cleanup failed");
        }

        Launcher::new(&self.runtime).teardown(
            &config,
            CgroupManager::open(&id, config.rootless).as_ref(),
        );

        if let Some(pod_id) = &config.pod_id {
            if let Err(e) = PodManager::new(&self.runtime).remove_member(pod_id, &id) {
                tracing::debug!(container_id = %id, error = %e, "Pod membership cleanup failed");
            }
        }

        self.store.delete(&id)?;
        tracing::info!(container_id = %id, "Container removed");
        Ok(())
    }

    /// `ps`: list containers, reconciling stale state.
    pub fn list(
        &self,
        all: bool,
    ) -> MinidockResult<Vec<(ContainerConfig, ContainerState)>> {
        let entries = self.store.list()?;
        Ok(entries
            .into_iter()
            .filter(|(_, state)| all || state.status == ContainerStatus::Running)
            .collect())
    }

    /// `logs`.
    pub fn logs(
        &self,
        reference: &str,
        follow: bool,
        tail: Option<usize>,
        timestamps: bool,
    ) -> MinidockResult<()> {
        let id = self.store.resolve(reference)?;
        let path = self.runtime.paths.container_log(&id);
        if !path.exists() {
            return Ok(());
        }

        let print = |chunk: &str| {
            for line in chunk.lines() {
                if timestamps {
                    println!("{} {line}", Utc::now().to_rfc3339());
                } else {
                    println!("{line}");
                }
            }
        };

        let content = std::fs::read_to_string(&path)?;
        match tail {
            Some(n) => {
                let lines: Vec<&str> = content.lines().collect();
                let start = lines.len().saturating_sub(n);
                for line in &lines[start..] {
                    if timestamps {
                        println!("{} {line}", Utc::now().to_rfc3339());
                    } else {
                        println!("{line}");
                    }
                }
            }
            None => print(&content),
        }

        if follow {
            let mut offset = content.len() as u64;
            loop {
                std::thread::sleep(Duration::from_millis(200));
                let len = std::fs::metadata(&path)?.len();
                if len > offset {
                    use std::io::{Read, Seek, SeekFrom};
                    let mut file = std::fs::File::open(&path)?;
                    file.seek(SeekFrom::Start(offset))?;
                    let mut chunk = String::new();
                    file.read_to_string(&mut chunk)?;
                    print(&chunk);
                    offset = len;
                }
                // Stop following once the container is gone.
                let state = self.store.load_state(&id)?;
                if state.status != ContainerStatus::Running && len <= offset {
                    break;
                }
            }
        }
        Ok(())
    }

    /// `inspect`: merged config + state + live stats as a JSON value.
    pub fn inspect(&self, reference: &str) -> MinidockResult<serde_json::Value> {
        let id = self.store.resolve(reference)?;
        let config = self.store.load_config(&id)?;
        let state = self.store.load_state(&id)?;

        let stats = CgroupManager::open(&id, config.rootless).map(|cgroup| {
            json!({
                "memory_bytes": cgroup.memory_current().unwrap_or(0),
                "cpu_usage_usec": cgroup.cpu_stat().map(|s| s.usage_usec).unwrap_or(0),
                "oom_kills": cgroup.oom_kill_count(),
            })
        });

        Ok(json!({
            "config": serde_json::to_value(&config)?,
            "state": serde_json::to_value(&state)?,
            "stats": stats,
        }))
    }

    /// `build`.
    pub fn build(&self, path: &Path, file: &str, tag: &str, no_cache: bool) -> MinidockResult<String> {
        self.runtime.paths.create_dirs()?;
        let store = self.image_store()?;
        let build_file = path.join(file);
        let record = ImageBuilder::new(&store).build(&build_file, tag, no_cache)?;
        Ok(record.id)
    }

    /// `images`.
    pub fn images(&self) -> MinidockResult<Vec<ImageRecord>> {
        self.image_store()?.list()
    }

    /// `rmi`.
    pub fn remove_image(&self, reference: &str) -> MinidockResult<()> {
        self.image_store()?.remove(reference)
    }

    /// `cleanup`: remove exited/dead containers and, once nothing holds a
    /// lease, the bridge and NAT rule; optionally prune images.
    pub fn cleanup(&self, containers: bool, images: bool, _volumes: bool) -> MinidockResult<()> {
        if containers {
            for (config, state) in self.store.list()? {
                if state.status.can_remove() {
                    if let Err(e) = self.remove(&config.id, false, false) {
                        tracing::warn!(container_id = %config.id, error = %e, "Cleanup skip");
                    }
                }
            }
        }

        if self.runtime.profile.can_manage_network
            && self.lease_store().active().unwrap_or(1) == 0
        {
            if let Err(e) = BridgeManager::teardown() {
                tracing::warn!(error = %e, "Bridge teardown failed");
            }
        }

        if images {
            let referenced: Vec<PathBuf> = self
                .store
                .list()?
                .into_iter()
                .map(|(config, _)| config.image_root)
                .collect();
            for image in self.images()? {
                if !referenced.contains(&image.rootfs) {
                    if let Err(e) = self.remove_image(&image.reference()) {
                        tracing::warn!(image = %image.reference(), error = %e, "Image cleanup skip");
                    }
                }
            }
        }
        Ok(())
    }

    /// `info`: runtime facts and feature probes.
    pub fn info(&self) -> MinidockResult<serde_json::Value> {
        let entries = self.store.list()?;
        let count_by = |status: ContainerStatus| {
            entries
                .iter()
                .filter(|(_, s)| s.status == status)
                .count()
        };

        let overlay_supported = std::fs::read_to_string("/proc/filesystems")
            .map(|content| content.lines().any(|l| l.trim_end().ends_with("overlay")))
            .unwrap_or(false);
        let cgroup_v2 = Path::new("/sys/fs/cgroup/cgroup.controllers").exists();

        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "root": self.runtime.paths.root,
            "rootless": self.runtime.profile.rootless,
            "containers": {
                "total": entries.len(),
                "running": count_by(ContainerStatus::Running),
                "exited": count_by(ContainerStatus::Exited),
                "dead": count_by(ContainerStatus::Dead),
            },
            "images": self.images()?.len(),
            "features": {
                "overlayfs": overlay_supported,
                "cgroup_v2": cgroup_v2,
            },
        }))
    }
}

/// True while the pid exists and (when known) still has the recorded start
/// time.
fn pid_matches(pid: u32, expected_ticks: Option<u64>) -> bool {
    match (sys::proc_start_time(pid), expected_ticks) {
        (Some(actual), Some(expected)) => actual == expected,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(temp: &tempfile::TempDir) -> Manager {
        Manager::new(Runtime::with_root(temp.path(), true, false))
    }

    #[test]
    fn run_rejects_unknown_image() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager(&temp);
        let err = manager
            .run(RunRequest {
                image: "no-such-image:latest".to_string(),
                argv: vec!["/bin/true".to_string()],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, MinidockError::NotFound { kind: "image", .. }));
    }

    #[test]
    fn run_rejects_empty_command() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager(&temp);
        let rootfs = temp.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();

        let err = manager
            .run(RunRequest {
                image: rootfs.to_string_lossy().to_string(),
                argv: Vec::new(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, MinidockError::ConfigInvalid { .. }));
    }

    #[test]
    fn bridge_refused_in_rootless() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager(&temp);
        let rootfs = temp.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();

        let err = manager
            .run(RunRequest {
                image: rootfs.to_string_lossy().to_string(),
                argv: vec!["/bin/true".to_string()],
                net: Some("bridge".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, MinidockError::BridgeUnavailable { .. }));
    }

    #[test]
    fn stop_of_missing_container_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager(&temp);
        manager.runtime.paths.create_dirs().unwrap();
        assert!(matches!(
            manager.stop("nothing", 1, false).unwrap_err(),
            MinidockError::NotFound { .. }
        ));
    }

    #[test]
    fn info_reports_counts() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager(&temp);
        manager.runtime.paths.create_dirs().unwrap();
        let info = manager.info().unwrap();
        assert_eq!(info["containers"]["total"], 0);
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
    }
}
