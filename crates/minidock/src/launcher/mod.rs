//! The container launch pipeline.
//!
//! A two-process launch joined by the handshake pipes:
//!
//! 1. The parent allocates state, cgroup, and (bridge mode) an IP lease,
//!    then clones the child directly into its new namespaces.
//! 2. The child announces birth and blocks.
//! 3. The parent writes uid/gid maps (rootless), enrolls the child in the
//!    cgroup, wires the veth pair (bridge mode), and releases the child.
//! 4. The child sets the hostname, builds its root filesystem, brings up
//!    loopback, pivots, drops privileges, installs seccomp, signals
//!    readiness, and execs the user command.
//! 5. The parent records `running` and either returns (detached) or pumps
//!    stdio and waits.
//!
//! Any child failure before execve travels back over the pipe as a one-line
//! report and surfaces as `launch.handshake-broken`. Cleanup after partial
//! failure is idempotent.

#![allow(unsafe_code)]

mod handshake;
mod pty;
mod stdio;

pub use stdio::{StdioPlan, StdioPump};

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use minidock_common::{MinidockError, MinidockResult};
use minidock_network::{loopback_up, BridgeManager, LeaseStore, VethPair};

use crate::cgroup::CgroupManager;
use crate::filesystem::{self, OverlayFs};
use crate::namespace::{self, IdMapping, NamespaceConfig};
use crate::runtime::Runtime;
use crate::security;
use crate::state::{ContainerConfig, NetMode, StateStore};
use crate::sys::{self, WaitOutcome};

/// Launch-time options from the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchOptions {
    /// Return once running instead of waiting.
    pub detach: bool,
    /// Allocate a PTY.
    pub tty: bool,
    /// Keep stdin open.
    pub interactive: bool,
}

/// Child pid for the SIGINT forwarder.
static FOREGROUND_CHILD: AtomicI32 = AtomicI32::new(0);
static SIGINT_COUNT: AtomicUsize = AtomicUsize::new(0);

extern "C" fn forward_sigint(_sig: libc::c_int) {
    let pid = FOREGROUND_CHILD.load(Ordering::SeqCst);
    if pid <= 0 {
        return;
    }
    // First interrupt asks nicely; the second escalates.
    let signal = if SIGINT_COUNT.fetch_add(1, Ordering::SeqCst) == 0 {
        libc::SIGTERM
    } else {
        libc::SIGKILL
    };
    // SAFETY: async-signal-safe kill from a signal handler.
    unsafe {
        libc::kill(pid, signal);
    }
}

fn install_sigint_forwarder() {
    // SAFETY: installing an async-signal-safe handler.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = forward_sigint as extern "C" fn(libc::c_int) as usize;
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
    }
}

/// Orchestrates launches against one runtime.
pub struct Launcher<'a> {
    runtime: &'a Runtime,
}

impl<'a> Launcher<'a> {
    /// Create a launcher.
    #[must_use]
    pub fn new(runtime: &'a Runtime) -> Self {
        Self { runtime }
    }

    /// Launch a created container. Returns the CLI exit code: the user
    /// command's exit code in foreground mode, 0 in detached mode.
    pub fn launch(&self, config: &ContainerConfig, opts: LaunchOptions) -> MinidockResult<i32> {
        let store = StateStore::new(self.runtime.paths.clone());
        let rootless = config.rootless;

        let cgroup = CgroupManager::create(&config.id, &config.limits, rootless)?;

        let log_path = self.runtime.paths.container_log(&config.id);
        let stdio = StdioPlan::new(opts.detach, opts.tty, opts.interactive, &log_path)?;

        // Pod namespace handles are opened before the clone so a vanished
        // pod fails cleanly in the parent.
        let pod_ns_files = self.open_pod_namespaces(config)?;

        let new_net = config.net_mode.creates_namespace();
        let ns_config = NamespaceConfig::for_launch(new_net, rootless);

        let (mut parent_pipes, mut child_pipes) = handshake::pipes()?;

        let pid = sys::clone_with_namespaces(ns_config.flags())?;
        if pid == 0 {
            // === child ===
            drop(parent_pipes);
            let err = child_main(config, &mut child_pipes, pod_ns_files, &stdio, self.runtime);
            child_pipes.send_error(&err);
            // SAFETY: terminating the child without unwinding into the
            // parent's stack.
            unsafe { libc::_exit(125) };
        }

        // === parent ===
        drop(child_pipes);
        drop(pod_ns_files);

        let result = self.parent_side(config, cgroup.as_ref(), &mut parent_pipes, pid, rootless);

        if let Err(e) = result {
            tracing::error!(container_id = %config.id, error = %e, "Launch failed, cleaning up");
            self.cleanup_failed_launch(config, &store, cgroup.as_ref(), pid);
            return Err(e);
        }

        // Running: record state.
        let mut state = store.load_state(&config.id)?;
        state.set_running(pid as u32, sys::proc_start_time(pid as u32));
        store.save_state(&state)?;

        if opts.detach {
            tracing::info!(container_id = %config.id, pid, "Container running (detached)");
            return Ok(0);
        }

        self.wait_foreground(config, &store, cgroup.as_ref(), stdio, &log_path, pid)
    }

    /// Parent half of the handshake: maps, cgroup, network, go, ready.
    fn parent_side(
        &self,
        config: &ContainerConfig,
        cgroup: Option<&CgroupManager>,
        pipes: &mut handshake::ParentPipes,
        pid: i32,
        rootless: bool,
    ) -> MinidockResult<()> {
        pipes.wait_born()?;

        if rootless {
            let uid = self.runtime.profile.euid;
            // SAFETY: getegid has no failure modes.
            let gid = unsafe { libc::getegid() };
            namespace::write_uid_map(pid as u32, &[IdMapping::root_to(uid)])?;
            namespace::write_gid_map(pid as u32, &[IdMapping::root_to(gid)])?;
        }

        if let Some(cgroup) = cgroup {
            cgroup.add_process(pid as u32)?;
        }

        if config.net_mode == NetMode::Bridge {
            let ip = config.ip.as_deref().ok_or_else(|| MinidockError::Internal {
                message: "bridge mode without an allocated lease".to_string(),
            })?;
            let bridge = BridgeManager::ensure()?;
            let veth = VethPair::create(&config.id)?;
            bridge.add_interface(&veth.host)?;
            veth.move_peer_to(pid as u32)?;
            veth.configure_inside(pid as u32, ip)?;
        }

        pipes.send_go()?;
        pipes.wait_ready()
    }

    /// Open a pod's pinned namespace handles, validating they still exist.
    fn open_pod_namespaces(
        &self,
        config: &ContainerConfig,
    ) -> MinidockResult<Vec<(libc::c_int, File)>> {
        let NetMode::Pod { pod_id } = &config.net_mode else {
            return Ok(Vec::new());
        };

        let mut files = Vec::new();
        for (ns, flag) in namespace::POD_SHARED_NAMESPACES {
            let path = self.runtime.paths.pod_ns(pod_id, ns);
            let file = File::open(&path).map_err(|_| MinidockError::StateConflict {
                message: format!("pod {pod_id} namespace handle missing: {}", path.display()),
            })?;
            files.push((*flag, file));
        }
        Ok(files)
    }

    /// Foreground wait: pump stdio, reap, record exit, tear down.
    fn wait_foreground(
        &self,
        config: &ContainerConfig,
        store: &StateStore,
        cgroup: Option<&CgroupManager>,
        stdio: StdioPlan,
        log_path: &Path,
        pid: i32,
    ) -> MinidockResult<i32> {
        FOREGROUND_CHILD.store(pid, Ordering::SeqCst);
        SIGINT_COUNT.store(0, Ordering::SeqCst);
        install_sigint_forwarder();

        let raw_guard = if matches!(stdio, StdioPlan::Tty { .. }) {
            pty::RawModeGuard::new(libc::STDIN_FILENO)
        } else {
            None
        };

        let oom_notifier = cgroup.and_then(CgroupManager::spawn_oom_notifier);
        let pump = stdio.start_pump(log_path)?;
        let outcome = sys::waitpid(pid, false)?;
        FOREGROUND_CHILD.store(0, Ordering::SeqCst);
        pump.finish();
        drop(raw_guard);

        let exit_code = outcome.exit_code();
        let mut state = store.load_state(&config.id)?;
        state.set_exited(exit_code);
        store.save_state(&state)?;

        if let WaitOutcome::Signaled(sig) = outcome {
            // OOM kills surface as SIGKILL; note the distinction in the log.
            if sig == libc::SIGKILL {
                if let Some(cgroup) = cgroup {
                    if cgroup.oom_kill_count() > 0 {
                        tracing::warn!(container_id = %config.id, "Container was OOM-killed");
                    }
                }
            }
        }
        if let Some(notifier) = oom_notifier {
            notifier.stop();
        }

        self.teardown(config, cgroup);
        tracing::info!(container_id = %config.id, exit_code, "Container exited");
        Ok(exit_code)
    }

    /// Release the per-container resources after exit. Idempotent.
    pub fn teardown(&self, config: &ContainerConfig, cgroup: Option<&CgroupManager>) {
        if config.net_mode == NetMode::Bridge {
            let (host_ifname, _) = VethPair::names_for(&config.id);
            VethPair::delete(&host_ifname);
            let leases = LeaseStore::new(
                self.runtime.paths.leases(),
                self.runtime.paths.network_lock(),
            );
            if let Err(e) = leases.release(&config.id) {
                tracing::warn!(container_id = %config.id, error = %e, "Failed to release lease");
            }
        }
        if let Some(cgroup) = cgroup {
            if let Err(e) = cgroup.delete() {
                tracing::warn!(container_id = %config.id, error = %e, "Failed to delete cgroup");
            }
        }
    }

    /// Undo a launch that failed between resource allocation and running.
    fn cleanup_failed_launch(
        &self,
        config: &ContainerConfig,
        store: &StateStore,
        cgroup: Option<&CgroupManager>,
        pid: i32,
    ) {
        if pid > 0 && sys::process_exists(pid) {
            let _ = sys::kill(pid, libc::SIGKILL);
            let _ = sys::waitpid(pid, false);
        }

        let (lower, upper, work, merged) = self.runtime.paths.overlay_dirs(&config.id);
        let overlay = OverlayFs {
            lower,
            upper,
            work,
            merged,
            image_root: config.image_root.clone(),
        };
        let _ = filesystem::unmount_detach(&overlay.merged);
        let _ = overlay.remove_dirs();

        self.teardown(config, cgroup);

        if let Ok(mut state) = store.load_state(&config.id) {
            state.set_dead();
            let _ = store.save_state(&state);
        }
    }
}

/// Everything the child does between clone and execve. Never returns on
/// success.
fn child_main(
    config: &ContainerConfig,
    pipes: &mut handshake::ChildPipes,
    pod_ns_files: Vec<(libc::c_int, File)>,
    stdio: &StdioPlan,
    runtime: &Runtime,
) -> MinidockError {
    match child_setup(config, pipes, pod_ns_files, stdio, runtime) {
        Ok(()) => {}
        Err(e) => return e,
    }

    if let Err(e) = pipes.send_ready() {
        return e;
    }

    let err = sys::execvp(&config.argv);
    // execvp only returns on failure; exit with the shell convention.
    let code = match &err {
        MinidockError::Kernel { errno: "ENOENT", .. } => 127,
        MinidockError::Kernel { errno: "EACCES", .. } => 126,
        _ => 126,
    };
    eprintln!("mini-docker: cannot exec {:?}: {err}", config.argv.first());
    // SAFETY: terminating the child.
    unsafe { libc::_exit(code) };
}

fn child_setup(
    config: &ContainerConfig,
    pipes: &mut handshake::ChildPipes,
    pod_ns_files: Vec<(libc::c_int, File)>,
    stdio: &StdioPlan,
    runtime: &Runtime,
) -> MinidockResult<()> {
    // Join the pod's pinned namespaces before anything else touches them.
    for (flag, file) in &pod_ns_files {
        sys::setns(file.as_raw_fd(), *flag)?;
    }
    drop(pod_ns_files);

    pipes.send_born()?;
    pipes.wait_go()?;

    stdio.child_setup()?;

    // UTS: pod members share the pod's hostname.
    if config.pod_id.is_none() {
        match sys::sethostname(&config.hostname) {
            Ok(()) => {}
            Err(e) if config.rootless => {
                tracing::debug!(error = %e, "sethostname failed in rootless mode");
            }
            Err(e) => return Err(e),
        }
    }

    let prepared = filesystem::setup_rootfs(config, &runtime.paths, runtime.profile.can_mount)?;

    // An overlay that fell back to bind mode must be visible to later
    // invocations; the store is unreachable after the pivot, so record it
    // now. The parent only reads the state after the ready byte.
    if prepared.mode != config.rootfs_mode {
        let store = StateStore::new(runtime.paths.clone());
        if let Ok(mut state) = store.load_state(&config.id) {
            state.rootfs_mode = prepared.mode;
            let _ = store.save_state(&state);
        }
    }

    // Bridge-mode interfaces were configured by the parent; everything else
    // gets its loopback here.
    if config.net_mode != NetMode::Bridge {
        if let Err(e) = loopback_up() {
            tracing::debug!(error = %e, "Could not bring loopback up");
        }
    }

    filesystem::enter_root(&prepared.root)?;

    build_environment(config);

    if std::env::set_current_dir(&config.workdir).is_err() {
        std::env::set_current_dir("/")?;
    }

    let user = config.parse_user()?;
    security::apply_pre_exec(user, config.rootless)?;

    Ok(())
}

/// Reset the environment to the container's view.
fn build_environment(config: &ContainerConfig) {
    let stale: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in stale {
        std::env::remove_var(&key);
    }

    std::env::set_var(
        "PATH",
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
    );
    std::env::set_var("HOME", "/root");
    std::env::set_var("TERM", "xterm");
    std::env::set_var("HOSTNAME", &config.hostname);

    for pair in &config.env {
        if let Some((key, value)) = pair.split_once('=') {
            std::env::set_var(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = LaunchOptions::default();
        assert!(!opts.detach && !opts.tty && !opts.interactive);
    }
}
