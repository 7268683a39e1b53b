//! Cgroup-v2 management.
//!
//! Each container gets a leaf under `<root>/mini-docker/<id>` in the
//! unified hierarchy. In privileged mode `<root>` is `/sys/fs/cgroup`; in
//! rootless mode it is the user-delegated subtree this process already runs
//! in (read from `/proc/self/cgroup`).

#![allow(unsafe_code)]

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use minidock_common::{Limits, MinidockError, MinidockResult};

use crate::sys;

/// Name of our subtree below the cgroup root.
const SUBTREE: &str = "mini-docker";

/// Controllers the launcher needs enabled on parents.
const CONTROLLERS: &str = "+cpu +memory +pids";

/// CPU period written to `cpu.max`, microseconds.
const CPU_PERIOD_US: u64 = 100_000;

/// Manages one container's cgroup.
#[derive(Debug)]
pub struct CgroupManager {
    container_id: String,
    path: PathBuf,
}

/// Counters from `cpu.stat`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuStat {
    /// Total CPU time, microseconds.
    pub usage_usec: u64,
    /// User CPU time, microseconds.
    pub user_usec: u64,
    /// System CPU time, microseconds.
    pub system_usec: u64,
}

impl CgroupManager {
    /// Create the cgroup for a container and apply its limits.
    ///
    /// In rootless mode any failure is downgraded to `Ok(None)` with a
    /// warning, unless the user explicitly asked for a limit.
    pub fn create(id: &str, limits: &Limits, rootless: bool) -> MinidockResult<Option<Self>> {
        match Self::create_inner(id, limits, rootless) {
            Ok(manager) => Ok(Some(manager)),
            Err(e) if rootless && limits.is_empty() => {
                tracing::warn!(container_id = %id, error = %e, "Cgroup setup failed, continuing without limits");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn create_inner(id: &str, limits: &Limits, rootless: bool) -> MinidockResult<Self> {
        let root = cgroup_root(rootless)?;
        let parent = root.join(SUBTREE);
        std::fs::create_dir_all(&parent).map_err(|e| MinidockError::Cgroup {
            message: format!("cannot create {}: {e}", parent.display()),
        })?;

        enable_controllers(&root);
        enable_controllers(&parent);

        let path = parent.join(id);
        std::fs::create_dir_all(&path).map_err(|e| MinidockError::Cgroup {
            message: format!("cannot create {}: {e}", path.display()),
        })?;

        tracing::debug!(container_id = %id, path = %path.display(), "Created cgroup");

        let manager = Self {
            container_id: id.to_string(),
            path,
        };
        manager.apply_limits(limits)?;
        Ok(manager)
    }

    /// Open the existing cgroup for a container, if present.
    #[must_use]
    pub fn open(id: &str, rootless: bool) -> Option<Self> {
        let root = cgroup_root(rootless).ok()?;
        let path = root.join(SUBTREE).join(id);
        path.is_dir().then(|| Self {
            container_id: id.to_string(),
            path,
        })
    }

    /// The cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the resource limits.
    pub fn apply_limits(&self, limits: &Limits) -> MinidockResult<()> {
        let memory = limits
            .memory_bytes
            .map_or("max".to_string(), |b| b.to_string());
        self.write_control("memory.max", &memory)?;

        let cpu = match limits.cpu_percent {
            Some(100) | None => format!("max {CPU_PERIOD_US}"),
            Some(percent) => format!("{} {CPU_PERIOD_US}", u64::from(percent) * 1_000),
        };
        self.write_control("cpu.max", &cpu)?;

        let pids = limits.pids_max.map_or("max".to_string(), |n| n.to_string());
        self.write_control("pids.max", &pids)?;

        tracing::debug!(container_id = %self.container_id, ?limits, "Applied cgroup limits");
        Ok(())
    }

    fn write_control(&self, file: &str, value: &str) -> MinidockResult<()> {
        std::fs::write(self.path.join(file), value).map_err(|e| MinidockError::Cgroup {
            message: format!("write {file} <- {value}: {e}"),
        })
    }

    /// Enroll a process.
    pub fn add_process(&self, pid: u32) -> MinidockResult<()> {
        self.write_control("cgroup.procs", &pid.to_string())?;
        tracing::debug!(container_id = %self.container_id, pid, "Enrolled process in cgroup");
        Ok(())
    }

    /// Pids currently in the cgroup.
    #[must_use]
    pub fn procs(&self) -> Vec<u32> {
        std::fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|s| s.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    /// Kill every member: `cgroup.kill` when the kernel offers it, else
    /// SIGKILL to each listed pid, then wait for the cgroup to drain.
    pub fn kill_all(&self) {
        let kill_file = self.path.join("cgroup.kill");
        if std::fs::write(&kill_file, "1").is_err() {
            for pid in self.procs() {
                let _ = sys::kill(pid as i32, libc::SIGKILL);
            }
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.procs().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Kill members and remove the directory.
    pub fn delete(&self) -> MinidockResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        self.kill_all();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match std::fs::remove_dir(&self.path) {
                Ok(()) => {
                    tracing::debug!(container_id = %self.container_id, "Deleted cgroup");
                    return Ok(());
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(MinidockError::Cgroup {
                        message: format!("rmdir {}: {e}", self.path.display()),
                    });
                }
            }
        }
    }

    /// Current memory usage in bytes.
    pub fn memory_current(&self) -> MinidockResult<u64> {
        let content = std::fs::read_to_string(self.path.join("memory.current"))?;
        Ok(content.trim().parse().unwrap_or(0))
    }

    /// Number of OOM kills recorded in `memory.events`.
    #[must_use]
    pub fn oom_kill_count(&self) -> u64 {
        std::fs::read_to_string(self.path.join("memory.events"))
            .ok()
            .and_then(|content| {
                content.lines().find_map(|line| {
                    line.strip_prefix("oom_kill ")
                        .and_then(|v| v.trim().parse().ok())
                })
            })
            .unwrap_or(0)
    }

    /// Watch `memory.events` and log OOM kills as they happen.
    ///
    /// cgroup-v2 event files signal changes via EPOLLPRI; the watcher
    /// re-reads the `oom_kill` counter on every wakeup and stops when asked
    /// or when the file goes away with the cgroup.
    #[must_use]
    pub fn spawn_oom_notifier(&self) -> Option<OomNotifier> {
        let events_path = self.path.join("memory.events");
        let file = std::fs::File::open(&events_path).ok()?;
        let container_id = self.container_id.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            // SAFETY: epoll fd lifecycle is contained in this thread.
            let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epoll_fd < 0 {
                return;
            }
            let mut event = libc::epoll_event {
                events: (libc::EPOLLPRI | libc::EPOLLERR) as u32,
                u64: 0,
            };
            // SAFETY: event points at a valid epoll_event.
            if unsafe {
                libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, file.as_raw_fd(), &mut event)
            } < 0
            {
                // SAFETY: closing the fd we created.
                unsafe { libc::close(epoll_fd) };
                return;
            }

            let mut seen: u64 = 0;
            while !stop_flag.load(Ordering::SeqCst) {
                let mut fired: libc::epoll_event = libc::epoll_event { events: 0, u64: 0 };
                // SAFETY: out-buffer of one event; 500ms timeout keeps the
                // stop flag responsive.
                let n = unsafe { libc::epoll_wait(epoll_fd, &mut fired, 1, 500) };
                if n < 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR)
                {
                    break;
                }
                let Ok(content) = std::fs::read_to_string(&events_path) else {
                    break;
                };
                let count = content
                    .lines()
                    .find_map(|l| l.strip_prefix("oom_kill ")?.trim().parse().ok())
                    .unwrap_or(0);
                if count > seen {
                    tracing::warn!(container_id = %container_id, oom_kills = count, "OOM kill in container");
                    seen = count;
                }
            }
            // SAFETY: closing the fd we created.
            unsafe { libc::close(epoll_fd) };
        });

        Some(OomNotifier {
            stop,
            handle: Some(handle),
        })
    }

    /// CPU statistics.
    pub fn cpu_stat(&self) -> MinidockResult<CpuStat> {
        let content = std::fs::read_to_string(self.path.join("cpu.stat"))?;
        let mut stat = CpuStat::default();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next().and_then(|v| v.parse().ok())) {
                (Some("usage_usec"), Some(v)) => stat.usage_usec = v,
                (Some("user_usec"), Some(v)) => stat.user_usec = v,
                (Some("system_usec"), Some(v)) => stat.system_usec = v,
                _ => {}
            }
        }
        Ok(stat)
    }
}

/// Running OOM watcher; joined on [`OomNotifier::stop`].
pub struct OomNotifier {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl OomNotifier {
    /// Signal the watcher and wait for it to finish.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OomNotifier {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Resolve the cgroup root for this mode.
fn cgroup_root(rootless: bool) -> MinidockResult<PathBuf> {
    let unified = PathBuf::from("/sys/fs/cgroup");
    if !unified.join("cgroup.controllers").exists() {
        return Err(MinidockError::Cgroup {
            message: "cgroup v2 unified hierarchy not mounted".to_string(),
        });
    }
    if !rootless {
        return Ok(unified);
    }

    // The delegated subtree this process lives in: "0::<path>" in
    // /proc/self/cgroup.
    let content = std::fs::read_to_string("/proc/self/cgroup")?;
    let own = content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::trim)
        .ok_or_else(|| MinidockError::Cgroup {
            message: "no cgroup v2 entry in /proc/self/cgroup".to_string(),
        })?;
    Ok(unified.join(own.trim_start_matches('/')))
}

/// Best-effort: enable the controllers on a parent's subtree_control.
fn enable_controllers(parent: &Path) {
    let control = parent.join("cgroup.subtree_control");
    if control.exists() {
        if let Err(e) = std::fs::write(&control, CONTROLLERS) {
            tracing::debug!(path = %control.display(), error = %e, "Could not enable controllers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_rendering() {
        // Verify the strings written to the control files via a scratch dir
        // standing in for the cgroup leaf.
        let temp = tempfile::tempdir().unwrap();
        let manager = CgroupManager {
            container_id: "test".to_string(),
            path: temp.path().to_path_buf(),
        };

        manager
            .apply_limits(&Limits {
                memory_bytes: Some(20 * 1024 * 1024),
                cpu_percent: Some(50),
                pids_max: Some(5),
            })
            .unwrap();

        let read = |f: &str| std::fs::read_to_string(temp.path().join(f)).unwrap();
        assert_eq!(read("memory.max"), "20971520");
        assert_eq!(read("cpu.max"), "50000 100000");
        assert_eq!(read("pids.max"), "5");
    }

    #[test]
    fn unlimited_rendering() {
        let temp = tempfile::tempdir().unwrap();
        let manager = CgroupManager {
            container_id: "test".to_string(),
            path: temp.path().to_path_buf(),
        };
        manager.apply_limits(&Limits::default()).unwrap();

        let read = |f: &str| std::fs::read_to_string(temp.path().join(f)).unwrap();
        assert_eq!(read("memory.max"), "max");
        assert_eq!(read("cpu.max"), "max 100000");
        assert_eq!(read("pids.max"), "max");

        // 100 percent is also unlimited.
        manager
            .apply_limits(&Limits {
                cpu_percent: Some(100),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(read("cpu.max"), "max 100000");
    }

    #[test]
    fn oom_count_parsing() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            temp.path().join("memory.events"),
            "low 0\nhigh 2\nmax 9\noom 1\noom_kill 3\n",
        )
        .unwrap();
        let manager = CgroupManager {
            container_id: "test".to_string(),
            path: temp.path().to_path_buf(),
        };
        assert_eq!(manager.oom_kill_count(), 3);
    }

    #[test]
    fn cpu_stat_parsing() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            temp.path().join("cpu.stat"),
            "usage_usec 12345\nuser_usec 8000\nsystem_usec 4345\n",
        )
        .unwrap();
        let manager = CgroupManager {
            container_id: "test".to_string(),
            path: temp.path().to_path_buf(),
        };
        let stat = manager.cpu_stat().unwrap();
        assert_eq!(stat.usage_usec, 12345);
        assert_eq!(stat.user_usec, 8000);
    }

    #[test]
    #[ignore = "requires root and cgroup v2"]
    fn create_and_delete_cgroup() {
        let manager = CgroupManager::create("minidock-test", &Limits::default(), false)
            .unwrap()
            .unwrap();
        assert!(manager.path().exists());
        manager.delete().unwrap();
    }
}
