//! `exec`: run a command inside a running container's namespaces.
//!
//! The helper forks, enrolls itself in the target's cgroup while it can
//! still see the host cgroupfs, joins the target's namespaces via
//! `/proc/<pid>/ns/*`, then forks again so the grandchild actually lands in
//! the target PID namespace, re-applies the security sequence, and execs.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use minidock_common::{MinidockError, MinidockResult};

use super::Manager;
use crate::cgroup::CgroupManager;
use crate::namespace::NAMESPACE_TYPES;
use crate::security;
use crate::state::ContainerStatus;
use crate::sys;

/// Everything `exec` needs from the CLI.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Container reference.
    pub target: String,
    /// Command to execute.
    pub argv: Vec<String>,
    /// Extra `KEY=VALUE` environment pairs.
    pub env: Vec<String>,
    /// Working directory override.
    pub workdir: Option<String>,
    /// `uid[:gid]` override.
    pub user: Option<String>,
}

impl Manager {
    /// Execute a command inside a running container. Returns its exit code.
    pub fn exec(&self, req: ExecRequest) -> MinidockResult<i32> {
        if req.argv.is_empty() {
            return Err(MinidockError::ConfigInvalid {
                message: "exec requires a command".to_string(),
            });
        }

        let id = self.store().resolve(&req.target)?;
        let (config, pid, ns_files) = {
            // Serialised against stop/rm; released before waiting on the
            // exec'd command.
            let _lock = self.store().lock(&id)?;
            let config = self.store().load_config(&id)?;
            let state = self.store().load_state(&id)?;
            if state.status != ContainerStatus::Running {
                return Err(MinidockError::StateConflict {
                    message: format!("container {id} is not running"),
                });
            }
            let pid = state.pid.ok_or_else(|| MinidockError::Internal {
                message: "running container without a pid".to_string(),
            })?;

            // Open every namespace the target has; a vanished process
            // surfaces here as not-running.
            let mut ns_files: Vec<(libc::c_int, File)> = Vec::new();
            for (ns, flag) in NAMESPACE_TYPES {
                if *ns == "user" && !config.rootless {
                    continue;
                }
                let path = format!("/proc/{pid}/ns/{ns}");
                match File::open(&path) {
                    Ok(file) => ns_files.push((*flag, file)),
                    Err(_) => {
                        return Err(MinidockError::StateConflict {
                            message: format!("container {id} is gone (no {path})"),
                        })
                    }
                }
            }
            (config, pid, ns_files)
        };

        tracing::info!(container_id = %id, pid, command = ?req.argv, "Executing in container");

        let user = match &req.user {
            Some(_) => {
                let probe = crate::state::ContainerConfig {
                    user: req.user.clone(),
                    ..config.clone()
                };
                probe.parse_user()?
            }
            None => config.parse_user()?,
        };

        let helper = sys::fork()?;
        if helper == 0 {
            let code = exec_helper(&config, &req, ns_files, user);
            // SAFETY: child exit.
            unsafe { libc::_exit(code) };
        }

        Ok(sys::waitpid(helper, false)?.exit_code())
    }
}

/// Runs in the forked helper. Returns the exit code to propagate.
fn exec_helper(
    config: &crate::state::ContainerConfig,
    req: &ExecRequest,
    ns_files: Vec<(libc::c_int, File)>,
    user: Option<(u32, u32)>,
) -> i32 {
    // Never a new cgroup: the helper joins the container's existing one
    // before the mount namespace hides the host cgroupfs.
    if let Some(cgroup) = CgroupManager::open(&config.id, config.rootless) {
        // SAFETY: getpid has no failure modes.
        let own_pid = unsafe { libc::getpid() } as u32;
        if let Err(e) = cgroup.add_process(own_pid) {
            tracing::warn!(error = %e, "Could not join the container's cgroup");
        }
    }

    for (flag, file) in &ns_files {
        if let Err(e) = sys::setns(file.as_raw_fd(), *flag) {
            eprintln!("mini-docker: exec: {e}");
            return 126;
        }
    }
    drop(ns_files);

    // setns(pid) affects children only: fork so the command sees the
    // container's PID namespace, with the container's init as its init.
    let grandchild = match sys::fork() {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!("mini-docker: exec: {e}");
            return 126;
        }
    };

    if grandchild == 0 {
        let workdir = req
            .workdir
            .clone()
            .unwrap_or_else(|| config.workdir.to_string_lossy().to_string());
        if std::env::set_current_dir(&workdir).is_err() {
            let _ = std::env::set_current_dir("/");
        }

        std::env::set_var(
            "PATH",
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
        );
        for pair in config.env.iter().chain(req.env.iter()) {
            if let Some((key, value)) = pair.split_once('=') {
                std::env::set_var(key, value);
            }
        }

        // Re-drop from the host set rather than inheriting the target's.
        if let Err(e) = security::apply_pre_exec(user, config.rootless) {
            eprintln!("mini-docker: exec: {e}");
            // SAFETY: grandchild exit.
            unsafe { libc::_exit(126) };
        }

        let err = sys::execvp(&req.argv);
        let code = match &err {
            MinidockError::Kernel { errno: "ENOENT", .. } => 127,
            _ => 126,
        };
        eprintln!("mini-docker: exec: {err}");
        // SAFETY: grandchild exit.
        unsafe { libc::_exit(code) };
    }

    match sys::waitpid(grandchild, false) {
        Ok(outcome) => outcome.exit_code(),
        Err(_) => 126,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn exec_requires_a_command() {
        let temp = tempfile::tempdir().unwrap();
        let manager = Manager::new(Runtime::with_root(temp.path(), true, false));
        let err = manager
            .exec(ExecRequest {
                target: "whatever".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, MinidockError::ConfigInvalid { .. }));
    }

    #[test]
    fn exec_into_missing_container_fails() {
        let temp = tempfile::tempdir().unwrap();
        let manager = Manager::new(Runtime::with_root(temp.path(), true, false));
        manager.runtime().paths.create_dirs().unwrap();
        let err = manager
            .exec(ExecRequest {
                target: "ghost".to_string(),
                argv: vec!["/bin/true".to_string()],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, MinidockError::NotFound { .. }));
    }
}
