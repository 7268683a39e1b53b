//! Container stdio plumbing.
//!
//! Foreground containers get pipes (or a PTY with `--tty`) whose parent
//! ends are pumped to the invoking terminal and tee'd into
//! `container.log`; detached containers write the log only.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::Path;

use minidock_common::{MinidockError, MinidockResult};
use rustix::pipe::{pipe_with, PipeFlags};

use super::pty::{open_pty, set_controlling_tty, Pty};
use crate::sys;

/// How the container's stdio is wired.
pub enum StdioPlan {
    /// Pipes to the parent; stdin optional.
    Foreground {
        /// Child's stdout+stderr write end / parent's read end.
        out_read: Option<File>,
        /// Write end handed to the child.
        out_write: OwnedFd,
        /// Parent's write end for stdin, when interactive.
        in_write: Option<File>,
        /// Read end handed to the child.
        in_read: Option<OwnedFd>,
    },
    /// PTY pair.
    Tty {
        /// The pair; the parent keeps the master.
        pty: Pty,
    },
    /// Log file only.
    Detached {
        /// Opened log file handed to the child.
        log: File,
    },
}

impl StdioPlan {
    /// Build the plan in the parent, before forking.
    pub fn new(detach: bool, tty: bool, interactive: bool, log_path: &Path) -> MinidockResult<Self> {
        if detach {
            let log = File::options().create(true).append(true).open(log_path)?;
            return Ok(Self::Detached { log });
        }
        if tty {
            return Ok(Self::Tty { pty: open_pty()? });
        }

        // CLOEXEC keeps the raw pipe ends out of the exec'd command; the
        // dup2'd copies on 0/1/2 survive the exec.
        let (out_read, out_write) = pipe_with(PipeFlags::CLOEXEC)
            .map_err(|e| MinidockError::kernel("pipe2", &e.into()))?;
        let (in_read, in_write) = if interactive {
            let (r, w) = pipe_with(PipeFlags::CLOEXEC)
                .map_err(|e| MinidockError::kernel("pipe2", &e.into()))?;
            (Some(r), Some(File::from(w)))
        } else {
            (None, None)
        };

        Ok(Self::Foreground {
            out_read: Some(File::from(out_read)),
            out_write,
            in_write,
            in_read,
        })
    }

    /// Wire the child's fds. Runs in the child; the parent ends are closed
    /// over there by dropping the plan.
    pub fn child_setup(&self) -> MinidockResult<()> {
        match self {
            Self::Foreground {
                out_write, in_read, ..
            } => {
                sys::dup2(out_write.as_raw_fd(), libc::STDOUT_FILENO)?;
                sys::dup2(out_write.as_raw_fd(), libc::STDERR_FILENO)?;
                match in_read {
                    Some(fd) => sys::dup2(fd.as_raw_fd(), libc::STDIN_FILENO)?,
                    None => redirect_stdin_to_null()?,
                }
            }
            Self::Tty { pty } => {
                sys::setsid()?;
                set_controlling_tty(pty.slave.as_raw_fd())?;
                sys::dup2(pty.slave.as_raw_fd(), libc::STDIN_FILENO)?;
                sys::dup2(pty.slave.as_raw_fd(), libc::STDOUT_FILENO)?;
                sys::dup2(pty.slave.as_raw_fd(), libc::STDERR_FILENO)?;
            }
            Self::Detached { log } => {
                sys::dup2(log.as_raw_fd(), libc::STDOUT_FILENO)?;
                sys::dup2(log.as_raw_fd(), libc::STDERR_FILENO)?;
                redirect_stdin_to_null()?;
            }
        }
        Ok(())
    }

    /// Start the parent-side pump threads. Returns handles to join after
    /// the child is reaped.
    pub fn start_pump(self, log_path: &Path) -> MinidockResult<StdioPump> {
        let mut out_handles = Vec::new();
        let mut in_handles = Vec::new();

        match self {
            Self::Foreground {
                out_read,
                out_write,
                in_write,
                in_read,
            } => {
                // The child owns these now; keeping them open would hold
                // the pipe write end alive past the child's exit.
                drop(out_write);
                drop(in_read);

                let log = File::options().create(true).append(true).open(log_path)?;
                if let Some(reader) = out_read {
                    out_handles.push(std::thread::spawn(move || {
                        pump(reader, std::io::stdout(), Some(log));
                    }));
                }
                if let Some(writer) = in_write {
                    in_handles.push(spawn_stdin_pump(writer));
                }
            }
            Self::Tty { pty } => {
                drop(pty.slave);
                let log = File::options().create(true).append(true).open(log_path)?;

                let master_read = File::from(pty.master.try_clone().map_err(MinidockError::Io)?);
                out_handles.push(std::thread::spawn(move || {
                    pump(master_read, std::io::stdout(), Some(log));
                }));
                in_handles.push(spawn_stdin_pump(File::from(pty.master)));
            }
            Self::Detached { log } => {
                drop(log);
            }
        }

        Ok(StdioPump {
            out_handles,
            _in_handles: in_handles,
        })
    }
}

/// Running pump threads.
pub struct StdioPump {
    out_handles: Vec<std::thread::JoinHandle<()>>,
    /// Stdin pumps block on the terminal and die with the process.
    _in_handles: Vec<std::thread::JoinHandle<()>>,
}

impl StdioPump {
    /// Drain the output pumps: they hit EOF once the child is gone.
    pub fn finish(self) {
        for handle in self.out_handles {
            let _ = handle.join();
        }
    }
}

fn redirect_stdin_to_null() -> MinidockResult<()> {
    let null = File::open("/dev/null")?;
    sys::dup2(null.as_raw_fd(), libc::STDIN_FILENO)
}

/// Copy `reader` to `sink`, tee-ing into the log.
fn pump<W: Write>(mut reader: File, mut sink: W, mut log: Option<File>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if sink.write_all(&buf[..n]).is_err() {
                    break;
                }
                let _ = sink.flush();
                if let Some(log) = log.as_mut() {
                    let _ = log.write_all(&buf[..n]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Forward the invoking terminal's stdin into the container.
fn spawn_stdin_pump(mut writer: File) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if writer.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_plan_opens_log() {
        let temp = tempfile::tempdir().unwrap();
        let log = temp.path().join("container.log");
        let plan = StdioPlan::new(true, false, false, &log).unwrap();
        assert!(matches!(plan, StdioPlan::Detached { .. }));
        assert!(log.exists());
    }

    #[test]
    fn foreground_plan_has_pipes() {
        let temp = tempfile::tempdir().unwrap();
        let log = temp.path().join("container.log");

        let plan = StdioPlan::new(false, false, false, &log).unwrap();
        match &plan {
            StdioPlan::Foreground {
                out_read, in_write, ..
            } => {
                assert!(out_read.is_some());
                assert!(in_write.is_none());
            }
            _ => panic!("expected foreground plan"),
        }

        let interactive = StdioPlan::new(false, false, true, &log).unwrap();
        match &interactive {
            StdioPlan::Foreground { in_write, .. } => assert!(in_write.is_some()),
            _ => panic!("expected foreground plan"),
        }
    }

    #[test]
    fn pump_tees_to_log() {
        let temp = tempfile::tempdir().unwrap();
        let log_path = temp.path().join("log");

        let (read, write) = pipe_with(PipeFlags::CLOEXEC).unwrap();
        let mut writer = File::from(write);
        writer.write_all(b"hello from the container\n").unwrap();
        drop(writer);

        let log = File::create(&log_path).unwrap();
        let mut sink = Vec::new();
        pump(File::from(read), &mut sink, Some(log));

        assert_eq!(sink, b"hello from the container\n");
        assert_eq!(
            std::fs::read(&log_path).unwrap(),
            b"hello from the container\n"
        );
    }
}
