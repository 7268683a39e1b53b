//! The launch handshake protocol.
//!
//! Two pipes connect parent and child:
//!
//! ```text
//! child  -> parent:  'B'              born, waiting for setup
//! parent -> child:   'G'              uid/gid maps written, cgroup joined,
//!                                     veth attached; go
//! child  -> parent:  'R'              security applied, about to execve
//!         or         'E' <line> '\n'  setup failed; line is "kind: detail"
//! ```
//!
//! The child blocking on 'G' is what closes the rootless race: it must not
//! call setuid before the parent has written `uid_map`. The pipes carry
//! CLOEXEC so the container process never inherits them.

use std::fs::File;
use std::io::{Read, Write};

use minidock_common::{MinidockError, MinidockResult};
use rustix::pipe::{pipe_with, PipeFlags};

const BORN: u8 = b'B';
const GO: u8 = b'G';
const READY: u8 = b'R';
const ERROR: u8 = b'E';

/// Parent's ends of the two pipes.
pub struct ParentPipes {
    from_child: File,
    to_child: File,
}

/// Child's ends of the two pipes.
pub struct ChildPipes {
    from_parent: File,
    to_parent: File,
}

/// Create both synchronisation pipes. Call before forking; each side drops
/// the struct it does not own.
pub fn pipes() -> MinidockResult<(ParentPipes, ChildPipes)> {
    let (p2c_read, p2c_write) =
        pipe_with(PipeFlags::CLOEXEC).map_err(|e| MinidockError::kernel("pipe2", &e.into()))?;
    let (c2p_read, c2p_write) =
        pipe_with(PipeFlags::CLOEXEC).map_err(|e| MinidockError::kernel("pipe2", &e.into()))?;

    Ok((
        ParentPipes {
            from_child: File::from(c2p_read),
            to_child: File::from(p2c_write),
        },
        ChildPipes {
            from_parent: File::from(p2c_read),
            to_parent: File::from(c2p_write),
        },
    ))
}

fn read_byte(file: &mut File) -> MinidockResult<Option<u8>> {
    let mut buf = [0u8; 1];
    loop {
        match file.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

impl ParentPipes {
    /// Wait for the child's birth byte.
    pub fn wait_born(&mut self) -> MinidockResult<()> {
        match read_byte(&mut self.from_child)? {
            Some(BORN) => Ok(()),
            _ => Err(MinidockError::HandshakeBroken {
                detail: "child exited before entering the handshake".to_string(),
            }),
        }
    }

    /// Release the child.
    pub fn send_go(&mut self) -> MinidockResult<()> {
        self.to_child.write_all(&[GO])?;
        Ok(())
    }

    /// Wait for readiness or collect the child's one-line failure report.
    pub fn wait_ready(&mut self) -> MinidockResult<()> {
        match read_byte(&mut self.from_child)? {
            Some(READY) => Ok(()),
            Some(ERROR) => {
                let mut detail = String::new();
                let _ = self.from_child.read_to_string(&mut detail);
                Err(MinidockError::HandshakeBroken {
                    detail: detail.trim().to_string(),
                })
            }
            _ => Err(MinidockError::HandshakeBroken {
                detail: "child died before signalling readiness".to_string(),
            }),
        }
    }
}

impl ChildPipes {
    /// Announce birth.
    pub fn send_born(&mut self) -> MinidockResult<()> {
        self.to_parent.write_all(&[BORN])?;
        Ok(())
    }

    /// Block until the parent finishes maps, cgroup, and network.
    pub fn wait_go(&mut self) -> MinidockResult<()> {
        match read_byte(&mut self.from_parent)? {
            Some(GO) => Ok(()),
            _ => Err(MinidockError::HandshakeBroken {
                detail: "parent closed the handshake pipe".to_string(),
            }),
        }
    }

    /// Signal readiness right before execve.
    pub fn send_ready(&mut self) -> MinidockResult<()> {
        self.to_parent.write_all(&[READY])?;
        Ok(())
    }

    /// Report a setup failure as a single line.
    pub fn send_error(&mut self, err: &MinidockError) {
        let line = format!("{err}");
        let _ = self.to_parent.write_all(&[ERROR]);
        let _ = self.to_parent.write_all(line.as_bytes());
        let _ = self.to_parent.write_all(b"\n");
        let _ = self.to_parent.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_in_process() {
        let (mut parent, mut child) = pipes().unwrap();

        child.send_born().unwrap();
        parent.wait_born().unwrap();

        parent.send_go().unwrap();
        child.wait_go().unwrap();

        child.send_ready().unwrap();
        parent.wait_ready().unwrap();
    }

    #[test]
    fn error_line_is_surfaced() {
        let (mut parent, mut child) = pipes().unwrap();

        child.send_born().unwrap();
        parent.wait_born().unwrap();

        child.send_error(&MinidockError::Kernel {
            op: "mount",
            errno: "EPERM",
        });
        drop(child);

        let err = parent.wait_ready().unwrap_err();
        match err {
            MinidockError::HandshakeBroken { detail } => {
                assert!(detail.contains("mount"));
                assert!(detail.contains("EPERM"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn closed_pipe_is_handshake_broken() {
        let (mut parent, child) = pipes().unwrap();
        drop(child);
        assert!(matches!(
            parent.wait_born().unwrap_err(),
            MinidockError::HandshakeBroken { .. }
        ));
    }
}
