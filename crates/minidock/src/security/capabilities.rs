//! Linux capability policy.
//!
//! Starting from the permitted set after namespacing, every capability is
//! dropped except the four a contained workload still needs. The bounding
//! set is cleared of everything else so re-gaining via execve is
//! impossible, and the ambient set is emptied.

use caps::{CapSet, Capability, CapsHashSet};
use minidock_common::{MinidockError, MinidockResult};

use crate::sys;

/// Capabilities a container keeps.
pub const KEPT_CAPABILITIES: &[Capability] = &[
    Capability::CAP_CHOWN,
    Capability::CAP_SETUID,
    Capability::CAP_SETGID,
    Capability::CAP_KILL,
];

/// Drop to the container capability set.
pub fn apply_container_caps() -> MinidockResult<()> {
    let kept: CapsHashSet = KEPT_CAPABILITIES.iter().copied().collect();

    sys::clear_ambient_caps()?;

    // Clear the bounding set of everything we do not keep. Only caps the
    // kernel actually knows are present in the current bounding set.
    let bounding = caps::read(None, CapSet::Bounding).map_err(caps_err)?;
    for cap in bounding {
        if !kept.contains(&cap) {
            caps::drop(None, CapSet::Bounding, cap).map_err(caps_err)?;
        }
    }

    let empty = CapsHashSet::new();
    caps::set(None, CapSet::Inheritable, &empty).map_err(caps_err)?;
    caps::set(None, CapSet::Effective, &kept).map_err(caps_err)?;
    caps::set(None, CapSet::Permitted, &kept).map_err(caps_err)?;

    tracing::debug!(kept = ?KEPT_CAPABILITIES, "Dropped capabilities");
    Ok(())
}

fn caps_err(err: caps::errors::CapsError) -> MinidockError {
    MinidockError::Internal {
        message: format!("capability operation failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kept_set_is_minimal() {
        assert_eq!(KEPT_CAPABILITIES.len(), 4);
        assert!(!KEPT_CAPABILITIES.contains(&Capability::CAP_SYS_ADMIN));
        assert!(!KEPT_CAPABILITIES.contains(&Capability::CAP_NET_RAW));
        assert!(!KEPT_CAPABILITIES.contains(&Capability::CAP_SYS_PTRACE));
        assert!(KEPT_CAPABILITIES.contains(&Capability::CAP_KILL));
    }
}
