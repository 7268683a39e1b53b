//! Virtual ethernet pair management.

use std::process::Command;

use minidock_common::{MinidockError, MinidockResult};

use crate::bridge::run_ip;
use crate::BRIDGE_IP;

/// A veth pair: `host` stays in the host namespace attached to the bridge,
/// the peer becomes `eth0` inside the container's network namespace.
pub struct VethPair {
    /// Host-side interface name (`veth` + first 8 id chars).
    pub host: String,
    /// Temporary peer name used until the rename inside the namespace.
    pub peer: String,
}

impl VethPair {
    /// Interface name inside the container after the rename.
    pub const CONTAINER_IFNAME: &'static str = "eth0";

    /// Derive interface names for a container id. Linux caps interface names
    /// at 15 characters.
    #[must_use]
    pub fn names_for(container_id: &str) -> (String, String) {
        let short = &container_id[..container_id.len().min(8)];
        (format!("veth{short}"), format!("vp{short}"))
    }

    /// Create the pair in the host namespace.
    ///
    /// The peer gets a temporary name; naming it `eth0` host-side would
    /// collide with the host's own interface.
    pub fn create(container_id: &str) -> MinidockResult<Self> {
        let (host, peer) = Self::names_for(container_id);
        tracing::debug!(host = %host, peer = %peer, "Creating veth pair");
        run_ip(&["link", "add", &host, "type", "veth", "peer", "name", &peer])?;
        Ok(Self { host, peer })
    }

    /// Move the peer into the network namespace of `pid`.
    pub fn move_peer_to(&self, pid: u32) -> MinidockResult<()> {
        tracing::debug!(peer = %self.peer, pid, "Moving peer into netns");
        run_ip(&["link", "set", &self.peer, "netns", &pid.to_string()])
    }

    /// Configure the container side from the parent: rename the peer to
    /// `eth0`, bring `lo` and `eth0` up, assign the address, and set the
    /// default route via the bridge. Runs inside the target namespace via
    /// `nsenter`.
    pub fn configure_inside(&self, pid: u32, ip: &str) -> MinidockResult<()> {
        let cidr = format!("{ip}/24");
        tracing::debug!(pid, ip = %cidr, "Configuring container interface");

        run_in_netns(pid, &["ip", "link", "set", &self.peer, "name", Self::CONTAINER_IFNAME])?;
        run_in_netns(pid, &["ip", "link", "set", "lo", "up"])?;
        run_in_netns(pid, &["ip", "addr", "add", &cidr, "dev", Self::CONTAINER_IFNAME])?;
        run_in_netns(pid, &["ip", "link", "set", Self::CONTAINER_IFNAME, "up"])?;
        run_in_netns(pid, &["ip", "route", "add", "default", "via", BRIDGE_IP])?;
        Ok(())
    }

    /// Delete the host side. The kernel removes the peer automatically when
    /// its namespace dies, so absence is not an error.
    pub fn delete(host_ifname: &str) {
        let _ = Command::new("ip")
            .args(["link", "delete", host_ifname])
            .output();
    }
}

/// Run a command inside the network namespace of `pid`.
fn run_in_netns(pid: u32, args: &[&str]) -> MinidockResult<()> {
    let pid_str = pid.to_string();
    let output = Command::new("nsenter")
        .args(["-t", &pid_str, "-n"])
        .args(args)
        .output()
        .map_err(|e| MinidockError::BridgeUnavailable {
            message: format!("failed to run nsenter: {e}"),
        })?;

    if !output.status.success() {
        return Err(MinidockError::BridgeUnavailable {
            message: format!(
                "command in netns failed: {:?}: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_names_fit_linux_limit() {
        let (host, peer) = VethPair::names_for("a1b2c3d4e5f6");
        assert_eq!(host, "vetha1b2c3d4");
        assert_eq!(peer, "vpa1b2c3d4");
        assert!(host.len() <= 15);
        assert!(peer.len() <= 15);
    }

    #[test]
    fn short_id_names() {
        let (host, peer) = VethPair::names_for("ab1");
        assert_eq!(host, "vethab1");
        assert_eq!(peer, "vpab1");
    }
}
