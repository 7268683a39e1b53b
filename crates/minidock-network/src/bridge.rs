//! Linux bridge and NAT management.

use std::process::Command;

use minidock_common::{MinidockError, MinidockResult};

use crate::{BRIDGE_IP, BRIDGE_NAME, BRIDGE_SUBNET};

/// Manages the host bridge and its MASQUERADE rule.
pub struct BridgeManager {
    name: String,
}

impl BridgeManager {
    /// Ensure the bridge exists, carries the gateway address, is up, and the
    /// NAT rule is installed. Idempotent.
    pub fn ensure() -> MinidockResult<Self> {
        let bridge = Self {
            name: BRIDGE_NAME.to_string(),
        };

        if !Self::exists(BRIDGE_NAME) {
            tracing::debug!(name = BRIDGE_NAME, "Creating bridge");
            // A concurrent launch may win the creation race; losing it is
            // fine as long as the bridge is there afterwards.
            if let Err(e) = run_ip(&["link", "add", "name", BRIDGE_NAME, "type", "bridge"]) {
                if !Self::exists(BRIDGE_NAME) {
                    return Err(e);
                }
            } else {
                run_ip(&[
                    "addr",
                    "add",
                    &format!("{BRIDGE_IP}/24"),
                    "dev",
                    BRIDGE_NAME,
                ])?;
            }
        }
        run_ip(&["link", "set", BRIDGE_NAME, "up"])?;

        // Containers cannot reach out without forwarding.
        if let Err(e) = std::fs::write("/proc/sys/net/ipv4/ip_forward", "1") {
            tracing::warn!(error = %e, "Failed to enable ip_forward");
        }

        bridge.ensure_nat()?;

        tracing::info!(name = BRIDGE_NAME, "Bridge ready");
        Ok(bridge)
    }

    /// Check if a bridge device exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        Command::new("ip")
            .args(["link", "show", name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// The bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a host-side interface to the bridge and bring it up.
    pub fn add_interface(&self, interface: &str) -> MinidockResult<()> {
        tracing::debug!(bridge = %self.name, interface, "Attaching interface to bridge");
        run_ip(&["link", "set", interface, "master", &self.name])?;
        run_ip(&["link", "set", interface, "up"])?;
        Ok(())
    }

    /// Install the MASQUERADE rule for the container subnet if absent.
    fn ensure_nat(&self) -> MinidockResult<()> {
        let check = Command::new("iptables")
            .args([
                "-t",
                "nat",
                "-C",
                "POSTROUTING",
                "-s",
                BRIDGE_SUBNET,
                "-j",
                "MASQUERADE",
            ])
            .output();

        match check {
            Ok(out) if out.status.success() => Ok(()),
            _ => {
                tracing::debug!(subnet = BRIDGE_SUBNET, "Installing MASQUERADE rule");
                let status = Command::new("iptables")
                    .args([
                        "-t",
                        "nat",
                        "-A",
                        "POSTROUTING",
                        "-s",
                        BRIDGE_SUBNET,
                        "-j",
                        "MASQUERADE",
                    ])
                    .status()
                    .map_err(|e| MinidockError::BridgeUnavailable {
                        message: format!("failed to run iptables: {e}"),
                    })?;
                if !status.success() {
                    return Err(MinidockError::BridgeUnavailable {
                        message: "iptables refused the MASQUERADE rule".to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Remove the NAT rule and delete the bridge. Called by `cleanup` once no
    /// container references the bridge.
    pub fn teardown() -> MinidockResult<()> {
        let _ = Command::new("iptables")
            .args([
                "-t",
                "nat",
                "-D",
                "POSTROUTING",
                "-s",
                BRIDGE_SUBNET,
                "-j",
                "MASQUERADE",
            ])
            .status();

        if Self::exists(BRIDGE_NAME) {
            let _ = Command::new("ip")
                .args(["link", "set", BRIDGE_NAME, "down"])
                .status();
            run_ip(&["link", "delete", BRIDGE_NAME, "type", "bridge"])?;
            tracing::info!(name = BRIDGE_NAME, "Bridge removed");
        }
        Ok(())
    }
}

/// Run an `ip` command, mapping failure onto `net.bridge-unavailable`.
pub(crate) fn run_ip(args: &[&str]) -> MinidockResult<()> {
    let output = Command::new("ip").args(args).output().map_err(|e| {
        MinidockError::BridgeUnavailable {
            message: format!("failed to run ip {}: {e}", args.join(" ")),
        }
    })?;

    if !output.status.success() {
        return Err(MinidockError::BridgeUnavailable {
            message: format!(
                "ip {} failed: {}",
                args.join(" "),
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
    fn nonexistent_bridge() {
        assert!(!BridgeManager::exists("minidock-none0"));
    }
}
