//! # minidock-network
//!
//! Container networking: the `mini-docker0` bridge with NAT, per-container
//! veth pairs, the flock-guarded IP lease map, and network-namespace
//! helpers.

#![warn(missing_docs)]

mod bridge;
mod lease;
mod netns;
mod veth;

pub use bridge::BridgeManager;
pub use lease::LeaseStore;
pub use netns::{loopback_up, ns_path};
pub use veth::VethPair;

/// Name of the host bridge.
pub const BRIDGE_NAME: &str = "mini-docker0";

/// Bridge (gateway) address.
pub const BRIDGE_IP: &str = "10.0.0.1";

/// Container subnet.
pub const BRIDGE_SUBNET: &str = "10.0.0.0/24";

/// Generate a locally-administered MAC address with the 02:42 prefix.
#[must_use]
pub fn generate_mac() -> String {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let tail: [u8; 4] = rng.gen();
    format!(
        "02:42:{:02x}:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2], tail[3]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_has_local_prefix() {
        let mac = generate_mac();
        assert!(mac.starts_with("02:42:"));
        assert_eq!(mac.split(':').count(), 6);
    }
}
