//! Resource limit parsing and representation.
//!
//! The runtime enforces three limits per container: a memory ceiling in
//! bytes, a CPU share as a percentage of one core, and a task count.

use serde::{Deserialize, Serialize};

use crate::error::{MinidockError, MinidockResult};

/// Resource limits for a container. Unset fields mean "no limit".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Hard memory ceiling in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    /// CPU share, 1-100 percent of one core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<u32>,
    /// Maximum number of tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids_max: Option<u32>,
}

impl Limits {
    /// True when no limit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory_bytes.is_none() && self.cpu_percent.is_none() && self.pids_max.is_none()
    }
}

/// Parse a memory limit string to bytes.
///
/// Binary suffixes (powers of 1024): `Ki`, `Mi`, `Gi`, `Ti`.
/// Decimal suffixes (powers of 1000): `K`/`k`, `M`/`m`, `G`/`g`, `T`/`t`.
/// A bare `B` suffix or no suffix means bytes.
pub fn parse_memory(s: &str) -> MinidockResult<u64> {
    let s = s.trim();
    let invalid = || MinidockError::ConfigInvalid {
        message: format!("invalid memory limit: {s}"),
    };

    let binary: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
    ];
    for (suffix, multiplier) in binary {
        if let Some(stripped) = s.strip_suffix(suffix) {
            let value: u64 = stripped.trim().parse().map_err(|_| invalid())?;
            return Ok(value * multiplier);
        }
    }

    let decimal: &[(&str, u64)] = &[
        ("K", 1_000),
        ("k", 1_000),
        ("M", 1_000_000),
        ("m", 1_000_000),
        ("G", 1_000_000_000),
        ("g", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("t", 1_000_000_000_000),
    ];
    for (suffix, multiplier) in decimal {
        if let Some(stripped) = s.strip_suffix(suffix) {
            let value: u64 = stripped.trim().parse().map_err(|_| invalid())?;
            return Ok(value * multiplier);
        }
    }

    let stripped = s.strip_suffix('B').unwrap_or(s);
    stripped.trim().parse().map_err(|_| invalid())
}

/// Parse a CPU percentage (1-100).
pub fn parse_cpu_percent(value: u32) -> MinidockResult<u32> {
    if (1..=100).contains(&value) {
        Ok(value)
    } else {
        Err(MinidockError::ConfigInvalid {
            message: format!("cpu percentage out of range (1-100): {value}"),
        })
    }
}

/// Render a byte count with the largest exact binary suffix.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const GI: u64 = 1 << 30;
    const MI: u64 = 1 << 20;
    const KI: u64 = 1 << 10;

    if bytes >= GI && bytes % GI == 0 {
        format!("{}Gi", bytes / GI)
    } else if bytes >= MI && bytes % MI == 0 {
        format!("{}Mi", bytes / MI)
    } else if bytes >= KI && bytes % KI == 0 {
        format!("{}Ki", bytes / KI)
    } else {
        bytes.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_memory_binary() {
        assert_eq!(parse_memory("1Ki").unwrap(), 1024);
        assert_eq!(parse_memory("20Mi").unwrap(), 20 * 1024 * 1024);
        assert_eq!(parse_memory("1Gi").unwrap(), 1 << 30);
    }

    #[test]
    fn parse_memory_decimal() {
        assert_eq!(parse_memory("100M").unwrap(), 100_000_000);
        assert_eq!(parse_memory("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_memory("2k").unwrap(), 2_000);
    }

    #[test]
    fn parse_memory_bytes() {
        assert_eq!(parse_memory("1048576").unwrap(), 1_048_576);
        assert_eq!(parse_memory("512B").unwrap(), 512);
    }

    #[test]
    fn parse_memory_invalid() {
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("").is_err());
        assert!(parse_memory("12Q").is_err());
    }

    #[test]
    fn cpu_percent_bounds() {
        assert_eq!(parse_cpu_percent(50).unwrap(), 50);
        assert_eq!(parse_cpu_percent(100).unwrap(), 100);
        assert!(parse_cpu_percent(0).is_err());
        assert!(parse_cpu_percent(101).is_err());
    }

    #[test]
    fn bytes_display() {
        assert_eq!(format_bytes(1 << 30), "1Gi");
        assert_eq!(format_bytes(20 * 1024 * 1024), "20Mi");
        assert_eq!(format_bytes(1500), "1500");
    }

    #[test]
    fn limits_empty() {
        assert!(Limits::default().is_empty());
        assert!(!Limits {
            memory_bytes: Some(1),
            ..Default::default()
        }
        .is_empty());
    }
}
