//! User-requested bind volumes.

use std::path::{Path, PathBuf};

use minidock_common::{MinidockError, MinidockResult};

use crate::state::BindMount;

/// Parse a `host:container[:ro]` volume flag.
pub fn parse_volume_spec(spec: &str) -> MinidockResult<BindMount> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (host, container, read_only) = match parts.as_slice() {
        [host, container] => (host, container, false),
        [host, container, "ro"] => (host, container, true),
        [host, container, "rw"] => (host, container, false),
        _ => {
            return Err(MinidockError::ConfigInvalid {
                message: format!("invalid volume spec (host:container[:ro]): {spec}"),
            })
        }
    };
    if host.is_empty() || container.is_empty() {
        return Err(MinidockError::ConfigInvalid {
            message: format!("invalid volume spec (empty path): {spec}"),
        });
    }
    Ok(BindMount {
        host_path: PathBuf::from(host),
        container_path: PathBuf::from(container),
        read_only,
    })
}

/// Bind the requested volumes under the prepared root, before pivot.
///
/// A host path that does not exist is fatal. Relative container paths are
/// resolved against the root.
pub fn apply_volumes(mounts: &[BindMount], root: &Path) -> MinidockResult<()> {
    for mount in mounts {
        if !mount.host_path.exists() {
            return Err(MinidockError::BindMissing {
                path: mount.host_path.clone(),
            });
        }

        let relative = mount
            .container_path
            .strip_prefix("/")
            .unwrap_or(&mount.container_path);
        let target = root.join(relative);

        if mount.host_path.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !target.exists() {
                std::fs::write(&target, b"")?;
            }
        }

        super::bind_mount(&mount.host_path, &target, mount.read_only)?;
        tracing::debug!(
            host = %mount.host_path.display(),
            target = %target.display(),
            read_only = mount.read_only,
            "Volume bound"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_volume_specs() {
        let mount = parse_volume_spec("/data:/srv/data").unwrap();
        assert_eq!(mount.host_path, PathBuf::from("/data"));
        assert_eq!(mount.container_path, PathBuf::from("/srv/data"));
        assert!(!mount.read_only);

        let ro = parse_volume_spec("/etc/ssl:/etc/ssl:ro").unwrap();
        assert!(ro.read_only);

        let rw = parse_volume_spec("/a:/b:rw").unwrap();
        assert!(!rw.read_only);
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(parse_volume_spec("/only-host").is_err());
        assert!(parse_volume_spec("/a:/b:rx").is_err());
        assert!(parse_volume_spec(":/b").is_err());
    }

    #[test]
    fn missing_host_path_is_bind_missing() {
        let temp = tempfile::tempdir().unwrap();
        let mounts = [BindMount {
            host_path: PathBuf::from("/definitely/not/here"),
            container_path: PathBuf::from("/data"),
            read_only: false,
        }];
        let err = apply_volumes(&mounts, temp.path()).unwrap_err();
        assert!(matches!(err, MinidockError::BindMissing { .. }));
    }
}
