//! OCI bundle loading.
//!
//! A bundle is a directory holding `config.json` and (conventionally) a
//! `rootfs/` directory.

use std::path::{Path, PathBuf};

use minidock_common::{MinidockError, MinidockResult};

use crate::runtime::Spec;

/// A loaded OCI bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Absolute bundle directory.
    pub path: PathBuf,
    /// Parsed configuration subset.
    pub spec: Spec,
}

impl Bundle {
    /// Absolute path of the bundle's root filesystem.
    ///
    /// `root.path` is resolved against the bundle directory when relative;
    /// absent `root` defaults to `<bundle>/rootfs`.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        match &self.spec.root {
            Some(root) if root.path.is_absolute() => root.path.clone(),
            Some(root) => self.path.join(&root.path),
            None => self.path.join("rootfs"),
        }
    }
}

/// Load and parse a bundle directory.
pub fn load_bundle(path: &Path) -> MinidockResult<Bundle> {
    let path = std::fs::canonicalize(path).map_err(|_| MinidockError::ConfigInvalid {
        message: format!("bundle directory not found: {}", path.display()),
    })?;

    let config_path = path.join("config.json");
    if !config_path.exists() {
        return Err(MinidockError::ConfigInvalid {
            message: format!("config.json not found in bundle: {}", path.display()),
        });
    }

    let json = std::fs::read_to_string(&config_path)?;
    let spec: Spec = serde_json::from_str(&json).map_err(|e| MinidockError::ConfigInvalid {
        message: format!("invalid config.json: {e}"),
    })?;

    if spec
        .process
        .as_ref()
        .map(|p| p.args.is_empty())
        .unwrap_or(true)
    {
        return Err(MinidockError::ConfigInvalid {
            message: "bundle config has no process.args".to_string(),
        });
    }

    Ok(Bundle { path, spec })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bundle(dir: &Path, config: &str) {
        std::fs::create_dir_all(dir.join("rootfs")).unwrap();
        std::fs::write(dir.join("config.json"), config).unwrap();
    }

    #[test]
    fn loads_bundle() {
        let temp = tempfile::tempdir().unwrap();
        write_bundle(
            temp.path(),
            r#"{"process": {"args": ["/bin/sh"], "cwd": "/"}, "root": {"path": "rootfs"}}"#,
        );

        let bundle = load_bundle(temp.path()).unwrap();
        assert_eq!(bundle.rootfs(), bundle.path.join("rootfs"));
    }

    #[test]
    fn missing_config_is_config_error() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("rootfs")).unwrap();
        let err = load_bundle(temp.path()).unwrap_err();
        assert!(matches!(err, MinidockError::ConfigInvalid { .. }));
    }

    #[test]
    fn empty_args_rejected() {
        let temp = tempfile::tempdir().unwrap();
        write_bundle(temp.path(), r#"{"root": {"path": "rootfs"}}"#);
        assert!(load_bundle(temp.path()).is_err());
    }
}
