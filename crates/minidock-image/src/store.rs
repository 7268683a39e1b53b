//! Image registry: `images/<name_tag>.json` records.
//!
//! An image is a tag pointing at a rootfs directory plus optional defaults
//! consumed by `run <name:tag>`. Images are immutable once registered.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use minidock_common::{MinidockError, MinidockResult};
use serde::{Deserialize, Serialize};

/// One build-instruction layer, metadata only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Layer id (12-hex).
    pub id: String,
    /// Instruction keyword ("FROM", "RUN", ...).
    pub instruction: String,
    /// Instruction arguments as written.
    pub command: String,
    /// When the layer was built.
    pub created_at: DateTime<Utc>,
}

/// A registered image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Image id (12-hex).
    pub id: String,
    /// Image name.
    pub name: String,
    /// Image tag.
    pub tag: String,
    /// Absolute path of the image rootfs.
    pub rootfs: PathBuf,
    /// Default command when `run` gives none.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_cmd: Vec<String>,
    /// Entrypoint prefixed to the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    /// Default environment, `KEY=VALUE` strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_env: Vec<String>,
    /// Default working directory.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Build layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<LayerRecord>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// `name:tag` reference.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// Split an image reference into name and tag (`latest` when omitted).
#[must_use]
pub fn split_reference(reference: &str) -> (&str, &str) {
    match reference.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (reference, "latest"),
    }
}

/// The on-disk image registry.
pub struct ImageStore {
    images_dir: PathBuf,
}

impl ImageStore {
    /// Open a store rooted at the given `images/` directory.
    pub fn new(images_dir: impl Into<PathBuf>) -> MinidockResult<Self> {
        let images_dir = images_dir.into();
        std::fs::create_dir_all(&images_dir)?;
        Ok(Self { images_dir })
    }

    fn record_path(&self, name: &str, tag: &str) -> PathBuf {
        self.images_dir.join(format!("{name}_{tag}.json"))
    }

    /// Register an image. Fails if the tag is already taken.
    pub fn register(&self, record: &ImageRecord) -> MinidockResult<()> {
        let path = self.record_path(&record.name, &record.tag);
        if path.exists() {
            return Err(MinidockError::StateConflict {
                message: format!("image {} already exists", record.reference()),
            });
        }
        let json = serde_json::to_string_pretty(&serde_json::to_value(record)?)?;
        std::fs::write(&path, json)?;
        tracing::info!(image = %record.reference(), rootfs = %record.rootfs.display(), "Image registered");
        Ok(())
    }

    /// Resolve a `name[:tag]` reference.
    pub fn resolve(&self, reference: &str) -> MinidockResult<ImageRecord> {
        let (name, tag) = split_reference(reference);
        let path = self.record_path(name, tag);
        if !path.exists() {
            return Err(MinidockError::NotFound {
                kind: "image",
                id: reference.to_string(),
            });
        }
        let json = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// List all registered images.
    pub fn list(&self) -> MinidockResult<Vec<ImageRecord>> {
        let mut images = Vec::new();
        if !self.images_dir.exists() {
            return Ok(images);
        }
        for entry in std::fs::read_dir(&self.images_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = std::fs::read_to_string(&path)?;
            if let Ok(record) = serde_json::from_str::<ImageRecord>(&json) {
                images.push(record);
            }
        }
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(images)
    }

    /// Remove an image record. Built rootfs trees inside the store are
    /// deleted with it; externally registered rootfs paths are left alone.
    pub fn remove(&self, reference: &str) -> MinidockResult<()> {
        let record = self.resolve(reference)?;
        std::fs::remove_file(self.record_path(&record.name, &record.tag))?;
        if record.rootfs.starts_with(&self.images_dir) && record.rootfs.exists() {
            std::fs::remove_dir_all(&record.rootfs)?;
        }
        tracing::info!(image = %record.reference(), "Image removed");
        Ok(())
    }

    /// Directory a built image's tree lives under.
    #[must_use]
    pub fn image_dir(&self, image_id: &str) -> PathBuf {
        self.images_dir.join(image_id)
    }

    /// The store's base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.images_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, tag: &str, rootfs: PathBuf) -> ImageRecord {
        ImageRecord {
            id: "a1b2c3d4e5f6".to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
            rootfs,
            default_cmd: vec!["/bin/sh".to_string()],
            entrypoint: Vec::new(),
            default_env: Vec::new(),
            workdir: None,
            layers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn register_and_resolve() {
        let temp = tempfile::tempdir().unwrap();
        let store = ImageStore::new(temp.path()).unwrap();
        store
            .register(&record("alpine", "latest", "/images/alpine".into()))
            .unwrap();

        let found = store.resolve("alpine").unwrap();
        assert_eq!(found.tag, "latest");
        let found = store.resolve("alpine:latest").unwrap();
        assert_eq!(found.rootfs, PathBuf::from("/images/alpine"));
    }

    #[test]
    fn duplicate_tag_conflicts() {
        let temp = tempfile::tempdir().unwrap();
        let store = ImageStore::new(temp.path()).unwrap();
        store
            .register(&record("alpine", "latest", "/a".into()))
            .unwrap();
        let err = store
            .register(&record("alpine", "latest", "/b".into()))
            .unwrap_err();
        assert!(matches!(err, MinidockError::StateConflict { .. }));
    }

    #[test]
    fn missing_image_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let store = ImageStore::new(temp.path()).unwrap();
        assert!(matches!(
            store.resolve("nothing:here").unwrap_err(),
            MinidockError::NotFound { kind: "image", .. }
        ));
    }

    #[test]
    fn reference_splitting() {
        assert_eq!(split_reference("alpine"), ("alpine", "latest"));
        assert_eq!(split_reference("alpine:3.19"), ("alpine", "3.19"));
        assert_eq!(split_reference("repo/app"), ("repo/app", "latest"));
    }

    #[test]
    fn list_and_remove() {
        let temp = tempfile::tempdir().unwrap();
        let store = ImageStore::new(temp.path()).unwrap();
        assert!(store.list().unwrap().is_empty());

        store.register(&record("a", "1", "/x".into())).unwrap();
        store.register(&record("b", "2", "/y".into())).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);

        store.remove("a:1").unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
