//! Imagefile execution.
//!
//! The builder materialises an image tree under `images/<id>/rootfs` by
//! replaying instructions: FROM copies the base tree, RUN chroots into the
//! tree and runs `/bin/sh -c`, COPY resolves sources against the build
//! context. Layers are recorded as metadata over the flattened tree.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use minidock_common::id::ContainerId;
use minidock_common::{MinidockError, MinidockResult};

use crate::imagefile::{parse_imagefile, Instruction};
use crate::store::{split_reference, ImageRecord, ImageStore, LayerRecord};

/// Builds images from Imagefiles.
pub struct ImageBuilder<'a> {
    store: &'a ImageStore,
}

impl<'a> ImageBuilder<'a> {
    /// Create a builder over the given store.
    #[must_use]
    pub fn new(store: &'a ImageStore) -> Self {
        Self { store }
    }

    /// Build `build_file` and register the result as `reference`.
    ///
    /// `no_cache` is accepted for CLI compatibility; the builder always
    /// replays the full instruction list.
    pub fn build(
        &self,
        build_file: &Path,
        reference: &str,
        _no_cache: bool,
    ) -> MinidockResult<ImageRecord> {
        let content =
            std::fs::read_to_string(build_file).map_err(|_| MinidockError::ConfigInvalid {
                message: format!("build file not found: {}", build_file.display()),
            })?;
        let instructions = parse_imagefile(&content)?;
        if !matches!(instructions.first(), Some(Instruction::From(_))) {
            return Err(MinidockError::ConfigInvalid {
                message: "Imagefile must start with FROM".to_string(),
            });
        }

        let context = build_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let image_id = ContainerId::generate();
        let rootfs = self.store.image_dir(image_id.as_str()).join("rootfs");
        std::fs::create_dir_all(&rootfs)?;

        let (name, tag) = split_reference(reference);
        let mut record = ImageRecord {
            id: image_id.as_str().to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
            rootfs: rootfs.clone(),
            default_cmd: Vec::new(),
            entrypoint: Vec::new(),
            default_env: Vec::new(),
            workdir: None,
            layers: Vec::new(),
            created_at: Utc::now(),
        };

        for instruction in &instructions {
            tracing::info!(image = %reference, step = ?instruction, "Build step");
            self.apply(instruction, &context, &rootfs, &mut record)?;
            record.layers.push(LayerRecord {
                id: ContainerId::generate().as_str().to_string(),
                instruction: keyword(instruction).to_string(),
                command: describe(instruction),
                created_at: Utc::now(),
            });
        }

        self.store.register(&record)?;
        Ok(record)
    }

    fn apply(
        &self,
        instruction: &Instruction,
        context: &Path,
        rootfs: &Path,
        record: &mut ImageRecord,
    ) -> MinidockResult<()> {
        match instruction {
            Instruction::From(base) => {
                let base_path = if Path::new(base).is_absolute() {
                    PathBuf::from(base)
                } else {
                    context.join(base)
                };
                if !base_path.is_dir() {
                    return Err(MinidockError::ConfigInvalid {
                        message: format!("base image not found: {}", base_path.display()),
                    });
                }
                copy_tree(&base_path, rootfs)?;
            }
            Instruction::Env { key, value } => {
                record.default_env.push(format!("{key}={value}"));
            }
            Instruction::Run(cmd) => run_in_root(rootfs, cmd)?,
            Instruction::Copy { src, dst } => {
                let source = context.join(src);
                if !source.exists() {
                    return Err(MinidockError::ConfigInvalid {
                        message: format!("COPY source not found: {}", source.display()),
                    });
                }
                let target = rootfs.join(dst.trim_start_matches('/'));
                if source.is_dir() {
                    copy_tree(&source, &target)?;
                } else {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(&source, &target)?;
                }
            }
            Instruction::Workdir(path) => record.workdir = Some(path.clone()),
            Instruction::Cmd(argv) => record.default_cmd = argv.clone(),
            Instruction::Entrypoint(argv) => record.entrypoint = argv.clone(),
        }
        Ok(())
    }
}

fn keyword(instruction: &Instruction) -> &'static str {
    match instruction {
        Instruction::From(_) => "FROM",
        Instruction::Env { .. } => "ENV",
        Instruction::Run(_) => "RUN",
        Instruction::Copy { .. } => "COPY",
        Instruction::Workdir(_) => "WORKDIR",
        Instruction::Cmd(_) => "CMD",
        Instruction::Entrypoint(_) => "ENTRYPOINT",
    }
}

fn describe(instruction: &Instruction) -> String {
    match instruction {
        Instruction::From(p) => p.clone(),
        Instruction::Env { key, value } => format!("{key}={value}"),
        Instruction::Run(cmd) => cmd.clone(),
        Instruction::Copy { src, dst } => format!("{src} {dst}"),
        Instruction::Workdir(p) => p.clone(),
        Instruction::Cmd(argv) | Instruction::Entrypoint(argv) => argv.join(" "),
    }
}

/// Run a shell command chrooted into the image tree.
fn run_in_root(rootfs: &Path, cmd: &str) -> MinidockResult<()> {
    use std::os::unix::process::CommandExt;

    let rootfs = rootfs.to_path_buf();
    let mut command = Command::new("/bin/sh");
    command.args(["-c", cmd]);
    // SAFETY: chroot + chdir in the pre-exec hook of a freshly forked child.
    unsafe {
        command.pre_exec(move || {
            let root = std::ffi::CString::new(rootfs.as_os_str().as_encoded_bytes())
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
            if libc::chroot(root.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::chdir(c"/".as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let output = command.output()?;
    if !output.status.success() {
        return Err(MinidockError::ConfigInvalid {
            message: format!(
                "RUN failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

/// Recursively copy a directory tree, preserving symlinks.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> MinidockResult<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());

        if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            if target.symlink_metadata().is_err() {
                std::os::unix::fs::symlink(link, &target)?;
            }
        } else if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_preserves_symlinks() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join("bin")).unwrap();
        std::fs::write(src.join("bin/tool"), b"#!/bin/sh\n").unwrap();
        std::os::unix::fs::symlink("bin/tool", src.join("tool")).unwrap();

        let dst = temp.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        assert!(dst.join("bin/tool").is_file());
        assert_eq!(
            std::fs::read_link(dst.join("tool")).unwrap(),
            PathBuf::from("bin/tool")
        );
    }

    #[test]
    fn build_without_from_fails() {
        let temp = tempfile::tempdir().unwrap();
        let store = ImageStore::new(temp.path().join("images")).unwrap();
        let build_file = temp.path().join("Imagefile");
        std::fs::write(&build_file, "RUN echo hi\n").unwrap();

        let err = ImageBuilder::new(&store)
            .build(&build_file, "x:1", false)
            .unwrap_err();
        assert!(matches!(err, MinidockError::ConfigInvalid { .. }));
    }

    #[test]
    fn build_copies_base_and_records_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let store = ImageStore::new(temp.path().join("images")).unwrap();

        let base = temp.path().join("base");
        std::fs::create_dir_all(base.join("etc")).unwrap();
        std::fs::write(base.join("etc/os-release"), "ID=mini\n").unwrap();
        std::fs::write(temp.path().join("greeting"), "hello\n").unwrap();

        let build_file = temp.path().join("Imagefile");
        std::fs::write(
            &build_file,
            "FROM base\nENV APP=demo\nCOPY greeting /greeting\nWORKDIR /srv\nCMD [\"/bin/true\"]\n",
        )
        .unwrap();

        let record = ImageBuilder::new(&store)
            .build(&build_file, "demo:latest", false)
            .unwrap();

        assert!(record.rootfs.join("etc/os-release").is_file());
        assert!(record.rootfs.join("greeting").is_file());
        assert_eq!(record.default_env, vec!["APP=demo"]);
        assert_eq!(record.workdir.as_deref(), Some("/srv"));
        assert_eq!(record.default_cmd, vec!["/bin/true"]);
        assert_eq!(record.layers.len(), 5);

        let resolved = store.resolve("demo").unwrap();
        assert_eq!(resolved.id, record.id);
    }
}
