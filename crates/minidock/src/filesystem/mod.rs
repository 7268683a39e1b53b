//! Container filesystem construction.
//!
//! - Mount primitives over rustix
//! - OverlayFS layout and mounting, with a bind-mount fallback
//! - Special filesystems (/proc, /sys, /dev) and device nodes
//! - User bind volumes
//! - pivot_root and old-root cleanup

mod dev;
mod mounts;
mod overlay;
mod pivot;
mod rootfs;
mod volume;

pub use dev::{mount_special, seed_etc};
pub use mounts::{bind_mount, make_rprivate, mount, remount_readonly, unmount_detach, MountOptions};
pub use overlay::OverlayFs;
pub use pivot::enter_root;
pub use rootfs::{setup_rootfs, PreparedRootfs};
pub use volume::{apply_volumes, parse_volume_spec};
