//! # minidock-oci
//!
//! The minimum subset of the OCI Runtime Specification the launcher
//! consumes: `process`, `root`, `hostname`, `mounts`, and the namespace and
//! resource sections of `linux`. Unknown fields are ignored on load.

#![warn(missing_docs)]

mod bundle;
mod runtime;

pub use bundle::{load_bundle, Bundle};
pub use runtime::{
    Linux, LinuxNamespace, LinuxResources, Mount, NamespaceType, Process, Root, Spec, User,
};
