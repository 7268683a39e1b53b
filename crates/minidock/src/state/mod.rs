//! Persistent container state: the on-disk source of truth across
//! invocations.

mod container;
mod store;

pub use container::{
    BindMount, ContainerConfig, ContainerState, ContainerStatus, NetMode, RootfsMode,
};
pub use store::{ContainerLock, StateStore};
