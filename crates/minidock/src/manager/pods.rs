//! Pod verbs: create, add, ls, inspect, rm.

use minidock_common::{MinidockError, MinidockResult};
use serde_json::json;

use super::{Manager, RunRequest};
use crate::pod::{PodConfig, PodManager};
use crate::state::ContainerStatus;

/// What a pod verb produced, for the CLI to render.
#[derive(Debug)]
pub enum PodCommandOutcome {
    /// A created pod.
    Created(PodConfig),
    /// Pod listing.
    Listing(Vec<PodConfig>),
    /// Inspect output.
    Inspected(serde_json::Value),
    /// Nothing to print.
    Done,
}

impl Manager {
    /// `pod create`.
    pub fn pod_create(&self, name: Option<String>) -> MinidockResult<PodCommandOutcome> {
        self.runtime().paths.create_dirs()?;
        if !self.runtime().profile.can_manage_network {
            return Err(MinidockError::StateConflict {
                message: "pod create requires privileged mode".to_string(),
            });
        }
        let config = PodManager::new(self.runtime()).create(name)?;
        Ok(PodCommandOutcome::Created(config))
    }

    /// `pod add`: run a container that joins the pod's namespaces.
    pub fn pod_add(&self, pod: &str, mut request: RunRequest) -> MinidockResult<i32> {
        let pods = PodManager::new(self.runtime());
        let pod_id = pods.resolve(pod)?;
        request.pod = Some(pod_id);
        request.net = None;
        self.run(request)
    }

    /// `pod ls`.
    pub fn pod_list(&self) -> MinidockResult<PodCommandOutcome> {
        Ok(PodCommandOutcome::Listing(
            PodManager::new(self.runtime()).list()?,
        ))
    }

    /// `pod inspect`.
    pub fn pod_inspect(&self, reference: &str) -> MinidockResult<PodCommandOutcome> {
        let pods = PodManager::new(self.runtime());
        let pod_id = pods.resolve(reference)?;
        let config = pods.load(&pod_id)?;

        let mut members = Vec::new();
        for member in &config.members {
            if let Ok(state) = self.store().load_state(member) {
                members.push(json!({
                    "id": member,
                    "name": state.name,
                    "status": state.status.to_string(),
                }));
            }
        }

        Ok(PodCommandOutcome::Inspected(json!({
            "pod": serde_json::to_value(&config)?,
            "members": members,
        })))
    }

    /// `pod rm`: refuses while members run, unless forced.
    pub fn pod_remove(&self, reference: &str, force: bool) -> MinidockResult<PodCommandOutcome> {
        let pods = PodManager::new(self.runtime());
        let pod_id = pods.resolve(reference)?;
        let config = pods.load(&pod_id)?;

        let mut running = Vec::new();
        for member in &config.members {
            if let Ok(state) = self.store().load_state(member) {
                if state.status == ContainerStatus::Running {
                    running.push(member.clone());
                }
            }
        }

        if !running.is_empty() {
            if !force {
                return Err(MinidockError::StateConflict {
                    message: format!(
                        "pod {pod_id} has {} running container(s); use --force",
                        running.len()
                    ),
                });
            }
            for member in &running {
                if let Err(e) = self.stop(member, 5, true) {
                    tracing::warn!(container_id = %member, error = %e, "Failed to stop pod member");
                }
            }
        }

        pods.remove(&pod_id)?;
        Ok(PodCommandOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn pod_create_refused_rootless() {
        let temp = tempfile::tempdir().unwrap();
        let manager = Manager::new(Runtime::with_root(temp.path(), true, false));
        assert!(matches!(
            manager.pod_create(None).unwrap_err(),
            MinidockError::StateConflict { .. }
        ));
    }

    #[test]
    fn pod_rm_of_missing_pod_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let manager = Manager::new(Runtime::with_root(temp.path(), true, false));
        manager.runtime().paths.create_dirs().unwrap();
        assert!(matches!(
            manager.pod_remove("ghost", false).unwrap_err(),
            MinidockError::NotFound { kind: "pod", .. }
        ));
    }
}
