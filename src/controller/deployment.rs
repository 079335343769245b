//! Deployment controller: expands each Deployment into the declared
//! number of pods.
//!
//! Pods are claimed by selector labels first and owner references
//! second; the relational backend does not persist owner references, so
//! label matching has to carry the weight. Deleting a Deployment does
//! not cascade onto its pods.

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::resources::{
    Deployment, Gvk, ObjectMeta, OwnerReference, Pod, Resource,
};
use crate::store::{EventType, ResourceEvent, SharedStore};

pub struct DeploymentController {
    store: SharedStore,
}

impl DeploymentController {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("starting deployment controller");

        let mut events = match self.store.watch(&Gvk::deployment(), "", "").await {
            Ok(handle) => handle,
            Err(e) => {
                error!("deployment controller cannot watch: {}", e);
                return;
            }
        };

        self.sync_all().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("deployment watch channel closed");
                        break;
                    };
                    self.handle_event(event).await;
                }
            }
        }

        info!("deployment controller stopped");
    }

    async fn sync_all(&self) {
        let deployments = match self.store.list(&Gvk::deployment(), "").await {
            Ok(items) => items,
            Err(e) => {
                error!("failed to list deployments for full sync: {}", e);
                return;
            }
        };
        debug!("full sync over {} deployments", deployments.len());
        for resource in deployments {
            if let Resource::Deployment(deployment) = resource {
                if let Err(e) = self.reconcile(&deployment).await {
                    error!(
                        "failed to reconcile deployment {}/{}: {}",
                        deployment.metadata.namespace, deployment.metadata.name, e
                    );
                }
            }
        }
    }

    async fn handle_event(&self, event: ResourceEvent) {
        match event.event_type {
            EventType::Added | EventType::Modified => {
                if let Some(Resource::Deployment(deployment)) = event.object {
                    debug!(
                        "deployment event: {}/{} ({:?})",
                        deployment.metadata.namespace, deployment.metadata.name, event.event_type
                    );
                    if let Err(e) = self.reconcile(&deployment).await {
                        error!(
                            "failed to reconcile deployment {}/{}: {}",
                            deployment.metadata.namespace, deployment.metadata.name, e
                        );
                    }
                }
            }
            EventType::Deleted => {
                if let Some(deployment) = event.object.as_ref().and_then(Resource::as_deployment) {
                    // No cascade: claimed pods outlive their deployment.
                    info!(
                        "deployment {}/{} deleted, leaving its pods in place",
                        deployment.metadata.namespace, deployment.metadata.name
                    );
                }
            }
            EventType::Bookmark => {}
        }
    }

    /// Converge the claimed pod count onto `spec.replicas`.
    async fn reconcile(&self, deployment: &Deployment) -> Result<(), crate::store::StoreError> {
        let namespace = deployment.metadata.namespace.as_str();
        let all_pods = self.store.list(&Gvk::pod(), namespace).await?;

        let mut claimed: Vec<Pod> = all_pods
            .into_iter()
            .filter_map(|resource| match resource {
                Resource::Pod(pod) => Some(pod),
                _ => None,
            })
            .filter(|pod| claims(deployment, pod))
            .collect();

        let want = deployment.spec.desired_replicas();
        let have = claimed.len() as i32;
        debug!(
            "deployment {}/{}: want={} have={}",
            namespace, deployment.metadata.name, want, have
        );

        if have < want {
            let missing = want - have;
            info!(
                "deployment {}/{}: creating {} pod(s)",
                namespace, deployment.metadata.name, missing
            );
            for _ in 0..missing {
                let pod = pod_for_deployment(deployment);
                match self.store.create(&Gvk::pod(), Resource::Pod(pod)).await {
                    Ok(created) => info!(
                        "created pod {}/{}",
                        created.namespace(),
                        created.name()
                    ),
                    Err(e) => error!("failed to create pod: {}", e),
                }
            }
        } else if have > want {
            let excess = (have - want) as usize;
            info!(
                "deployment {}/{}: deleting {} pod(s)",
                namespace, deployment.metadata.name, excess
            );
            // Victim choice is deterministic within a call.
            claimed.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
            for pod in claimed.iter().take(excess) {
                match self
                    .store
                    .delete(&Gvk::pod(), &pod.metadata.namespace, &pod.metadata.name)
                    .await
                {
                    Ok(_) => info!("deleted pod {}/{}", pod.metadata.namespace, pod.metadata.name),
                    Err(e) => error!(
                        "failed to delete pod {}/{}: {}",
                        pod.metadata.namespace, pod.metadata.name, e
                    ),
                }
            }
        }

        Ok(())
    }
}

/// Whether a deployment claims a pod: every selector label present, or an
/// owner reference naming this deployment.
fn claims(deployment: &Deployment, pod: &Pod) -> bool {
    let selector = deployment.selector_labels();
    let by_labels = !selector.is_empty()
        && selector
            .iter()
            .all(|(k, v)| pod.metadata.labels.get(k) == Some(v));
    let by_owner = pod
        .metadata
        .owner_references
        .iter()
        .any(|r| r.kind == "Deployment" && r.name == deployment.metadata.name);
    by_labels || by_owner
}

/// Derive a new pod from the deployment's template. The spec is taken
/// verbatim; the status starts at Pending.
fn pod_for_deployment(deployment: &Deployment) -> Pod {
    let suffix = Uuid::new_v4().simple().to_string();
    let name = format!("{}-{}", deployment.metadata.name, &suffix[..8]);

    Pod {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        metadata: ObjectMeta {
            name,
            namespace: deployment.metadata.namespace.clone(),
            labels: deployment.spec.template.metadata.labels.clone(),
            owner_references: vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: deployment.metadata.name.clone(),
                uid: deployment.metadata.uid.clone(),
                controller: Some(true),
            }],
            ..Default::default()
        },
        spec: deployment.spec.template.spec.clone(),
        status: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::PodPhase;

    fn deployment_with_selector(name: &str, key: &str, value: &str) -> Deployment {
        let mut deployment = Deployment::new(name, "default");
        deployment
            .spec
            .selector
            .match_labels
            .insert(key.to_string(), value.to_string());
        deployment
            .spec
            .template
            .metadata
            .labels
            .insert(key.to_string(), value.to_string());
        deployment
    }

    #[test]
    fn test_claims_by_selector() {
        let deployment = deployment_with_selector("web", "app", "web");
        let mut pod = Pod::new("web-1", "default");
        pod.metadata
            .labels
            .insert("app".to_string(), "web".to_string());
        assert!(claims(&deployment, &pod));

        pod.metadata
            .labels
            .insert("app".to_string(), "api".to_string());
        assert!(!claims(&deployment, &pod));
    }

    #[test]
    fn test_claims_by_owner_reference() {
        let deployment = Deployment::new("web", "default");
        let mut pod = Pod::new("web-1", "default");
        assert!(!claims(&deployment, &pod));

        pod.metadata.owner_references.push(OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            uid: String::new(),
            controller: Some(true),
        });
        assert!(claims(&deployment, &pod));
    }

    #[test]
    fn test_pod_for_deployment() {
        let mut deployment = deployment_with_selector("web", "app", "web");
        deployment.metadata.uid = "deploy-uid".to_string();
        deployment
            .spec
            .template
            .spec
            .containers
            .push(crate::resources::Container {
                name: "main".to_string(),
                image: "nginx".to_string(),
                ..Default::default()
            });

        let pod = pod_for_deployment(&deployment);
        assert!(pod.metadata.name.starts_with("web-"));
        assert_ne!(pod.metadata.name, "web-");
        assert_eq!(pod.metadata.namespace, "default");
        assert_eq!(
            pod.metadata.labels.get("app").map(String::as_str),
            Some("web")
        );
        assert_eq!(pod.spec.containers[0].image, "nginx");
        assert_eq!(pod.status.phase, PodPhase::Pending);

        let owner = &pod.metadata.owner_references[0];
        assert_eq!(owner.kind, "Deployment");
        assert_eq!(owner.name, "web");
        assert_eq!(owner.uid, "deploy-uid");
        assert_eq!(owner.controller, Some(true));

        // The new pod is claimed by the deployment that made it.
        assert!(claims(&deployment, &pod));
    }

    #[test]
    fn test_generated_names_are_unique() {
        let deployment = Deployment::new("web", "default");
        let a = pod_for_deployment(&deployment);
        let b = pod_for_deployment(&deployment);
        assert_ne!(a.metadata.name, b.metadata.name);
    }
}
