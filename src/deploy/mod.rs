//! Deployment backend
//!
//! The backend materializes desired deployments in Kubernetes. Applies go
//! through server-side apply, so create and update are the same idempotent
//! request; deletes treat a missing object as success, since the backend is
//! the source of truth and our in-memory picture may already be stale.

pub mod manifest;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::config::Config;
use crate::registry::{DeploymentId, DesiredDeployment};
use crate::{Error, Result, FIELD_MANAGER};

/// Applies and removes served model deployments
///
/// Both operations are idempotent and fail per-model: an error from one
/// deployment never says anything about the others.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentBackend: Send + Sync {
    /// Create or replace the deployment described by `desired`
    async fn apply(&self, desired: &DesiredDeployment) -> Result<()>;

    /// Delete the named deployment, succeeding if it is already gone
    async fn remove(&self, id: &DeploymentId, namespace: &str) -> Result<()>;
}

/// Kubernetes-backed implementation
pub struct KubeBackend {
    client: Client,
    fetcher_image: String,
    pull_secret: Option<String>,
}

impl KubeBackend {
    /// Create a backend from a Kubernetes client and the process configuration
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            fetcher_image: config.artifact_fetcher_image.clone(),
            pull_secret: config.image_pull_secret.clone(),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource {
            group: "machinelearning.seldon.io".to_string(),
            version: "v1".to_string(),
            api_version: manifest::API_VERSION.to_string(),
            kind: manifest::KIND.to_string(),
            plural: manifest::PLURAL.to_string(),
        };
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

#[async_trait]
impl DeploymentBackend for KubeBackend {
    async fn apply(&self, desired: &DesiredDeployment) -> Result<()> {
        let obj = manifest::serving_manifest(
            desired,
            &self.fetcher_image,
            self.pull_secret.as_deref(),
        );

        self.api(&desired.namespace)
            .patch(
                desired.id.as_str(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await
            .map_err(|e| Error::apply_failed(desired.id.clone(), e))?;

        debug!(deployment = %desired.id, version = %desired.version, "manifest applied");
        Ok(())
    }

    async fn remove(&self, id: &DeploymentId, namespace: &str) -> Result<()> {
        match self
            .api(namespace)
            .delete(id.as_str(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            // Already gone: the desired outcome holds
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(deployment = %id, "deployment already absent");
                Ok(())
            }
            Err(e) => Err(Error::remove_failed(id.clone(), e)),
        }
    }
}
