//! SeldonDeployment manifest construction
//!
//! One desired deployment maps to a single-document SeldonDeployment with one
//! predictor at one replica. The pod spec pairs an init container, which
//! fetches the model artifact into an emptyDir volume, with the serving
//! container mounting the same volume.

use serde_json::{json, Value};

use crate::registry::DesiredDeployment;

/// API group/version of the generated resource
pub const API_VERSION: &str = "machinelearning.seldon.io/v1";

/// Kind of the generated resource
pub const KIND: &str = "SeldonDeployment";

/// Plural resource name, used to address the backend API
pub const PLURAL: &str = "seldondeployments";

/// Name of the shared artifact volume inside the pod
const ARTIFACT_VOLUME: &str = "artifact-store";

/// Mount path of the shared artifact volume
const ARTIFACT_MOUNT_PATH: &str = "/storage";

/// Build the manifest materializing one desired deployment
///
/// `fetcher_image` runs as the init container and receives the artifact
/// source and the local target directory as its arguments. When
/// `pull_secret` is set it is attached to the pod as an image pull secret.
pub fn serving_manifest(
    desired: &DesiredDeployment,
    fetcher_image: &str,
    pull_secret: Option<&str>,
) -> Value {
    let mut pod_spec = json!({
        "volumes": [
            {"name": ARTIFACT_VOLUME, "emptyDir": {}},
        ],
        "initContainers": [
            {
                "name": "artifact-fetch",
                "image": fetcher_image,
                "imagePullPolicy": "IfNotPresent",
                "args": [desired.source_location, ARTIFACT_MOUNT_PATH],
                "volumeMounts": [
                    {"name": ARTIFACT_VOLUME, "mountPath": ARTIFACT_MOUNT_PATH},
                ],
            }
        ],
        "containers": [
            {
                "name": "model",
                "image": desired.serving_image,
                "imagePullPolicy": "Always",
                "volumeMounts": [
                    {"name": ARTIFACT_VOLUME, "mountPath": ARTIFACT_MOUNT_PATH},
                ],
            }
        ],
    });

    if let Some(secret) = pull_secret {
        pod_spec["imagePullSecrets"] = json!([{"name": secret}]);
    }

    json!({
        "apiVersion": API_VERSION,
        "kind": KIND,
        "metadata": {
            "name": desired.id,
            "namespace": desired.namespace,
            "labels": {
                "app.kubernetes.io/managed-by": crate::FIELD_MANAGER,
                "modelsync.io/model": desired.id,
            },
            "annotations": {
                "modelsync.io/version": desired.version,
                "modelsync.io/run-id": desired.source_run,
            },
        },
        "spec": {
            "predictors": [
                {
                    "name": "default",
                    "replicas": 1,
                    "graph": {
                        "name": desired.id,
                        "type": "MODEL",
                        "endpoint": {"type": "REST"},
                    },
                    "componentSpecs": [{"spec": pod_spec}],
                }
            ],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeploymentId;

    fn desired() -> DesiredDeployment {
        DesiredDeployment {
            id: DeploymentId::derive("churn", "Production").unwrap(),
            model: "churn".to_string(),
            stage: "Production".to_string(),
            version: "4".to_string(),
            source_run: "ae72265a".to_string(),
            source_location: "s3://models/0/ae72265a/artifacts/model".to_string(),
            serving_image: "registry.example.com/serving/churn-production:latest".to_string(),
            namespace: "serving".to_string(),
        }
    }

    #[test]
    fn manifest_is_addressed_by_identity_and_namespace() {
        let manifest = serving_manifest(&desired(), "fetcher:v1", None);

        assert_eq!(manifest["apiVersion"], API_VERSION);
        assert_eq!(manifest["kind"], KIND);
        assert_eq!(manifest["metadata"]["name"], "churn-production");
        assert_eq!(manifest["metadata"]["namespace"], "serving");
        assert_eq!(manifest["metadata"]["annotations"]["modelsync.io/version"], "4");
    }

    #[test]
    fn manifest_serves_one_replica() {
        let manifest = serving_manifest(&desired(), "fetcher:v1", None);
        let predictor = &manifest["spec"]["predictors"][0];

        assert_eq!(predictor["replicas"], 1);
        assert_eq!(predictor["graph"]["name"], "churn-production");
        assert_eq!(predictor["graph"]["endpoint"]["type"], "REST");
    }

    #[test]
    fn init_container_fetches_into_the_shared_volume() {
        let manifest = serving_manifest(&desired(), "fetcher:v1", None);
        let pod = &manifest["spec"]["predictors"][0]["componentSpecs"][0]["spec"];

        let init = &pod["initContainers"][0];
        assert_eq!(init["image"], "fetcher:v1");
        assert_eq!(init["args"][0], "s3://models/0/ae72265a/artifacts/model");
        assert_eq!(init["args"][1], ARTIFACT_MOUNT_PATH);

        let volume = pod["volumes"][0]["name"].as_str().unwrap();
        assert_eq!(init["volumeMounts"][0]["name"], volume);
        assert_eq!(pod["containers"][0]["volumeMounts"][0]["name"], volume);
    }

    #[test]
    fn serving_container_runs_the_desired_image() {
        let manifest = serving_manifest(&desired(), "fetcher:v1", None);
        let container = &manifest["spec"]["predictors"][0]["componentSpecs"][0]["spec"]["containers"][0];

        assert_eq!(
            container["image"],
            "registry.example.com/serving/churn-production:latest"
        );
        assert_eq!(
            container["volumeMounts"][0]["mountPath"],
            ARTIFACT_MOUNT_PATH
        );
    }

    #[test]
    fn pull_secret_is_optional() {
        let without = serving_manifest(&desired(), "fetcher:v1", None);
        let pod = &without["spec"]["predictors"][0]["componentSpecs"][0]["spec"];
        assert!(pod.get("imagePullSecrets").is_none());

        let with = serving_manifest(&desired(), "fetcher:v1", Some("registry-creds"));
        let pod = &with["spec"]["predictors"][0]["componentSpecs"][0]["spec"];
        assert_eq!(pod["imagePullSecrets"][0]["name"], "registry-creds");
    }
}
