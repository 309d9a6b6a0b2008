//! MLflow registry reader
//!
//! Talks to the MLflow REST surface (`registered-models/search`) and maps
//! each latest version in an eligible stage into a [`DesiredDeployment`].
//! The artifact `source` reported by MLflow is a tracking-server-local path;
//! it is re-rooted into the shared artifact store so the deployment's init
//! container can fetch it.

use serde::Deserialize;

use async_trait::async_trait;

use crate::config::Config;
use crate::registry::{ensure_unique, DeploymentId, DesiredDeployment, SnapshotReader};
use crate::{Error, Result, IMAGE_TAG_KEY};

/// Search endpoint, relative to the registry base URL
const SEARCH_PATH: &str = "api/2.0/mlflow/registered-models/search";

/// Wire shape of the search response
#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    registered_models: Vec<RegisteredModel>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisteredModel {
    name: String,
    #[serde(default)]
    latest_versions: Vec<ModelVersion>,
}

#[derive(Debug, Deserialize)]
struct ModelVersion {
    version: String,
    current_stage: String,
    source: String,
    run_id: String,
    #[serde(default)]
    tags: Vec<ModelVersionTag>,
}

#[derive(Debug, Deserialize)]
struct ModelVersionTag {
    key: String,
    #[serde(default)]
    value: String,
}

/// Snapshot reader backed by an MLflow-compatible registry
pub struct MlflowRegistry {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    eligible_stages: Vec<String>,
    artifact_root: String,
    image_base: String,
    namespace: String,
}

impl MlflowRegistry {
    /// Build a reader from the process configuration
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::config(format!("cannot build registry HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: format!("{}/{SEARCH_PATH}", config.registry_url.trim_end_matches('/')),
            token: config.registry_token.clone(),
            eligible_stages: config.stages.clone(),
            artifact_root: config.artifact_root.trim_end_matches('/').to_string(),
            image_base: config.image_base.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
        })
    }

    async fn fetch_page(&self, page_token: Option<&str>) -> Result<SearchResponse> {
        let mut request = self.http.get(&self.endpoint);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(page) = page_token {
            request = request.query(&[("page_token", page)]);
        }

        let response = request.send().await.map_err(Error::registry_unreachable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::registry_unreachable(format!(
                "registry answered HTTP {status}"
            )));
        }

        response
            .json::<SearchResponse>()
            .await
            .map_err(|e| Error::registry_malformed(format!("invalid search response: {e}")))
    }

    fn stage_eligible(&self, stage: &str) -> bool {
        self.eligible_stages
            .iter()
            .any(|s| s.eq_ignore_ascii_case(stage))
    }

    /// Image serving this version: a per-version registry tag wins, otherwise
    /// the process-wide image base plus the sanitized model name.
    fn serving_image(&self, id: &DeploymentId, version: &ModelVersion) -> String {
        version
            .tags
            .iter()
            .find(|t| t.key == IMAGE_TAG_KEY && !t.value.is_empty())
            .map(|t| t.value.clone())
            .unwrap_or_else(|| format!("{}/{}:latest", self.image_base, id.as_str()))
    }

    fn to_desired(&self, model: &str, version: &ModelVersion) -> Result<DesiredDeployment> {
        let id = DeploymentId::derive(model, &version.current_stage)?;
        let source_location =
            reroot_source(&version.source, &version.run_id, &self.artifact_root)?;
        let serving_image = self.serving_image(&id, version);

        Ok(DesiredDeployment {
            id,
            model: model.to_string(),
            stage: version.current_stage.clone(),
            version: version.version.clone(),
            source_run: version.run_id.clone(),
            source_location,
            serving_image,
            namespace: self.namespace.clone(),
        })
    }
}

#[async_trait]
impl SnapshotReader for MlflowRegistry {
    async fn read(&self) -> Result<Vec<DesiredDeployment>> {
        let mut deployments = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self.fetch_page(page_token.as_deref()).await?;
            for model in &page.registered_models {
                for version in &model.latest_versions {
                    if !self.stage_eligible(&version.current_stage) {
                        continue;
                    }
                    deployments.push(self.to_desired(&model.name, version)?);
                }
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        ensure_unique(&deployments)?;
        Ok(deployments)
    }
}

/// Re-root a tracking-server-local source path into the artifact store
///
/// MLflow reports sources like
/// `/usr/local/share/mlruns/0/<run_id>/artifacts/model`; everything from the
/// experiment segment (the one just before the run id) onward is the
/// registry-relative path, which is appended to the store root.
fn reroot_source(source: &str, run_id: &str, artifact_root: &str) -> Result<String> {
    let parts: Vec<&str> = source.split('/').filter(|p| !p.is_empty()).collect();
    let run_idx = parts.iter().position(|p| *p == run_id).ok_or_else(|| {
        Error::registry_malformed(format!(
            "source path {source:?} does not contain run id {run_id:?}"
        ))
    })?;

    if run_idx == 0 {
        return Err(Error::registry_malformed(format!(
            "source path {source:?} has no experiment segment before run id {run_id:?}"
        )));
    }

    Ok(format!(
        "{artifact_root}/{}",
        parts[run_idx - 1..].join("/")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn registry() -> MlflowRegistry {
        let config = Config::try_parse_from([
            "modelsync",
            "--registry-url",
            "https://mlflow.example.com/",
            "--artifact-root",
            "storage://cluster/project/mlruns/",
            "--image-base",
            "registry.example.com/serving",
        ])
        .unwrap();
        MlflowRegistry::new(&config).unwrap()
    }

    fn version(stage: &str) -> ModelVersion {
        ModelVersion {
            version: "3".to_string(),
            current_stage: stage.to_string(),
            source: "/usr/local/share/mlruns/0/ae72265a/artifacts/model".to_string(),
            run_id: "ae72265a".to_string(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn reroot_keeps_experiment_run_and_artifact_segments() {
        let uri = reroot_source(
            "/usr/local/share/mlruns/0/ae72265a/artifacts/model",
            "ae72265a",
            "storage://cluster/project/mlruns",
        )
        .unwrap();
        assert_eq!(uri, "storage://cluster/project/mlruns/0/ae72265a/artifacts/model");
    }

    #[test]
    fn reroot_rejects_sources_without_the_run_id() {
        let err = reroot_source("/mlruns/0/other/artifacts/model", "ae72265a", "s3://store")
            .unwrap_err();
        assert!(matches!(err, Error::RegistryMalformed(_)));
    }

    #[test]
    fn reroot_rejects_sources_starting_at_the_run_id() {
        let err = reroot_source("/ae72265a/artifacts/model", "ae72265a", "s3://store").unwrap_err();
        assert!(err.to_string().contains("experiment segment"));
    }

    #[test]
    fn stage_filter_is_case_insensitive() {
        let reg = registry();
        assert!(reg.stage_eligible("Production"));
        assert!(reg.stage_eligible("staging"));
        assert!(!reg.stage_eligible("None"));
        assert!(!reg.stage_eligible("Archived"));
    }

    #[test]
    fn mapping_builds_the_full_desired_deployment() {
        let reg = registry();
        let desired = reg.to_desired("ChurnPredictor", &version("Production")).unwrap();

        assert_eq!(desired.id.as_str(), "churnpredictor-production");
        assert_eq!(desired.version, "3");
        assert_eq!(desired.source_run, "ae72265a");
        assert_eq!(
            desired.source_location,
            "storage://cluster/project/mlruns/0/ae72265a/artifacts/model"
        );
        assert_eq!(
            desired.serving_image,
            "registry.example.com/serving/churnpredictor-production:latest"
        );
        assert_eq!(desired.namespace, "serving");
    }

    #[test]
    fn image_tag_overrides_the_default_reference() {
        let reg = registry();
        let mut v = version("Staging");
        v.tags.push(ModelVersionTag {
            key: IMAGE_TAG_KEY.to_string(),
            value: "registry.example.com/custom/churn:v7".to_string(),
        });

        let desired = reg.to_desired("churn", &v).unwrap();
        assert_eq!(desired.serving_image, "registry.example.com/custom/churn:v7");
    }

    #[test]
    fn empty_image_tag_falls_back_to_the_default() {
        let reg = registry();
        let mut v = version("Staging");
        v.tags.push(ModelVersionTag {
            key: IMAGE_TAG_KEY.to_string(),
            value: String::new(),
        });

        let desired = reg.to_desired("churn", &v).unwrap();
        assert_eq!(
            desired.serving_image,
            "registry.example.com/serving/churn-staging:latest"
        );
    }
}
