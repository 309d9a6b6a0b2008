//! Desired-state model and the registry reader seam
//!
//! The registry is the single source of truth: every tick the reader returns
//! the full set of model versions currently promoted to a serving stage,
//! mapped into canonical [`DesiredDeployment`] records. The reader never
//! filters by previous state, which keeps each tick stateless with respect
//! to the registry.

mod mlflow;

pub use mlflow::MlflowRegistry;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Maximum length of a deployment identity (an RFC 1123 DNS label)
const MAX_ID_LEN: usize = 63;

/// Stable identity of one served model deployment
///
/// Derived deterministically from the registry model name and its serving
/// stage, and used as the resource name in the deployment backend. Two
/// desired deployments with the same identity are the same deployment at
/// possibly different revisions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Derive the identity for a model at a serving stage
    ///
    /// Both components are lowercased and every run of characters outside
    /// `[a-z0-9]` collapses to a single `-`, then the two are joined as
    /// `<model>-<stage>`. Fails when either component sanitizes to nothing
    /// or the result exceeds the DNS label length limit.
    pub fn derive(model: &str, stage: &str) -> Result<Self> {
        let model_part = sanitize(model);
        let stage_part = sanitize(stage);

        if model_part.is_empty() || stage_part.is_empty() {
            return Err(Error::registry_malformed(format!(
                "cannot derive a deployment name from model {model:?} in stage {stage:?}"
            )));
        }

        let id = format!("{model_part}-{stage_part}");
        if id.len() > MAX_ID_LEN {
            return Err(Error::registry_malformed(format!(
                "deployment name {id:?} exceeds {MAX_ID_LEN} characters"
            )));
        }

        Ok(Self(id))
    }

    /// View the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase `raw` and collapse every run of non-alphanumerics to one `-`
///
/// Leading and trailing separators are dropped, so the result is either
/// empty or a valid DNS label fragment.
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Canonical description of one servable model version
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DesiredDeployment {
    /// Stable identity, the resource name in the deployment backend
    pub id: DeploymentId,
    /// Registry model name, before sanitization
    pub model: String,
    /// Registry stage label this version is promoted to
    pub stage: String,
    /// Registry version identifier, opaque and compared for equality only
    pub version: String,
    /// Registry run that produced the model artifact
    pub source_run: String,
    /// Artifact address, re-rooted into the shared artifact store
    pub source_location: String,
    /// Container image that serves this model
    pub serving_image: String,
    /// Namespace the deployment lives in
    pub namespace: String,
}

/// Reads the full desired deployment set from the model registry
///
/// Implementations fail with [`Error::RegistryUnreachable`] when the registry
/// cannot be queried and [`Error::RegistryMalformed`] when its answer cannot
/// be mapped into deployments. Models in no eligible stage are silently
/// omitted, never an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotReader: Send + Sync {
    /// Return every model version currently eligible for serving
    async fn read(&self) -> Result<Vec<DesiredDeployment>>;
}

/// Reject snapshots in which two registry entries collapse to one identity
///
/// Identity derivation is lossy (`my-model` and `my_model` sanitize the same
/// way), so a collision is a registry configuration error. It is surfaced
/// eagerly, naming both entries, rather than letting one silently overwrite
/// the other.
pub(crate) fn ensure_unique(deployments: &[DesiredDeployment]) -> Result<()> {
    let mut seen: BTreeMap<&DeploymentId, &DesiredDeployment> = BTreeMap::new();
    for d in deployments {
        if let Some(first) = seen.insert(&d.id, d) {
            return Err(Error::registry_malformed(format!(
                "model {:?} (stage {}) and model {:?} (stage {}) both resolve to deployment name {}",
                first.model, first.stage, d.model, d.stage, d.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(model: &str, stage: &str) -> DesiredDeployment {
        DesiredDeployment {
            id: DeploymentId::derive(model, stage).unwrap(),
            model: model.to_string(),
            stage: stage.to_string(),
            version: "1".to_string(),
            source_run: "run".to_string(),
            source_location: "s3://artifacts/0/run/artifacts/model".to_string(),
            serving_image: "registry.example.com/serving/model:latest".to_string(),
            namespace: "serving".to_string(),
        }
    }

    #[test]
    fn derivation_lowercases_and_joins() {
        let id = DeploymentId::derive("ChurnPredictor", "Production").unwrap();
        assert_eq!(id.as_str(), "churnpredictor-production");
    }

    #[test]
    fn derivation_collapses_separator_runs() {
        let id = DeploymentId::derive("My  Fancy__Model", "Staging").unwrap();
        assert_eq!(id.as_str(), "my-fancy-model-staging");
    }

    #[test]
    fn derivation_trims_leading_and_trailing_separators() {
        let id = DeploymentId::derive("--model--", "Production").unwrap();
        assert_eq!(id.as_str(), "model-production");
    }

    #[test]
    fn derivation_rejects_names_with_no_usable_characters() {
        let err = DeploymentId::derive("!!!", "Production").unwrap_err();
        assert!(matches!(err, Error::RegistryMalformed(_)));
    }

    #[test]
    fn derivation_rejects_overlong_names() {
        let long = "m".repeat(80);
        let err = DeploymentId::derive(&long, "Production").unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn same_name_and_stage_always_derive_the_same_identity() {
        let a = DeploymentId::derive("churn", "Production").unwrap();
        let b = DeploymentId::derive("churn", "Production").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn collision_between_distinct_models_is_rejected() {
        let snapshot = vec![desired("my-model", "Production"), desired("my_model", "Production")];
        let err = ensure_unique(&snapshot).unwrap_err();
        assert!(err.skips_tick());
        assert!(err.to_string().contains("my-model"));
        assert!(err.to_string().contains("my_model"));
    }

    #[test]
    fn distinct_stages_do_not_collide() {
        let snapshot = vec![desired("churn", "Production"), desired("churn", "Staging")];
        assert!(ensure_unique(&snapshot).is_ok());
    }
}
