//! Process configuration
//!
//! All knobs are supplied once at startup, via flags or environment
//! variables, and stay immutable for the process lifetime.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::{Error, Result, DEFAULT_FETCHER_IMAGE, DEFAULT_INTERVAL_SECS, DEFAULT_NAMESPACE};

/// modelsync - keeps served model deployments in sync with a model registry
#[derive(Parser, Debug, Clone)]
#[command(name = "modelsync", version, about, long_about = None)]
pub struct Config {
    /// Base URL of the MLflow-compatible registry
    #[arg(long, env = "MODELSYNC_REGISTRY_URL")]
    pub registry_url: String,

    /// Bearer token for registry requests
    #[arg(long, env = "MODELSYNC_REGISTRY_TOKEN", hide_env_values = true)]
    pub registry_token: Option<String>,

    /// Root of the shared artifact store that model sources are re-rooted into
    #[arg(long, env = "MODELSYNC_ARTIFACT_ROOT")]
    pub artifact_root: String,

    /// Registry stages whose latest versions are served
    #[arg(
        long,
        env = "MODELSYNC_STAGES",
        value_delimiter = ',',
        default_value = "Staging,Production"
    )]
    pub stages: Vec<String>,

    /// Namespace deployments are created in
    #[arg(long, env = "MODELSYNC_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Image repository base used to derive per-model serving images
    #[arg(long, env = "MODELSYNC_IMAGE_BASE")]
    pub image_base: String,

    /// Image for the init container that fetches model artifacts
    #[arg(long, env = "MODELSYNC_FETCHER_IMAGE", default_value = DEFAULT_FETCHER_IMAGE)]
    pub artifact_fetcher_image: String,

    /// Image pull secret added to generated pod specs
    #[arg(long, env = "MODELSYNC_PULL_SECRET")]
    pub image_pull_secret: Option<String>,

    /// Seconds to sleep between reconcile ticks
    #[arg(long, env = "MODELSYNC_INTERVAL_SECS", default_value_t = DEFAULT_INTERVAL_SECS)]
    pub interval_secs: u64,

    /// Listen address for the read-only status surface, disabled when unset
    #[arg(long, env = "MODELSYNC_STATUS_ADDR")]
    pub status_addr: Option<SocketAddr>,
}

impl Config {
    /// Validate cross-field constraints that clap cannot express
    pub fn validate(&self) -> Result<()> {
        if !self.registry_url.starts_with("http://") && !self.registry_url.starts_with("https://") {
            return Err(Error::config(format!(
                "registry URL {:?} must be http(s)",
                self.registry_url
            )));
        }
        if self.artifact_root.trim_end_matches('/').is_empty() {
            return Err(Error::config("artifact root must not be empty"));
        }
        if self.image_base.trim_end_matches('/').is_empty() {
            return Err(Error::config("image base must not be empty"));
        }
        if self.interval_secs == 0 {
            return Err(Error::config("interval must be at least 1 second"));
        }
        if self.stages.iter().all(|s| s.trim().is_empty()) {
            return Err(Error::config("at least one serving stage is required"));
        }
        Ok(())
    }

    /// Delay between reconcile ticks
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec![
            "modelsync",
            "--registry-url",
            "https://mlflow.example.com",
            "--artifact-root",
            "s3://models",
            "--image-base",
            "registry.example.com/serving",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults_cover_the_optional_surface() {
        let config = parse(&[]);
        assert_eq!(config.stages, vec!["Staging", "Production"]);
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.interval_secs, DEFAULT_INTERVAL_SECS);
        assert_eq!(config.artifact_fetcher_image, DEFAULT_FETCHER_IMAGE);
        assert!(config.registry_token.is_none());
        assert!(config.status_addr.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn stage_list_splits_on_commas() {
        let config = parse(&["--stages", "Production"]);
        assert_eq!(config.stages, vec!["Production"]);

        let config = parse(&["--stages", "A,B,C"]);
        assert_eq!(config.stages, vec!["A", "B", "C"]);
    }

    #[test]
    fn status_addr_parses_as_a_socket_address() {
        let config = parse(&["--status-addr", "0.0.0.0:9090"]);
        assert_eq!(config.status_addr.unwrap().port(), 9090);
    }

    #[test]
    fn validation_rejects_non_http_registry_urls() {
        let mut config = parse(&[]);
        config.registry_url = "ftp://mlflow".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validation_rejects_a_zero_interval() {
        let config = parse(&["--interval-secs", "0"]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least 1 second"));
    }

    #[test]
    fn validation_rejects_blank_stage_lists() {
        let mut config = parse(&[]);
        config.stages = vec![" ".to_string()];
        assert!(config.validate().is_err());
    }
}
