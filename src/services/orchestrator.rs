use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::{Certificate, Client};
use serde::{Deserialize, Serialize};

use crate::config::AutoscalerConfig;

/// Backend that owns the worker deployment's replica count.
#[async_trait]
pub trait ReplicaController: Send + Sync {
    async fn replicas(&self, deployment: &str) -> Result<i32, ScaleError>;

    async fn set_replicas(&self, deployment: &str, replicas: i32) -> Result<(), ScaleError>;
}

/// Drives the `apps/v1` deployment `scale` subresource through the
/// Kubernetes REST API.
///
/// In-cluster it authenticates with the mounted service-account token; the
/// token file is re-read per request because projected tokens rotate. With
/// no token file (e.g. behind `kubectl proxy`) requests go unauthenticated.
pub struct KubernetesScaler {
    http: Client,
    api_url: String,
    namespace: String,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct Scale {
    spec: ScaleSpec,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScaleSpec {
    #[serde(default)]
    replicas: i32,
}

#[derive(Serialize)]
struct ScalePatch {
    spec: ScaleSpec,
}

impl KubernetesScaler {
    pub fn from_config(config: &AutoscalerConfig) -> Result<Self, ScaleError> {
        let mut builder = Client::builder();
        if let Some(ca_path) = &config.kube_ca_path {
            let pem = std::fs::read(ca_path).map_err(|e| ScaleError::Config(format!("{ca_path}: {e}")))?;
            let cert = Certificate::from_pem(&pem)?;
            builder = builder.add_root_certificate(cert);
        }

        let token_path = Path::new(&config.kube_token_path);
        let token_path = token_path.exists().then(|| token_path.to_path_buf());
        if token_path.is_none() {
            tracing::warn!(path = %config.kube_token_path, "No service account token found, using unauthenticated requests");
        }

        Ok(Self {
            http: builder.build()?,
            api_url: config.kube_api_url.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            token_path,
        })
    }

    fn scale_url(&self, deployment: &str) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}/scale",
            self.api_url, self.namespace, deployment
        )
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, ScaleError> {
        match &self.token_path {
            Some(path) => {
                let token = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| ScaleError::Config(format!("{}: {e}", path.display())))?;
                Ok(request.bearer_auth(token.trim()))
            }
            None => Ok(request),
        }
    }
}

#[async_trait]
impl ReplicaController for KubernetesScaler {
    async fn replicas(&self, deployment: &str) -> Result<i32, ScaleError> {
        let request = self.authorize(self.http.get(self.scale_url(deployment))).await?;
        let scale: Scale = request.send().await?.error_for_status()?.json().await?;
        Ok(scale.spec.replicas)
    }

    async fn set_replicas(&self, deployment: &str, replicas: i32) -> Result<(), ScaleError> {
        let patch = ScalePatch {
            spec: ScaleSpec { replicas },
        };
        let request = self
            .authorize(self.http.patch(self.scale_url(deployment)))
            .await?
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .body(serde_json::to_vec(&patch)?);

        request.send().await?.error_for_status()?;
        tracing::info!(deployment, replicas, "Successfully scaled deployment");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScaleError {
    #[error("Kubernetes API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Kubernetes client configuration error: {0}")]
    Config(String),
}
