//! Pod resolution over the cluster REST API.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::error::ClusterError;

/// Annotation naming the container `kubectl` tools should attach to by
/// default.
pub const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Container {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: String,
}

impl Pod {
    /// A pod whose containers have all terminated cannot host an exec
    /// session.
    pub fn ensure_running(&self) -> Result<(), ClusterError> {
        match self.status.phase.as_str() {
            "Succeeded" | "Failed" => Err(ClusterError::PodCompleted {
                phase: self.status.phase.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Picks the exec container: an explicit name, else the
    /// `kubectl.kubernetes.io/default-container` annotation, else the first
    /// container.
    pub fn select_container(&self, explicit: Option<&str>) -> Result<String, ClusterError> {
        if let Some(name) = explicit {
            if self.spec.containers.iter().any(|c| c.name == name) {
                return Ok(name.to_string());
            }
            return Err(ClusterError::UnknownContainer {
                container: name.to_string(),
                pod: self.metadata.name.clone(),
            });
        }

        if let Some(name) = self.metadata.annotations.get(DEFAULT_CONTAINER_ANNOTATION) {
            if self.spec.containers.iter().any(|c| c.name == *name) {
                return Ok(name.clone());
            }
            debug!(
                target: "podmount::pods",
                annotation = %name,
                "default-container annotation names a missing container; falling back"
            );
        }

        self.spec
            .containers
            .first()
            .map(|c| c.name.clone())
            .ok_or_else(|| ClusterError::NoContainers {
                pod: self.metadata.name.clone(),
            })
    }
}

/// Thin REST client for the one GET the mount needs.
#[derive(Debug, Clone)]
pub struct PodClient {
    http: reqwest::Client,
    config: ClusterConfig,
}

impl PodClient {
    pub fn new(config: &ClusterConfig) -> Result<PodClient, ClusterError> {
        let mut builder = reqwest::Client::builder().user_agent("kubectl-mount/0.1");
        if let Some(pem) = &config.ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }
        if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(PodClient {
            http: builder.build()?,
            config: config.clone(),
        })
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        let url = self
            .config
            .server
            .join(&format!("api/v1/namespaces/{namespace}/pods/{name}"))
            .map_err(|source| ClusterError::BadServer {
                url: self.config.server.to_string(),
                source,
            })?;
        debug!(target: "podmount::pods", %url, "fetching pod");

        let mut request = self.http.get(url);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        // The API server reports failures as a JSON Status object.
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
        Err(ClusterError::Api {
            status: status.as_u16(),
            message,
        })
    }
}
