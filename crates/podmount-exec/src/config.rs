//! Cluster client configuration.
//!
//! A deliberately small slice of the kubeconfig surface: server URL, bearer
//! token, namespace and the TLS knobs the exec channel needs. Flags override
//! the kubeconfig; `--server` skips it entirely.

use std::fs;
use std::path::PathBuf;

use base64::Engine;
use serde::Deserialize;
use url::Url;

use crate::error::ClusterError;

/// Cluster connection flags, flattened into the mount command.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ClusterArgs {
    /// Path to the kubeconfig file
    #[arg(long, value_name = "PATH", env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Name of the kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// Namespace of the pod
    #[arg(short = 'n', long)]
    pub namespace: Option<String>,

    /// Address of the API server, bypassing the kubeconfig
    #[arg(long, value_name = "URL")]
    pub server: Option<String>,

    /// Bearer token for API server authentication
    #[arg(long, env = "KUBE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Skip TLS certificate verification of the API server
    #[arg(long)]
    pub insecure_skip_tls_verify: bool,
}

/// Resolved cluster connection settings, immutable after construction and
/// shared by the REST lookup and every exec session.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub server: Url,
    pub token: Option<String>,
    pub namespace: String,
    pub ca_pem: Option<Vec<u8>>,
    pub accept_invalid_certs: bool,
}

impl ClusterArgs {
    pub fn resolve(&self) -> Result<ClusterConfig, ClusterError> {
        if let Some(server) = &self.server {
            return Ok(ClusterConfig {
                server: parse_server(server)?,
                token: self.token.clone(),
                namespace: self.namespace.clone().unwrap_or_else(|| "default".to_string()),
                ca_pem: None,
                accept_invalid_certs: self.insecure_skip_tls_verify,
            });
        }

        let path = self
            .kubeconfig
            .clone()
            .or_else(default_kubeconfig_path)
            .ok_or(ClusterError::NoServer)?;
        let raw = fs::read_to_string(&path).map_err(|source| ClusterError::KubeconfigRead {
            path: path.clone(),
            source,
        })?;
        let kubeconfig: Kubeconfig =
            serde_yaml::from_str(&raw).map_err(|source| ClusterError::KubeconfigParse {
                path: path.clone(),
                source,
            })?;

        let context_name = self
            .context
            .clone()
            .or(kubeconfig.current_context)
            .ok_or(ClusterError::NoContext)?;
        let context = kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| c.context.clone())
            .ok_or(ClusterError::UnknownContext(context_name))?;

        let cluster = kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| c.cluster.clone())
            .ok_or(ClusterError::UnknownCluster(context.cluster.clone()))?;

        let token = match &self.token {
            Some(token) => Some(token.clone()),
            None => match &context.user {
                Some(user_name) => {
                    let user = kubeconfig
                        .users
                        .iter()
                        .find(|u| u.name == *user_name)
                        .map(|u| u.user.clone())
                        .ok_or(ClusterError::UnknownUser(user_name.clone()))?;
                    user.token
                }
                None => None,
            },
        };

        Ok(ClusterConfig {
            server: parse_server(&cluster.server)?,
            token,
            namespace: self
                .namespace
                .clone()
                .or(context.namespace)
                .unwrap_or_else(|| "default".to_string()),
            ca_pem: cluster
                .certificate_authority_data
                .as_deref()
                .map(decode_ca_data)
                .transpose()?,
            accept_invalid_certs: self.insecure_skip_tls_verify
                || cluster.insecure_skip_tls_verify,
        })
    }
}

/// Parses the server address and guarantees a trailing slash so joined API
/// paths never clobber a path prefix.
fn parse_server(server: &str) -> Result<Url, ClusterError> {
    let mut url = Url::parse(server).map_err(|source| ClusterError::BadServer {
        url: server.to_string(),
        source,
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn decode_ca_data(data: &str) -> Result<Vec<u8>, ClusterError> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|err| ClusterError::BadCertificate(err.to_string()))
}

fn default_kubeconfig_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".kube").join("config"))
}

#[derive(Debug, Default, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context")]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Clone, Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Clone, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: Option<String>,
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UserEntry {
    token: Option<String>,
}
