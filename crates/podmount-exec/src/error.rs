//! Errors raised while resolving cluster configuration and pods.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("reading kubeconfig {path}: {source}")]
    KubeconfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing kubeconfig {path}: {source}")]
    KubeconfigParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("kubeconfig has no current context; pass --context")]
    NoContext,
    #[error("context {0:?} not found in kubeconfig")]
    UnknownContext(String),
    #[error("cluster {0:?} not found in kubeconfig")]
    UnknownCluster(String),
    #[error("user {0:?} not found in kubeconfig")]
    UnknownUser(String),
    #[error("no API server configured; pass --server or provide a kubeconfig")]
    NoServer,
    #[error("invalid API server URL {url:?}: {source}")]
    BadServer {
        url: String,
        source: url::ParseError,
    },
    #[error("invalid certificate authority data: {0}")]
    BadCertificate(String),
    #[error("cluster API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cluster API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("pod {pod} has no containers")]
    NoContainers { pod: String },
    #[error("container {container:?} not found in pod {pod}")]
    UnknownContainer { container: String, pod: String },
    #[error("cannot mount filesystem on the container in a completed pod; current phase is {phase}")]
    PodCompleted { phase: String },
}
