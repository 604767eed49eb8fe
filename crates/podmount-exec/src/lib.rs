//! Cluster access for podmount: configuration, pod resolution and the
//! WebSocket exec channel behind the [`podmount_core::Executor`] seam.

pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod pods;

pub use channel::{ExecTarget, EXEC_SUBPROTOCOL, INTERRUPT_BYTE};
pub use config::{ClusterArgs, ClusterConfig};
pub use error::ClusterError;
pub use executor::PodExecutor;
pub use pods::{Pod, PodClient, DEFAULT_CONTAINER_ANNOTATION};
