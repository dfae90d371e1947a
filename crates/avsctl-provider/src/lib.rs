//! Container runtime adapter for avsctl
//!
//! This crate abstracts the operations the lifecycle engine issues against
//! the host container runtime: compose verbs on an instance's compose file,
//! container inspection, image handling, one-shot plugin runs and merged
//! log streaming.

mod docker;
mod error;
mod types;

pub use docker::DockerRuntime;
pub use error::*;
pub use types::*;

use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncWrite;
use tokio::sync::watch;

/// Trait for container runtimes the lifecycle engine drives.
///
/// Compose verbs operate on a compose file path; the project name derives
/// from the file's directory, which for instances is the instance id.
#[async_trait]
pub trait NodeRuntime: Send + Sync {
    /// Create the compose stack's containers, optionally building images
    async fn compose_create(&self, compose_path: &Path, build: bool) -> Result<()>;

    /// Start the compose stack (detached)
    async fn compose_up(&self, compose_path: &Path) -> Result<()>;

    /// Stop the compose stack without destroying it
    async fn compose_stop(&self, compose_path: &Path) -> Result<()>;

    /// Tear the compose stack down, optionally removing volumes
    async fn compose_down(&self, compose_path: &Path, volumes: bool) -> Result<()>;

    /// List the stack's services, filtered by the query
    async fn compose_ps(&self, compose_path: &Path, query: &PsQuery)
        -> Result<Vec<ComposeService>>;

    /// IP address of a container on its first attached network
    async fn container_ip(&self, id: &ContainerId) -> Result<String>;

    /// Names of the networks a container is attached to
    async fn container_networks(&self, id: &ContainerId) -> Result<Vec<String>>;

    /// Attach a container to a network
    async fn connect_network(&self, id: &ContainerId, network: &str) -> Result<()>;

    /// Detach a container from a network
    async fn disconnect_network(&self, id: &ContainerId, network: &str) -> Result<()>;

    /// Pull an image from a registry
    async fn pull(&self, image: &str) -> Result<()>;

    /// Build an image from a remote build context (e.g. a git URL)
    async fn build_from_uri(&self, remote: &str, tag: &str) -> Result<()>;

    /// Run a one-shot container to completion, streaming its output.
    /// Returns the container's exit code; the container is removed
    /// afterwards.
    async fn run(
        &self,
        spec: &RunSpec,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i64>;

    /// Remove an image
    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Interleave logs from several containers into one writer, each line
    /// prefixed with its service name. Cancellable through the watch
    /// channel; all other operations run to completion.
    async fn logs_merged(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        services: &[ComposeService],
        opts: &LogOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<()>;

    /// Check if the runtime is reachable
    async fn ping(&self) -> Result<()>;
}

/// Connect to the runtime configured in the global config
pub async fn connect_runtime(
    config: &avsctl_config::GlobalConfig,
) -> Result<Box<dyn NodeRuntime>> {
    let runtime = DockerRuntime::new(&config.runtime.socket).await?;
    Ok(Box::new(runtime))
}
