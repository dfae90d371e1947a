//! Plugin runs: one-shot containers attached to an instance's network

use super::NodeManager;
use crate::{CoreError, Result};
use avsctl_provider::{ContainerId, PsQuery, RunSpec, VolumeBind};
use tokio::io::AsyncWrite;

/// Options for a plugin run
#[derive(Debug, Clone, Default)]
pub struct PluginRunOptions {
    /// Run on the host network instead of the instance's network
    pub host_network: bool,
    /// Bind mounts for the plugin container
    pub binds: Vec<VolumeBind>,
    /// Keep the plugin image after the run
    pub no_destroy_image: bool,
}

impl NodeManager {
    /// Run an instance's plugin to completion, streaming its output.
    /// The instance must have at least one running container so its
    /// network can be joined. Returns the plugin's exit code.
    pub async fn run_plugin(
        &self,
        id: &str,
        args: Vec<String>,
        opts: PluginRunOptions,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i64> {
        let runtime = self.require_runtime()?;
        let state = self.datadir().instance(id)?;

        let plugin = state
            .plugin
            .clone()
            .ok_or_else(|| CoreError::NoPlugin(id.to_string()))?;
        plugin.validate()?;

        let running = runtime
            .compose_ps(&self.datadir().compose_path(id), &PsQuery::running())
            .await?;
        let first = running
            .first()
            .ok_or_else(|| CoreError::InstanceNotRunning(id.to_string()))?;

        let network = if opts.host_network {
            "host".to_string()
        } else {
            let container = ContainerId::new(first.id.clone());
            runtime
                .container_networks(&container)
                .await?
                .first()
                .cloned()
                .ok_or_else(|| {
                    CoreError::InvalidState(format!("container {} has no networks", container))
                })?
        };

        let image = match (plugin.image, plugin.build_from) {
            (Some(image), None) => {
                runtime.pull(&image).await?;
                image
            }
            (None, Some(remote)) => {
                let tag = format!("avsctl-plugin-{}", id);
                runtime.build_from_uri(&remote, &tag).await?;
                tag
            }
            // validate() above excludes the remaining shapes
            _ => unreachable!("plugin declaration was validated"),
        };

        let spec = RunSpec {
            image: image.clone(),
            network: Some(network),
            args,
            mounts: opts.binds,
        };
        let exit = runtime.run(&spec, output).await;

        if !opts.no_destroy_image {
            if let Err(e) = runtime.remove_image(&image).await {
                tracing::debug!("removing plugin image {}: {}", image, e);
            }
        }

        Ok(exit?)
    }
}
