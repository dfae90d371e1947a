//! Merged log streaming for an instance's services

use super::NodeManager;
use crate::Result;
use avsctl_provider::{LogOptions, PsQuery};
use tokio::io::AsyncWrite;
use tokio::sync::watch;

impl NodeManager {
    /// Stream the interleaved logs of every service in an instance's
    /// compose stack into `writer`. The only cancellable operation: flip
    /// the watch channel to tear the merged readers down.
    pub async fn node_logs(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        id: &str,
        opts: &LogOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let runtime = self.require_runtime()?;
        let _state = self.datadir().instance(id)?;

        let services = runtime
            .compose_ps(&self.datadir().compose_path(id), &PsQuery::default())
            .await?;

        runtime
            .logs_merged(writer, &services, opts, cancel)
            .await?;
        Ok(())
    }
}
