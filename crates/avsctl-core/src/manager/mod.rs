//! Node manager - coordinates the instance lifecycle
//!
//! The manager is the single entry point the CLI drives. It composes the
//! data directory, the container runtime adapter, the monitoring stack
//! and the backup engine into the install / update / uninstall / run /
//! stop / backup / restore operations.

mod install;
mod logs;
mod plugin;
mod update;

pub use install::*;
pub use plugin::*;
pub use update::*;

use crate::backup::{self, BackupIndex, BackupInfo};
use crate::datadir::LOCK_FILE;
use crate::locker::DirLock;
use crate::monitoring::{InstallationStatus, MonitoringStack, ScrapeTarget};
use crate::{CoreError, DataDir, HealthClient, InstanceState, NodeHealth, Result};
use avsctl_config::GlobalConfig;
use avsctl_provider::{ContainerId, NodeRuntime, PsQuery};
use chrono::Utc;
use std::path::PathBuf;

/// Main node manager
pub struct NodeManager {
    /// Container runtime (None when disconnected)
    runtime: Option<Box<dyn NodeRuntime>>,
    /// The data directory all durable state lives in
    datadir: DataDir,
    /// Monitoring stack handle
    monitoring: MonitoringStack,
    /// Health endpoint client
    health: HealthClient,
    /// Global configuration
    global_config: GlobalConfig,
    /// Error message when disconnected
    connection_error: Option<String>,
}

/// One row of `ls` output
#[derive(Debug, Clone)]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub tag: String,
    pub version: String,
    pub commit: String,
    pub profile: String,
    pub running: bool,
    pub health: NodeHealth,
}

impl NodeManager {
    /// Create a new manager connected to a runtime
    pub fn new(runtime: Box<dyn NodeRuntime>, global_config: GlobalConfig) -> Result<Self> {
        let datadir = DataDir::open(global_config.data_dir()?)?;
        Ok(Self::with_datadir(Some(runtime), global_config, datadir))
    }

    /// Create a disconnected manager (no runtime available); read-only
    /// operations still work
    pub fn disconnected(global_config: GlobalConfig, error: String) -> Result<Self> {
        let datadir = DataDir::open(global_config.data_dir()?)?;
        let mut manager = Self::with_datadir(None, global_config, datadir);
        manager.connection_error = Some(error);
        Ok(manager)
    }

    /// Create a manager over a specific data directory
    pub fn with_datadir(
        runtime: Option<Box<dyn NodeRuntime>>,
        global_config: GlobalConfig,
        datadir: DataDir,
    ) -> Self {
        let monitoring = MonitoringStack::new(datadir.monitoring_dir());
        Self {
            runtime,
            datadir,
            monitoring,
            health: HealthClient::new(),
            global_config,
            connection_error: None,
        }
    }

    /// Check if connected to a runtime
    pub fn is_connected(&self) -> bool {
        self.runtime.is_some()
    }

    /// Get the connection error message (if disconnected)
    pub fn connection_error(&self) -> Option<&str> {
        self.connection_error.as_deref()
    }

    /// Get the runtime, returning an error if not connected
    pub(crate) fn require_runtime(&self) -> Result<&dyn NodeRuntime> {
        self.runtime.as_deref().ok_or_else(|| {
            CoreError::NotConnected(
                self.connection_error
                    .clone()
                    .unwrap_or_else(|| "no container runtime available".to_string()),
            )
        })
    }

    pub fn datadir(&self) -> &DataDir {
        &self.datadir
    }

    pub fn monitoring(&self) -> &MonitoringStack {
        &self.monitoring
    }

    pub fn global_config(&self) -> &GlobalConfig {
        &self.global_config
    }

    /// Summaries of every installed instance, annotated with liveness and
    /// health where a runtime connection allows it
    pub async fn list_instances(&self) -> Result<Vec<InstanceSummary>> {
        let mut summaries = Vec::new();
        for state in self.datadir.list_instances()? {
            let id = state.id();
            let running = match self.runtime.as_deref() {
                Some(runtime) => {
                    match runtime
                        .compose_ps(&self.datadir.compose_path(&id), &PsQuery::running())
                        .await
                    {
                        Ok(services) => !services.is_empty(),
                        Err(e) => {
                            tracing::warn!("compose ps for {}: {}", id, e);
                            false
                        }
                    }
                }
                None => false,
            };

            let health = if running {
                self.instance_health(&state).await
            } else {
                NodeHealth::Unknown
            };

            summaries.push(InstanceSummary {
                id,
                name: state.name,
                tag: state.tag,
                version: state.version,
                commit: state.commit,
                profile: state.profile,
                running,
                health,
            });
        }
        Ok(summaries)
    }

    async fn instance_health(&self, state: &InstanceState) -> NodeHealth {
        let Some(ref api) = state.api_target else {
            return NodeHealth::Unknown;
        };
        let Ok(runtime) = self.require_runtime() else {
            return NodeHealth::Unknown;
        };

        let id = state.id();
        let query = PsQuery {
            filter_running: true,
            service: Some(api.service.clone()),
        };
        let services = match runtime
            .compose_ps(&self.datadir.compose_path(&id), &query)
            .await
        {
            Ok(services) => services,
            Err(_) => return NodeHealth::Unknown,
        };
        let Some(service) = services.first() else {
            return NodeHealth::Unknown;
        };

        match runtime
            .container_ip(&ContainerId::new(service.id.clone()))
            .await
        {
            Ok(ip) => self.health.check(&ip, api.port).await,
            Err(_) => NodeHealth::Unknown,
        }
    }

    /// Start an instance's compose stack and register its monitoring
    /// targets once it is up
    pub async fn run(&self, id: &str) -> Result<()> {
        let runtime = self.require_runtime()?;
        let state = self.datadir.instance(id)?;

        runtime.compose_up(&self.datadir.compose_path(id)).await?;
        self.register_instance_targets(&state).await?;
        Ok(())
    }

    /// Stop an instance's compose stack without destroying it
    pub async fn stop(&self, id: &str) -> Result<()> {
        let runtime = self.require_runtime()?;
        let _state = self.datadir.instance(id)?;

        self.deregister_instance_targets(id).await;
        runtime.compose_stop(&self.datadir.compose_path(id)).await?;
        Ok(())
    }

    /// Uninstall an instance: deregister monitoring, tear down the stack
    /// including volumes, remove the directory
    pub async fn uninstall(&self, id: &str) -> Result<()> {
        let runtime = self.require_runtime()?;
        let _state = self.datadir.instance(id)?;

        self.deregister_instance_targets(id).await;

        let compose = self.datadir.compose_path(id);
        if compose.exists() {
            runtime.compose_down(&compose, true).await?;
        }

        self.datadir.remove_instance(id)
    }

    /// Back up an instance directory. Returns the backup id.
    pub async fn backup(&self, id: &str) -> Result<String> {
        let state = self.datadir.instance(id)?;

        let timestamp = Utc::now();
        let backup_id = backup::backup_id(id, &timestamp);
        let archive = self.backup_archive_path(&backup_id);

        let size_bytes = {
            let _lock = DirLock::acquire(&self.datadir.instance_lock_path(id))?;
            backup::create_archive(&self.datadir.instance_dir(id), &archive)?
        };

        let mut index = BackupIndex::load_from(&self.backup_index_path())?;
        index.add(BackupInfo {
            id: backup_id.clone(),
            instance_id: id.to_string(),
            url: state.url,
            version: state.version,
            commit: state.commit,
            timestamp,
            size_bytes,
        });
        index.save_to(&self.backup_index_path())?;

        tracing::info!("backed up {} as {}", id, backup_id);
        Ok(backup_id)
    }

    /// Restore an instance from a backup, uninstalling any same-id
    /// instance first. Returns the restored instance id.
    pub async fn restore(&self, backup_id: &str, run_after: bool) -> Result<String> {
        let index = BackupIndex::load_from(&self.backup_index_path())?;
        let info = index
            .get(backup_id)
            .cloned()
            .ok_or_else(|| CoreError::BackupNotFound(backup_id.to_string()))?;

        if self.datadir.has_instance(&info.instance_id) {
            self.uninstall(&info.instance_id).await?;
        }

        let dir = self.datadir.instance_dir(&info.instance_id);
        backup::extract_archive(&self.backup_archive_path(backup_id), &dir)?;
        // The archive carries everything but the lockfile
        std::fs::write(dir.join(LOCK_FILE), "")?;

        if run_after {
            self.run(&info.instance_id).await?;
        }

        Ok(info.instance_id)
    }

    /// All backups, newest first
    pub fn backup_list(&self) -> Result<Vec<BackupInfo>> {
        let index = BackupIndex::load_from(&self.backup_index_path())?;
        Ok(index.list())
    }

    /// Install and/or start the monitoring stack, then re-register every
    /// running instance's targets
    pub async fn init_monitoring(&self, install: bool, run: bool) -> Result<()> {
        if install && self.monitoring.installation_status() == InstallationStatus::NotInstalled {
            self.monitoring.install_stack()?;
        }
        self.monitoring.init()?;

        if run {
            let runtime = self.require_runtime()?;
            self.monitoring.run(runtime).await?;
        }

        for state in self.datadir.list_instances()? {
            if let Err(e) = self.register_instance_targets(&state).await {
                tracing::warn!("re-registering targets for {}: {}", state.id(), e);
            }
        }
        Ok(())
    }

    /// Tear the monitoring stack down, volumes included
    pub async fn clean_monitoring(&self) -> Result<()> {
        let runtime = self.require_runtime()?;
        self.monitoring.cleanup(runtime, true).await
    }

    pub(crate) fn backup_index_path(&self) -> PathBuf {
        self.datadir.backup_dir().join("index.json")
    }

    pub(crate) fn backup_archive_path(&self, backup_id: &str) -> PathBuf {
        self.datadir.backup_dir().join(format!("{}.tar", backup_id))
    }

    /// Register every declared monitoring target of a running instance.
    /// A no-op while the monitoring stack is not installed.
    pub(crate) async fn register_instance_targets(&self, state: &InstanceState) -> Result<()> {
        if self.monitoring.installation_status() == InstallationStatus::NotInstalled {
            return Ok(());
        }
        let runtime = self.require_runtime()?;
        let id = state.id();

        let running = runtime
            .compose_ps(&self.datadir.compose_path(&id), &PsQuery::running())
            .await?;

        for target in &state.monitoring_targets {
            let Some(service) = running.iter().find(|s| s.service == target.service) else {
                tracing::debug!(
                    "service {} of {} is not running, skipping target",
                    target.service,
                    id
                );
                continue;
            };

            let port = target
                .port
                .ok_or_else(|| CoreError::MonitoringPortNotSet(target.service.clone()))?;

            let container = ContainerId::new(service.id.clone());
            let ip = runtime.container_ip(&container).await?;
            let networks = runtime.container_networks(&container).await?;
            let network = networks.first().ok_or_else(|| {
                CoreError::InvalidState(format!("container {} has no networks", container))
            })?;

            self.monitoring
                .add_target(
                    runtime,
                    &ScrapeTarget {
                        host: ip,
                        port,
                        path: target.path.clone(),
                    },
                    &id,
                    network,
                )
                .await?;
        }
        Ok(())
    }

    /// Best-effort removal of an instance's monitoring target
    pub(crate) async fn deregister_instance_targets(&self, id: &str) {
        let Ok(runtime) = self.require_runtime() else {
            return;
        };
        if let Err(e) = self.monitoring.remove_target(runtime, id).await {
            tracing::warn!("deregistering monitoring target for {}: {}", id, e);
        }
    }
}
