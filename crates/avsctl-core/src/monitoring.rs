//! Monitoring stack and scrape-target registry
//!
//! A co-resident Prometheus/Grafana/node-exporter stack lives under
//! `<root>/monitoring/` with its own lockfile. Installed instances
//! register scrape targets as Prometheus file-SD fragments; the scrape
//! container is attached to each instance's network so container IPs
//! resolve.

use crate::locker::DirLock;
use crate::{CoreError, Result};
use avsctl_provider::{ContainerId, NodeRuntime, PsQuery};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

const STACK_COMPOSE: &str = include_str!("../assets/monitoring-compose.yml");
const STACK_PROMETHEUS: &str = include_str!("../assets/prometheus.yml");
const STACK_ENV_TEMPLATE: &str = include_str!("../assets/monitoring.env");
const STACK_GRAFANA_DATASOURCE: &str = include_str!("../assets/grafana-datasource.yml");

const SCRAPE_SERVICE: &str = "prometheus";
const PORT_PROBE_ATTEMPTS: u16 = 100;

/// Whether the stack's files are materialized on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallationStatus {
    Installed,
    NotInstalled,
}

/// Whether the stack's containers are up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackStatus {
    Running,
    Stopped,
}

/// A scrape endpoint to register for an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// A registered target as tracked in `monitoring/targets.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub network: String,
}

/// Prometheus file-SD fragment shape
#[derive(Debug, Serialize, Deserialize)]
struct FileSdEntry {
    targets: Vec<String>,
    labels: HashMap<String, String>,
}

/// Handle on the monitoring area of the data directory
#[derive(Debug, Clone)]
pub struct MonitoringStack {
    dir: PathBuf,
}

impl MonitoringStack {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn compose_path(&self) -> PathBuf {
        self.dir.join("docker-compose.yml")
    }

    fn env_path(&self) -> PathBuf {
        self.dir.join(".env")
    }

    fn prometheus_path(&self) -> PathBuf {
        self.dir.join("prometheus.yml")
    }

    fn grafana_datasource_path(&self) -> PathBuf {
        self.dir.join("grafana-datasource.yml")
    }

    fn targets_dir(&self) -> PathBuf {
        self.dir.join("targets")
    }

    fn registry_path(&self) -> PathBuf {
        self.dir.join("targets.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(".lock")
    }

    fn target_fragment_path(&self, instance_id: &str) -> PathBuf {
        self.targets_dir().join(format!("{}.json", instance_id))
    }

    pub fn installation_status(&self) -> InstallationStatus {
        if self.compose_path().is_file() && self.env_path().is_file() {
            InstallationStatus::Installed
        } else {
            InstallationStatus::NotInstalled
        }
    }

    /// Whether any stack container is running
    pub async fn status(&self, runtime: &dyn NodeRuntime) -> Result<StackStatus> {
        if self.installation_status() == InstallationStatus::NotInstalled {
            return Ok(StackStatus::Stopped);
        }
        let services = runtime
            .compose_ps(&self.compose_path(), &PsQuery::running())
            .await?;
        if services.is_empty() {
            Ok(StackStatus::Stopped)
        } else {
            Ok(StackStatus::Running)
        }
    }

    /// Materialize the stack's compose file, Prometheus config and `.env`.
    /// Port variables that collide with listening sockets are bumped to
    /// the next free port.
    pub fn install_stack(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let _lock = DirLock::acquire(&self.lock_path())?;

        std::fs::write(self.compose_path(), STACK_COMPOSE)?;
        std::fs::write(self.prometheus_path(), STACK_PROMETHEUS)?;
        std::fs::write(self.grafana_datasource_path(), STACK_GRAFANA_DATASOURCE)?;
        std::fs::write(self.env_path(), render_env(STACK_ENV_TEMPLATE)?)?;
        self.init_unlocked()?;

        Ok(())
    }

    /// Ensure the targets directory and registry exist
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let _lock = DirLock::acquire(&self.lock_path())?;
        self.init_unlocked()
    }

    fn init_unlocked(&self) -> Result<()> {
        std::fs::create_dir_all(self.targets_dir())?;
        if !self.registry_path().exists() {
            self.save_registry(&HashMap::new())?;
        }
        Ok(())
    }

    /// Start the stack containers
    pub async fn run(&self, runtime: &dyn NodeRuntime) -> Result<()> {
        if self.installation_status() == InstallationStatus::NotInstalled {
            return Err(CoreError::InvalidState(
                "monitoring stack is not installed".to_string(),
            ));
        }
        runtime.compose_up(&self.compose_path()).await?;
        Ok(())
    }

    /// Stop the stack containers without destroying them
    pub async fn stop(&self, runtime: &dyn NodeRuntime) -> Result<()> {
        if self.installation_status() == InstallationStatus::NotInstalled {
            return Ok(());
        }
        runtime.compose_stop(&self.compose_path()).await?;
        Ok(())
    }

    /// Tear the stack down and remove its files. `force` also removes the
    /// stack's volumes.
    pub async fn cleanup(&self, runtime: &dyn NodeRuntime, force: bool) -> Result<()> {
        if self.installation_status() == InstallationStatus::NotInstalled {
            return Ok(());
        }

        runtime.compose_down(&self.compose_path(), force).await?;

        let _lock = DirLock::acquire(&self.lock_path())?;
        for path in [
            self.compose_path(),
            self.prometheus_path(),
            self.grafana_datasource_path(),
            self.env_path(),
            self.registry_path(),
        ] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        if self.targets_dir().exists() {
            std::fs::remove_dir_all(self.targets_dir())?;
        }
        Ok(())
    }

    /// Register a scrape target for an instance and attach the scrape
    /// container to the instance's network
    pub async fn add_target(
        &self,
        runtime: &dyn NodeRuntime,
        target: &ScrapeTarget,
        instance_id: &str,
        network: &str,
    ) -> Result<()> {
        {
            let _lock = DirLock::acquire(&self.lock_path())?;
            self.init_unlocked()?;

            let fragment = vec![FileSdEntry {
                targets: vec![format!("{}:{}", target.host, target.port)],
                labels: HashMap::from([
                    ("avsctl_instance".to_string(), instance_id.to_string()),
                    ("__metrics_path__".to_string(), target.path.clone()),
                ]),
            }];
            let mut content = serde_json::to_string_pretty(&fragment)?;
            content.push('\n');
            std::fs::write(self.target_fragment_path(instance_id), content)?;

            let mut registry = self.load_registry()?;
            registry.insert(
                instance_id.to_string(),
                RegisteredTarget {
                    host: target.host.clone(),
                    port: target.port,
                    path: target.path.clone(),
                    network: network.to_string(),
                },
            );
            self.save_registry(&registry)?;
        }

        // Attach the scrape container so the target IP routes. Already
        // being attached is not an error worth surfacing.
        if let Some(scraper) = self.scrape_container(runtime).await? {
            if let Err(e) = runtime.connect_network(&scraper, network).await {
                tracing::debug!("connect {} to {}: {}", scraper, network, e);
            }
        }

        Ok(())
    }

    /// Deregister an instance's target. Unknown ids are a no-op.
    pub async fn remove_target(&self, runtime: &dyn NodeRuntime, instance_id: &str) -> Result<()> {
        let removed = {
            let _lock = DirLock::acquire(&self.lock_path())?;

            let fragment = self.target_fragment_path(instance_id);
            if fragment.exists() {
                std::fs::remove_file(&fragment)?;
            }

            let mut registry = self.load_registry()?;
            let removed = registry.remove(instance_id);
            self.save_registry(&registry)?;
            removed
        };

        if let Some(target) = removed {
            if let Some(scraper) = self.scrape_container(runtime).await? {
                if let Err(e) = runtime.disconnect_network(&scraper, &target.network).await {
                    tracing::debug!("disconnect {} from {}: {}", scraper, target.network, e);
                }
            }
        }

        Ok(())
    }

    /// Currently registered targets, keyed by instance id
    pub fn registered_targets(&self) -> Result<HashMap<String, RegisteredTarget>> {
        let _lock = DirLock::acquire(&self.lock_path())?;
        self.load_registry()
    }

    async fn scrape_container(&self, runtime: &dyn NodeRuntime) -> Result<Option<ContainerId>> {
        if self.installation_status() == InstallationStatus::NotInstalled {
            return Ok(None);
        }
        let mut query = PsQuery::service(SCRAPE_SERVICE);
        query.filter_running = true;
        let services = runtime.compose_ps(&self.compose_path(), &query).await?;
        Ok(services.first().map(|s| ContainerId::new(s.id.clone())))
    }

    fn load_registry(&self) -> Result<HashMap<String, RegisteredTarget>> {
        let path = self.registry_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save_registry(&self, registry: &HashMap<String, RegisteredTarget>) -> Result<()> {
        let mut content = serde_json::to_string_pretty(registry)?;
        content.push('\n');
        std::fs::write(self.registry_path(), content)?;
        Ok(())
    }
}

/// Render the stack `.env`, bumping every `*_PORT` variable to the next
/// free host port. A non-integer port value is a fatal configuration
/// error.
fn render_env(template: &str) -> Result<String> {
    let mut rendered = String::new();
    for line in template.lines() {
        match line.split_once('=') {
            Some((key, value)) if key.ends_with("_PORT") => {
                let start: u16 = value.trim().parse().map_err(|_| CoreError::InvalidPort {
                    variable: key.to_string(),
                    value: value.trim().to_string(),
                })?;
                let port = next_free_port(key, start)?;
                rendered.push_str(&format!("{}={}\n", key, port));
            }
            _ => {
                rendered.push_str(line);
                rendered.push('\n');
            }
        }
    }
    Ok(rendered)
}

/// Find the first free port at or above `start`, bounded by
/// `PORT_PROBE_ATTEMPTS` increments
fn next_free_port(variable: &str, start: u16) -> Result<u16> {
    let mut port = start;
    for _ in 0..PORT_PROBE_ATTEMPTS {
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
        port = port.checked_add(1).ok_or(CoreError::NoFreePort {
            variable: variable.to_string(),
            start,
            attempts: PORT_PROBE_ATTEMPTS,
        })?;
    }
    Err(CoreError::NoFreePort {
        variable: variable.to_string(),
        start,
        attempts: PORT_PROBE_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRuntime;

    fn stack() -> (tempfile::TempDir, MonitoringStack) {
        let tmp = tempfile::tempdir().unwrap();
        let stack = MonitoringStack::new(tmp.path().join("monitoring"));
        (tmp, stack)
    }

    #[test]
    fn test_install_stack_materializes_files() {
        let (_tmp, stack) = stack();
        assert_eq!(stack.installation_status(), InstallationStatus::NotInstalled);

        stack.install_stack().unwrap();
        assert_eq!(stack.installation_status(), InstallationStatus::Installed);
        assert!(stack.compose_path().is_file());
        assert!(stack.targets_dir().is_dir());
        assert!(stack.registry_path().is_file());

        let env = std::fs::read_to_string(stack.env_path()).unwrap();
        assert!(env.contains("PROMETHEUS_PORT="));
        assert!(env.contains("GRAFANA_PORT="));
    }

    #[tokio::test]
    async fn test_add_and_remove_target() {
        let (_tmp, stack) = stack();
        stack.install_stack().unwrap();
        let runtime = MockRuntime::new();

        let target = ScrapeTarget {
            host: "172.18.0.2".to_string(),
            port: 9090,
            path: "/metrics".to_string(),
        };
        stack
            .add_target(&runtime, &target, "mock-avs-default", "mock-avs-default_default")
            .await
            .unwrap();

        let fragment = stack.target_fragment_path("mock-avs-default");
        assert!(fragment.exists());
        let content = std::fs::read_to_string(&fragment).unwrap();
        assert!(content.contains("172.18.0.2:9090"));
        assert!(content.contains("avsctl_instance"));

        let registered = stack.registered_targets().unwrap();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered["mock-avs-default"].port, 9090);

        stack
            .remove_target(&runtime, "mock-avs-default")
            .await
            .unwrap();
        assert!(!fragment.exists());
        assert!(stack.registered_targets().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_target_is_noop() {
        let (_tmp, stack) = stack();
        stack.install_stack().unwrap();
        let runtime = MockRuntime::new();
        stack.remove_target(&runtime, "ghost-default").await.unwrap();
    }

    #[test]
    fn test_render_env_bumps_taken_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();

        let template = format!("SOME_PORT={}\nOTHER=untouched\n", taken);
        let rendered = render_env(&template).unwrap();

        let line = rendered
            .lines()
            .find(|l| l.starts_with("SOME_PORT="))
            .unwrap();
        let picked: u16 = line.trim_start_matches("SOME_PORT=").parse().unwrap();
        assert!(picked > taken);
        assert!(rendered.contains("OTHER=untouched"));
    }

    #[test]
    fn test_render_env_rejects_non_integer_port() {
        let result = render_env("SOME_PORT=lots\n");
        assert!(matches!(result, Err(CoreError::InvalidPort { .. })));
    }

    #[test]
    fn test_next_free_port_exhaustion() {
        // Ports cannot exceed u16::MAX, so starting near the top
        // exhausts the probe window when the top ports are taken.
        let result = next_free_port("X_PORT", u16::MAX - 2);
        // Either a free port near the top or a clean exhaustion error;
        // both are acceptable on a shared test host.
        if let Err(e) = result {
            assert!(matches!(e, CoreError::NoFreePort { .. }));
        }
    }
}
