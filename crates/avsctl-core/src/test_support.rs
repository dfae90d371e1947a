//! Test support utilities for avsctl-core
//!
//! Provides MockRuntime and helpers for exercising the NodeManager
//! without a real Docker daemon.

use async_trait::async_trait;
use avsctl_provider::{
    ComposeService, ContainerId, LogOptions, NodeRuntime, PsQuery, Result, RunSpec, RuntimeError,
    VolumeBind,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Records which methods were called on the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    ComposeCreate { path: PathBuf, build: bool },
    ComposeUp { path: PathBuf },
    ComposeStop { path: PathBuf },
    ComposeDown { path: PathBuf, volumes: bool },
    ComposePs { path: PathBuf },
    ContainerIp { id: String },
    ContainerNetworks { id: String },
    ConnectNetwork { id: String, network: String },
    DisconnectNetwork { id: String, network: String },
    Pull { image: String },
    BuildFromUri { remote: String, tag: String },
    Run { image: String, network: Option<String>, args: Vec<String>, mounts: Vec<VolumeBind> },
    RemoveImage { image: String },
    LogsMerged { services: Vec<String> },
    Ping,
}

/// Configurable mock runtime for testing
pub struct MockRuntime {
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    /// Result for compose create calls
    pub compose_create_result: Arc<Mutex<Result<()>>>,
    /// Result for compose up calls
    pub compose_up_result: Arc<Mutex<Result<()>>>,
    /// Result for compose stop calls
    pub compose_stop_result: Arc<Mutex<Result<()>>>,
    /// Result for compose down calls
    pub compose_down_result: Arc<Mutex<Result<()>>>,
    /// Result for compose ps calls; the query filter is applied on top
    pub ps_result: Arc<Mutex<Result<Vec<ComposeService>>>>,
    /// Result for container IP lookups
    pub ip_result: Arc<Mutex<Result<String>>>,
    /// Result for container network lookups
    pub networks_result: Arc<Mutex<Result<Vec<String>>>>,
    /// Result for image pulls
    pub pull_result: Arc<Mutex<Result<()>>>,
    /// Result for remote builds
    pub build_result: Arc<Mutex<Result<()>>>,
    /// Exit code returned by run calls
    pub run_exit_code: Arc<Mutex<i64>>,
    /// Error for run calls (if Some, run returns this error)
    pub run_error: Arc<Mutex<Option<RuntimeError>>>,
    /// Canned log lines per container id, served by logs_merged
    pub log_lines: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a new mock with default success results
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            compose_create_result: Arc::new(Mutex::new(Ok(()))),
            compose_up_result: Arc::new(Mutex::new(Ok(()))),
            compose_stop_result: Arc::new(Mutex::new(Ok(()))),
            compose_down_result: Arc::new(Mutex::new(Ok(()))),
            ps_result: Arc::new(Mutex::new(Ok(Vec::new()))),
            ip_result: Arc::new(Mutex::new(Ok("172.18.0.2".to_string()))),
            networks_result: Arc::new(Mutex::new(Ok(vec!["mock_network".to_string()]))),
            pull_result: Arc::new(Mutex::new(Ok(()))),
            build_result: Arc::new(Mutex::new(Ok(()))),
            run_exit_code: Arc::new(Mutex::new(0)),
            run_error: Arc::new(Mutex::new(None)),
            log_lines: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Get all recorded calls
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Check if a specific call was made
    pub fn was_called(&self, call: &MockCall) -> bool {
        self.calls.lock().unwrap().contains(call)
    }

    /// Count calls matching a predicate
    pub fn call_count<F: Fn(&MockCall) -> bool>(&self, filter: F) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| filter(c))
            .count()
    }

    /// Declare a compose service the mock's ps will report
    pub fn add_service(&self, id: &str, name: &str, state: &str, service: &str) {
        let mut guard = self.ps_result.lock().unwrap();
        if let Ok(ref mut services) = *guard {
            services.push(ComposeService {
                id: id.to_string(),
                name: name.to_string(),
                state: state.to_string(),
                service: service.to_string(),
            });
        }
    }

    /// Seed canned log lines for a container
    pub fn set_log_lines(&self, container_id: &str, lines: &[&str]) {
        self.log_lines.lock().unwrap().insert(
            container_id.to_string(),
            lines.iter().map(|s| s.to_string()).collect(),
        );
    }
}

/// Helper to clone a Result<T> from an Arc<Mutex<Result<T>>>
fn clone_result<T: Clone>(r: &Arc<Mutex<Result<T>>>) -> Result<T> {
    let guard = r.lock().unwrap();
    match &*guard {
        Ok(v) => Ok(v.clone()),
        Err(e) => Err(clone_runtime_error(e)),
    }
}

/// Clone a RuntimeError (thiserror types don't implement Clone)
pub fn clone_runtime_error(e: &RuntimeError) -> RuntimeError {
    match e {
        RuntimeError::Connection(s) => RuntimeError::Connection(s.clone()),
        RuntimeError::ContainerNotFound(s) => RuntimeError::ContainerNotFound(s.clone()),
        RuntimeError::ImageNotFound(s) => RuntimeError::ImageNotFound(s.clone()),
        RuntimeError::Build(s) => RuntimeError::Build(s.clone()),
        RuntimeError::Compose { verb, message } => RuntimeError::Compose {
            verb: verb.clone(),
            message: message.clone(),
        },
        RuntimeError::Runtime(s) => RuntimeError::Runtime(s.clone()),
        RuntimeError::Parse(s) => RuntimeError::Parse(s.clone()),
        RuntimeError::NoContainerIp(s) => RuntimeError::NoContainerIp(s.clone()),
        RuntimeError::NoContainerNetwork(s) => RuntimeError::NoContainerNetwork(s.clone()),
        RuntimeError::Cancelled => RuntimeError::Cancelled,
        RuntimeError::Io(_) => RuntimeError::Runtime("IO error (cloned)".to_string()),
    }
}

#[async_trait]
impl NodeRuntime for MockRuntime {
    async fn compose_create(&self, compose_path: &Path, build: bool) -> Result<()> {
        self.record(MockCall::ComposeCreate {
            path: compose_path.to_path_buf(),
            build,
        });
        clone_result(&self.compose_create_result)
    }

    async fn compose_up(&self, compose_path: &Path) -> Result<()> {
        self.record(MockCall::ComposeUp {
            path: compose_path.to_path_buf(),
        });
        clone_result(&self.compose_up_result)
    }

    async fn compose_stop(&self, compose_path: &Path) -> Result<()> {
        self.record(MockCall::ComposeStop {
            path: compose_path.to_path_buf(),
        });
        clone_result(&self.compose_stop_result)
    }

    async fn compose_down(&self, compose_path: &Path, volumes: bool) -> Result<()> {
        self.record(MockCall::ComposeDown {
            path: compose_path.to_path_buf(),
            volumes,
        });
        clone_result(&self.compose_down_result)
    }

    async fn compose_ps(
        &self,
        compose_path: &Path,
        query: &PsQuery,
    ) -> Result<Vec<ComposeService>> {
        self.record(MockCall::ComposePs {
            path: compose_path.to_path_buf(),
        });
        let services = clone_result(&self.ps_result)?;
        Ok(services.into_iter().filter(|s| query.matches(s)).collect())
    }

    async fn container_ip(&self, id: &ContainerId) -> Result<String> {
        self.record(MockCall::ContainerIp { id: id.0.clone() });
        clone_result(&self.ip_result)
    }

    async fn container_networks(&self, id: &ContainerId) -> Result<Vec<String>> {
        self.record(MockCall::ContainerNetworks { id: id.0.clone() });
        clone_result(&self.networks_result)
    }

    async fn connect_network(&self, id: &ContainerId, network: &str) -> Result<()> {
        self.record(MockCall::ConnectNetwork {
            id: id.0.clone(),
            network: network.to_string(),
        });
        Ok(())
    }

    async fn disconnect_network(&self, id: &ContainerId, network: &str) -> Result<()> {
        self.record(MockCall::DisconnectNetwork {
            id: id.0.clone(),
            network: network.to_string(),
        });
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.record(MockCall::Pull {
            image: image.to_string(),
        });
        clone_result(&self.pull_result)
    }

    async fn build_from_uri(&self, remote: &str, tag: &str) -> Result<()> {
        self.record(MockCall::BuildFromUri {
            remote: remote.to_string(),
            tag: tag.to_string(),
        });
        clone_result(&self.build_result)
    }

    async fn run(
        &self,
        spec: &RunSpec,
        _output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i64> {
        self.record(MockCall::Run {
            image: spec.image.clone(),
            network: spec.network.clone(),
            args: spec.args.clone(),
            mounts: spec.mounts.clone(),
        });
        if let Some(err) = self.run_error.lock().unwrap().as_ref() {
            return Err(clone_runtime_error(err));
        }
        Ok(*self.run_exit_code.lock().unwrap())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.record(MockCall::RemoveImage {
            image: image.to_string(),
        });
        Ok(())
    }

    async fn logs_merged(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        services: &[ComposeService],
        opts: &LogOptions,
        _cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        self.record(MockCall::LogsMerged {
            services: services.iter().map(|s| s.service.clone()).collect(),
        });

        let tail: Option<usize> = opts.tail.as_ref().and_then(|t| t.parse().ok());
        let canned = self.log_lines.lock().unwrap().clone();
        for service in services {
            let lines = canned.get(&service.id).cloned().unwrap_or_default();
            let skip = match tail {
                Some(n) if lines.len() > n => lines.len() - n,
                _ => 0,
            };
            for line in &lines[skip..] {
                let formatted = format!("{}: {}\n", service.service, line);
                writer.write_all(formatted.as_bytes()).await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.record(MockCall::Ping);
        Ok(())
    }
}
