//! Docker runtime implementation
//!
//! Container-level operations go through the Docker API (bollard); compose
//! verbs shell out to `docker compose`, which owns the project model and
//! the build pipeline.

use crate::{
    ComposeService, ContainerId, LogOptions, NodeRuntime, PsQuery, Result, RunSpec, RuntimeError,
    parse_compose_ps,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions};
use bollard::network::{ConnectNetworkOptions, DisconnectNetworkOptions};
use bollard::service::{EndpointSettings, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

/// Docker runtime using bollard for the API side and the `docker compose`
/// CLI for compose verbs
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon at the given socket
    pub async fn new(socket_path: &str) -> Result<Self> {
        let client = if socket_path.starts_with("http://") || socket_path.starts_with("https://") {
            Docker::connect_with_http(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::Connection(e.to_string()))?
        } else {
            let path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::Connection(e.to_string()))?
        };

        // Test connection
        client
            .ping()
            .await
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;

        Ok(Self { client })
    }

    /// Get the underlying Docker client
    pub fn client(&self) -> &Docker {
        &self.client
    }

    /// Run `docker compose -f <path> <verb> <extra…>` and capture stdout
    async fn compose(&self, compose_path: &Path, verb: &str, extra: &[&str]) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose").arg("-f").arg(compose_path).arg(verb);
        cmd.args(extra);
        // The project name derives from the compose file's directory
        if let Some(dir) = compose_path.parent() {
            cmd.current_dir(dir);
        }

        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::Compose {
                verb: verb.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(RuntimeError::Compose {
                verb: verb.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn endpoint_ip(endpoint: &EndpointSettings) -> Option<String> {
        endpoint
            .ip_address
            .as_ref()
            .filter(|ip| !ip.is_empty())
            .cloned()
    }
}

#[async_trait]
impl NodeRuntime for DockerRuntime {
    async fn compose_create(&self, compose_path: &Path, build: bool) -> Result<()> {
        let args: &[&str] = if build { &["--build"] } else { &[] };
        self.compose(compose_path, "create", args).await?;
        Ok(())
    }

    async fn compose_up(&self, compose_path: &Path) -> Result<()> {
        self.compose(compose_path, "up", &["-d"]).await?;
        Ok(())
    }

    async fn compose_stop(&self, compose_path: &Path) -> Result<()> {
        self.compose(compose_path, "stop", &[]).await?;
        Ok(())
    }

    async fn compose_down(&self, compose_path: &Path, volumes: bool) -> Result<()> {
        let args: &[&str] = if volumes {
            &["--volumes", "--remove-orphans"]
        } else {
            &["--remove-orphans"]
        };
        self.compose(compose_path, "down", args).await?;
        Ok(())
    }

    async fn compose_ps(
        &self,
        compose_path: &Path,
        query: &PsQuery,
    ) -> Result<Vec<ComposeService>> {
        let raw = self
            .compose(compose_path, "ps", &["--all", "--format", "json"])
            .await?;
        let services = parse_compose_ps(&raw)?;
        Ok(services.into_iter().filter(|s| query.matches(s)).collect())
    }

    async fn container_ip(&self, id: &ContainerId) -> Result<String> {
        let info = self.client.inspect_container(&id.0, None).await?;
        let settings = info
            .network_settings
            .ok_or_else(|| RuntimeError::NoContainerIp(id.0.clone()))?;

        if let Some(networks) = settings.networks.as_ref() {
            if let Some(ip) = networks.values().find_map(Self::endpoint_ip) {
                return Ok(ip);
            }
        }

        settings
            .ip_address
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| RuntimeError::NoContainerIp(id.0.clone()))
    }

    async fn container_networks(&self, id: &ContainerId) -> Result<Vec<String>> {
        let info = self.client.inspect_container(&id.0, None).await?;
        let networks: Vec<String> = info
            .network_settings
            .and_then(|s| s.networks)
            .map(|nets| nets.keys().cloned().collect())
            .unwrap_or_default();

        if networks.is_empty() {
            return Err(RuntimeError::NoContainerNetwork(id.0.clone()));
        }
        Ok(networks)
    }

    async fn connect_network(&self, id: &ContainerId, network: &str) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: id.0.as_str(),
            endpoint_config: EndpointSettings::default(),
        };
        self.client.connect_network(network, options).await?;
        Ok(())
    }

    async fn disconnect_network(&self, id: &ContainerId, network: &str) -> Result<()> {
        let options = DisconnectNetworkOptions {
            container: id.0.as_str(),
            force: false,
        };
        self.client.disconnect_network(network, options).await?;
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(RuntimeError::ImageNotFound(error));
                    }
                    if let Some(status) = info.status {
                        tracing::debug!("{}", status);
                    }
                }
                Err(e) => return Err(RuntimeError::Runtime(e.to_string())),
            }
        }
        Ok(())
    }

    async fn build_from_uri(&self, remote: &str, tag: &str) -> Result<()> {
        let options = BuildImageOptions {
            remote: remote.to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    if let Some(error) = output.error {
                        return Err(RuntimeError::Build(error));
                    }
                    if let Some(line) = output.stream {
                        tracing::debug!("{}", line.trim());
                    }
                }
                Err(e) => return Err(RuntimeError::Build(e.to_string())),
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        spec: &RunSpec,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i64> {
        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| format!("{}:{}", m.source, m.target))
            .collect();

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.args.is_empty() {
                None
            } else {
                Some(spec.args.clone())
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        let id = created.id;

        self.client
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await?;

        // Stream output until the container exits
        let mut logs = self.client.logs(
            &id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(log) => output.write_all(&log.into_bytes()).await?,
                Err(e) => {
                    tracing::warn!("log stream ended early: {}", e);
                    break;
                }
            }
        }
        output.flush().await?;

        let mut wait = self
            .client
            .wait_container(&id, None::<WaitContainerOptions<String>>);
        let status = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                // Clean up before surfacing the wait failure
                let _ = self
                    .client
                    .remove_container(
                        &id,
                        Some(RemoveContainerOptions {
                            force: true,
                            v: true,
                            ..Default::default()
                        }),
                    )
                    .await;
                return Err(RuntimeError::Runtime(e.to_string()));
            }
            None => 0,
        };

        self.client
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;

        Ok(status)
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.client
            .remove_image(image, None::<RemoveImageOptions>, None)
            .await?;
        Ok(())
    }

    async fn logs_merged(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        services: &[ComposeService],
        opts: &LogOptions,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        let mut tasks = Vec::with_capacity(services.len());

        for service in services {
            let client = self.client.clone();
            let tx = tx.clone();
            let container = service.id.clone();
            let prefix = service.service.clone();
            let options = LogsOptions::<String> {
                follow: opts.follow,
                stdout: true,
                stderr: true,
                tail: opts.tail.clone().unwrap_or_else(|| "all".to_string()),
                since: opts.since.unwrap_or(0),
                until: opts.until.unwrap_or(0),
                timestamps: opts.timestamps,
            };

            tasks.push(tokio::spawn(async move {
                let mut stream = client.logs(&container, Some(options));
                let mut buffer = String::new();
                while let Some(chunk) = stream.next().await {
                    let data = match chunk {
                        Ok(log) => log.into_bytes(),
                        Err(e) => {
                            tracing::debug!("log stream for {} ended: {}", prefix, e);
                            break;
                        }
                    };
                    buffer.push_str(&String::from_utf8_lossy(&data));
                    for line in drain_lines(&mut buffer) {
                        if tx.send(format!("{}: {}\n", prefix, line)).await.is_err() {
                            return;
                        }
                    }
                }
                if !buffer.is_empty() {
                    let _ = tx.send(format!("{}: {}\n", prefix, buffer)).await;
                }
            }));
        }
        drop(tx);

        let cancelled = async move {
            while cancel.changed().await.is_ok() {
                if *cancel.borrow() {
                    return;
                }
            }
            // Sender gone without a cancel signal; never resolves
            std::future::pending::<()>().await
        };
        tokio::pin!(cancelled);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(line) => writer.write_all(line.as_bytes()).await?,
                    None => break,
                },
                _ = &mut cancelled => break,
            }
        }

        for task in tasks {
            task.abort();
        }
        writer.flush().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        Ok(())
    }
}

/// Pop every complete line out of the buffer, leaving any partial tail
fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let mut line: String = buffer.drain(..=pos).collect();
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
        lines.push(line);
    }
    lines
}
