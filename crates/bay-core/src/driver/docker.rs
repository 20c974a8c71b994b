//! Docker/Podman driver. Both talk to a Docker-API-compatible daemon over
//! HTTP (`docker-api`, not the CLI); Podman's socket is wire-compatible with
//! Docker's, so `DockerDriver` serves both, parameterized by socket URI and
//! [`EndpointMode`].

use std::path::PathBuf;

use async_trait::async_trait;
use docker_api::conn::TtyChunk;
use docker_api::opts::{ContainerCreateOpts, LogsOpts, PublishPort};
use docker_api::{Container, Containers, Docker};
use futures::TryStreamExt;

use super::{ports, ContainerDriver, ContainerInfo, DriverError, ResourceSpec};

/// Whether Bay reaches a Ship via the container's own network-namespace
/// address (Bay runs attached to the same Docker network) or via a host port
/// published out of the container (Bay runs on the host, outside Docker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    Attached,
    HostMapped,
}

pub struct DockerDriver {
    docker: Docker,
    containers: Containers,
    mode: EndpointMode,
    image: String,
    network: String,
    container_port: u16,
    data_dir: PathBuf,
}

impl DockerDriver {
    /// `socket_uri` is e.g. `unix:///var/run/docker.sock` for Docker or
    /// `unix:///run/podman/podman.sock` for Podman.
    pub fn new(
        socket_uri: &str,
        mode: EndpointMode,
        image: String,
        network: String,
        container_port: u16,
        data_dir: PathBuf,
    ) -> Result<Self, DriverError> {
        let docker = Docker::new(socket_uri)
            .map_err(|e| DriverError::BackendUnreachable(format!("invalid docker endpoint: {e}")))?;
        let containers = Containers::new(docker.clone());
        Ok(Self {
            docker,
            containers,
            mode,
            image,
            network,
            container_port,
            data_dir,
        })
    }

    fn ship_dirs(&self, ship_id: &str) -> (PathBuf, PathBuf) {
        let root = self.data_dir.join(ship_id);
        (root.join("home"), root.join("metadata"))
    }

    fn container_name(ship_id: &str) -> String {
        format!("bay-ship-{ship_id}")
    }

    async fn ensure_image(&self) -> Result<(), DriverError> {
        use docker_api::opts::PullOpts;
        use docker_api::Images;

        let images = Images::new(self.docker.clone());
        if images.get(&self.image).inspect().await.is_ok() {
            return Ok(());
        }
        let opts = PullOpts::builder().image(&self.image).build();
        let mut stream = images.pull(&opts);
        while let Some(progress) = stream
            .try_next()
            .await
            .map_err(|e| DriverError::ImagePullFailed(e.to_string()))?
        {
            tracing::trace!(?progress, image = %self.image, "pulling ship image");
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, ship_id: &str, spec: &ResourceSpec) -> Result<ContainerInfo, DriverError> {
        super::validate_resource_spec(spec, false)?;
        self.ensure_image().await?;

        let (home_dir, metadata_dir) = self.ship_dirs(ship_id);
        std::fs::create_dir_all(&home_dir)
            .map_err(|e| DriverError::BackendUnreachable(format!("failed to create ship volume: {e}")))?;
        std::fs::create_dir_all(&metadata_dir)
            .map_err(|e| DriverError::BackendUnreachable(format!("failed to create ship volume: {e}")))?;

        let volumes = vec![
            format!("{}:/home:rw", home_dir.display()),
            format!("{}:/app/metadata:rw", metadata_dir.display()),
        ];

        let mut builder = ContainerCreateOpts::builder()
            .image(&self.image)
            .name(Self::container_name(ship_id))
            .network_mode(&self.network)
            .cpus(spec.cpus)
            .volumes(volumes.iter().map(|s| s.as_str()).collect::<Vec<_>>());

        builder = match self.mode {
            EndpointMode::Attached => builder,
            EndpointMode::HostMapped => {
                let host_port = ports::allocate_ephemeral_port()?;
                builder.expose(PublishPort::tcp(self.container_port as u32), host_port as u32)
            }
        };

        let opts = builder.build();
        let container = self
            .containers
            .create(&opts)
            .await
            .map_err(|e| DriverError::BackendUnreachable(format!("create failed: {e}")))?;

        container
            .start()
            .await
            .map_err(|e| DriverError::BackendUnreachable(format!("start failed: {e}")))?;

        let endpoint = self.resolve_endpoint(&container, ship_id).await?;

        Ok(ContainerInfo {
            container_id: container.id().to_string(),
            endpoint,
        })
    }

    async fn stop(&self, container_id: &str) -> Result<(), DriverError> {
        let container = self.containers.get(container_id);
        // Best-effort: stop then remove; idempotent if already gone.
        let _ = container.stop(None).await;
        match container.delete().await {
            Ok(_) => Ok(()),
            Err(docker_api::Error::Fault { code, .. }) if code.as_u16() == 404 => Ok(()),
            Err(e) => Err(DriverError::BackendUnreachable(e.to_string())),
        }
    }

    async fn data_exists(&self, ship_id: &str) -> Result<bool, DriverError> {
        let (home_dir, _) = self.ship_dirs(ship_id);
        Ok(home_dir
            .read_dir()
            .map(|mut it| it.next().is_some())
            .unwrap_or(false))
    }

    async fn logs(&self, container_id: &str, tail: Option<u32>) -> Result<String, DriverError> {
        const MAX_TAIL: u32 = 10_000;
        let n_lines = tail.unwrap_or(1_000).min(MAX_TAIL) as usize;
        let opts = LogsOpts::builder()
            .stdout(true)
            .stderr(true)
            .n_lines(n_lines)
            .build();
        let container = self.containers.get(container_id);
        let mut stream = container.logs(&opts);
        let mut out = String::new();
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| DriverError::BackendUnreachable(e.to_string()))?
        {
            match chunk {
                TtyChunk::StdOut(bytes) | TtyChunk::StdErr(bytes) => {
                    out.push_str(&String::from_utf8_lossy(&bytes));
                }
                TtyChunk::StdIn(_) => {}
            }
        }
        Ok(out)
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, DriverError> {
        let container = self.containers.get(container_id);
        match container.inspect().await {
            Ok(info) => Ok(info
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(docker_api::Error::Fault { code, .. }) if code.as_u16() == 404 => {
                Err(DriverError::NotFound(container_id.to_string()))
            }
            Err(e) => Err(DriverError::BackendUnreachable(e.to_string())),
        }
    }
}

impl DockerDriver {
    async fn resolve_endpoint(
        &self,
        container: &Container,
        ship_id: &str,
    ) -> Result<String, DriverError> {
        let info = container
            .inspect()
            .await
            .map_err(|e| DriverError::BackendUnreachable(e.to_string()))?;

        match self.mode {
            EndpointMode::Attached => {
                let ip = info
                    .network_settings
                    .and_then(|ns| ns.networks)
                    .and_then(|nets| nets.get(&self.network).cloned())
                    .and_then(|net| net.ip_address)
                    .filter(|ip| !ip.is_empty())
                    .ok_or_else(|| {
                        DriverError::BackendUnreachable(format!(
                            "container for ship {ship_id} has no address on network {}",
                            self.network
                        ))
                    })?;
                Ok(format!("{ip}:{}", self.container_port))
            }
            EndpointMode::HostMapped => {
                let bindings = info
                    .network_settings
                    .and_then(|ns| ns.ports)
                    .ok_or_else(|| {
                        DriverError::BackendUnreachable("no port bindings reported".into())
                    })?;
                let key = format!("{}/tcp", self.container_port);
                let host_port = bindings
                    .get(&key)
                    .and_then(|b| b.as_ref())
                    .and_then(|b| b.first())
                    .and_then(|b| b.host_port.clone())
                    .ok_or_else(|| {
                        DriverError::BackendUnreachable(format!(
                            "no host port bound for ship {ship_id}"
                        ))
                    })?;
                Ok(format!("127.0.0.1:{host_port}"))
            }
        }
    }
}
