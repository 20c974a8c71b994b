//! Container driver abstraction (C2).
//!
//! One capability trait, three backends: Docker/Podman (talked to over their
//! HTTP API via `docker-api`, not the CLI) and Kubernetes (via `kube`). The
//! factory in `bay-daemon` picks one at startup from `CONTAINER_DRIVER`;
//! everything above this module only ever sees [`ContainerDriver`].

pub mod docker;
pub mod kubernetes;
pub mod ports;
pub mod spec;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{BayConfig, DriverKind};
use docker::EndpointMode;

pub use spec::{validate_resource_spec, ResourceSpec};

/// Errors a driver call can surface. The service layer (C6) converts these
/// into `BayError`; drivers never retry internally.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("image pull failed: {0}")]
    ImagePullFailed(String),
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),
    #[error("invalid resource spec: {0}")]
    InvalidSpec(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

/// What `create` hands back: enough to reach the Ship and to stop it later.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub container_id: String,
    pub endpoint: String,
}

/// Backend-agnostic container lifecycle capability (§4.1).
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn create(&self, ship_id: &str, spec: &ResourceSpec) -> Result<ContainerInfo, DriverError>;

    async fn stop(&self, container_id: &str) -> Result<(), DriverError>;

    async fn data_exists(&self, ship_id: &str) -> Result<bool, DriverError>;

    async fn logs(&self, container_id: &str, tail: Option<u32>) -> Result<String, DriverError>;

    async fn is_running(&self, container_id: &str) -> Result<bool, DriverError>;
}

/// Builds the configured driver. The backend is an explicit configuration
/// choice (`CONTAINER_DRIVER`) rather than probed at startup.
pub async fn build_driver(config: &BayConfig) -> Result<Arc<dyn ContainerDriver>, DriverError> {
    let data_dir = PathBuf::from(&config.ship_data_dir);
    match config.container_driver {
        DriverKind::DockerAttached => Ok(Arc::new(docker::DockerDriver::new(
            "unix:///var/run/docker.sock",
            EndpointMode::Attached,
            config.docker_image.clone(),
            config.docker_network.clone(),
            config.ship_container_port,
            data_dir,
        )?)),
        DriverKind::DockerHostMapped => Ok(Arc::new(docker::DockerDriver::new(
            "unix:///var/run/docker.sock",
            EndpointMode::HostMapped,
            config.docker_image.clone(),
            config.docker_network.clone(),
            config.ship_container_port,
            data_dir,
        )?)),
        DriverKind::PodmanAttached => Ok(Arc::new(docker::DockerDriver::new(
            "unix:///run/podman/podman.sock",
            EndpointMode::Attached,
            config.docker_image.clone(),
            config.docker_network.clone(),
            config.ship_container_port,
            data_dir,
        )?)),
        DriverKind::PodmanHostMapped => Ok(Arc::new(docker::DockerDriver::new(
            "unix:///run/podman/podman.sock",
            EndpointMode::HostMapped,
            config.docker_image.clone(),
            config.docker_network.clone(),
            config.ship_container_port,
            data_dir,
        )?)),
        DriverKind::Kubernetes => {
            let client = match &config.kube.kubeconfig_path {
                Some(path) => {
                    let kubeconfig = kube::config::Kubeconfig::read_from(path).map_err(|e| {
                        DriverError::BackendUnreachable(format!("failed to read kubeconfig: {e}"))
                    })?;
                    let options = kube::config::KubeConfigOptions::default();
                    let conf = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                        .await
                        .map_err(|e| DriverError::BackendUnreachable(e.to_string()))?;
                    kube::Client::try_from(conf)
                        .map_err(|e| DriverError::BackendUnreachable(e.to_string()))?
                }
                None => kube::Client::try_default()
                    .await
                    .map_err(|e| DriverError::BackendUnreachable(e.to_string()))?,
            };
            Ok(Arc::new(kubernetes::KubernetesDriver::new(
                client,
                config.kube.namespace.clone(),
                config.docker_image.clone(),
                config.ship_container_port,
                config.kube.image_pull_policy.clone(),
                config.kube.pvc_size.clone(),
                config.kube.storage_class.clone(),
            )))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A fake driver for C6/C4/C5 unit tests that never touches a real
    /// daemon or container runtime.
    #[derive(Default)]
    pub struct FakeDriver {
        pub running: Mutex<std::collections::HashSet<String>>,
        pub data: Mutex<std::collections::HashSet<String>>,
        pub fail_create: Mutex<bool>,
        /// Endpoint handed back from `create`. Tests that need
        /// `wait_until_ready` to actually succeed point this at a real
        /// listener; left `None`, it falls back to a closed port.
        pub endpoint: Mutex<Option<String>>,
    }

    #[async_trait]
    impl ContainerDriver for FakeDriver {
        async fn create(&self, ship_id: &str, _spec: &ResourceSpec) -> Result<ContainerInfo, DriverError> {
            if *self.fail_create.lock().unwrap() {
                return Err(DriverError::BackendUnreachable("forced failure".into()));
            }
            let container_id = format!("fake-{ship_id}");
            self.running.lock().unwrap().insert(container_id.clone());
            self.data.lock().unwrap().insert(ship_id.to_string());
            let endpoint = self.endpoint.lock().unwrap().clone().unwrap_or_else(|| "127.0.0.1:9".into());
            Ok(ContainerInfo {
                container_id,
                endpoint,
            })
        }

        async fn stop(&self, container_id: &str) -> Result<(), DriverError> {
            self.running.lock().unwrap().remove(container_id);
            Ok(())
        }

        async fn data_exists(&self, ship_id: &str) -> Result<bool, DriverError> {
            Ok(self.data.lock().unwrap().contains(ship_id))
        }

        async fn logs(&self, _container_id: &str, _tail: Option<u32>) -> Result<String, DriverError> {
            Ok(String::new())
        }

        async fn is_running(&self, container_id: &str) -> Result<bool, DriverError> {
            Ok(self.running.lock().unwrap().contains(container_id))
        }
    }
}
