//! Kubernetes driver: one Pod + headless Service + PersistentVolumeClaim per
//! Ship, keyed by `ship_id`. No example repo in the retrieved set talks to
//! Kubernetes directly; the crate choice (`kube` + `k8s-openapi`) is grounded
//! in the reference manifest for a Kubernetes-native agent platform that
//! shipped with the retrieval pack.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod, PodSpec,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;

use super::spec::parse_memory;
use super::{ContainerDriver, ContainerInfo, DriverError, ResourceSpec};

pub struct KubernetesDriver {
    client: Client,
    namespace: String,
    image: String,
    container_port: u16,
    image_pull_policy: String,
    pvc_size: String,
    storage_class: Option<String>,
}

impl KubernetesDriver {
    pub fn new(
        client: Client,
        namespace: String,
        image: String,
        container_port: u16,
        image_pull_policy: String,
        pvc_size: String,
        storage_class: Option<String>,
    ) -> Self {
        Self {
            client,
            namespace,
            image,
            container_port,
            image_pull_policy,
            pvc_size,
            storage_class,
        }
    }

    fn labels(ship_id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), "bay-ship".to_string()),
            ("ship-id".to_string(), ship_id.to_string()),
        ])
    }

    fn pod_name(ship_id: &str) -> String {
        format!("bay-ship-{ship_id}")
    }

    fn pvc_name(ship_id: &str) -> String {
        format!("bay-ship-{ship_id}-data")
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn ensure_pvc(&self, ship_id: &str, spec: &ResourceSpec) -> Result<(), DriverError> {
        let pvcs = self.pvcs();
        let name = Self::pvc_name(ship_id);
        if pvcs.get_opt(&name).await.map_err(map_kube_err)?.is_some() {
            return Ok(());
        }

        let size = spec.disk.clone().unwrap_or_else(|| self.pvc_size.clone());
        // Validate against the Kubernetes memory-unit rule too: disk sizes
        // share the same `Mi`/`Gi` convention on this backend.
        parse_memory(&size, true)?;

        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(Self::labels(ship_id)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: self.storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        pvcs.create(&PostParams::default(), &pvc)
            .await
            .map_err(map_kube_err)?;
        Ok(())
    }

    async fn ensure_service(&self, ship_id: &str) -> Result<(), DriverError> {
        let services = self.services();
        let name = Self::pod_name(ship_id);
        if services.get_opt(&name).await.map_err(map_kube_err)?.is_some() {
            return Ok(());
        }

        let svc = Service {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(Self::labels(ship_id)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(Self::labels(ship_id)),
                ports: Some(vec![ServicePort {
                    port: self.container_port as i32,
                    target_port: Some(
                        k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(
                            self.container_port as i32,
                        ),
                    ),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        services
            .create(&PostParams::default(), &svc)
            .await
            .map_err(map_kube_err)?;
        Ok(())
    }
}

#[async_trait]
impl ContainerDriver for KubernetesDriver {
    async fn create(&self, ship_id: &str, spec: &ResourceSpec) -> Result<ContainerInfo, DriverError> {
        let mem = super::validate_resource_spec(spec, true)?;
        self.ensure_pvc(ship_id, spec).await?;
        self.ensure_service(ship_id).await?;

        let pods = self.pods();
        let name = Self::pod_name(ship_id);

        let limits = BTreeMap::from([
            ("cpu".to_string(), Quantity(format!("{}", spec.cpus))),
            ("memory".to_string(), Quantity(mem.as_kube_quantity())),
        ]);

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(Self::labels(ship_id)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "ship".to_string(),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some(self.image_pull_policy.clone()),
                    ports: Some(vec![ContainerPort {
                        container_port: self.container_port as i32,
                        ..Default::default()
                    }]),
                    resources: Some(ResourceRequirements {
                        limits: Some(limits),
                        ..Default::default()
                    }),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "ship-data".to_string(),
                        mount_path: "/home".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "ship-data".to_string(),
                    persistent_volume_claim: Some(
                        k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                            claim_name: Self::pvc_name(ship_id),
                            ..Default::default()
                        },
                    ),
                    ..Default::default()
                }]),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        pods.create(&PostParams::default(), &pod)
            .await
            .map_err(map_kube_err)?;

        let pod_ip = wait_for_pod_ip(&pods, &name).await?;

        Ok(ContainerInfo {
            container_id: name,
            endpoint: format!("{pod_ip}:{}", self.container_port),
        })
    }

    async fn stop(&self, container_id: &str) -> Result<(), DriverError> {
        match self
            .pods()
            .delete(container_id, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(map_kube_err(e)),
        }
    }

    async fn data_exists(&self, ship_id: &str) -> Result<bool, DriverError> {
        let name = Self::pvc_name(ship_id);
        Ok(self.pvcs().get_opt(&name).await.map_err(map_kube_err)?.is_some())
    }

    async fn logs(&self, container_id: &str, tail: Option<u32>) -> Result<String, DriverError> {
        use kube::api::LogParams;
        const MAX_TAIL: i64 = 10_000;
        let tail_lines = tail.map(|t| (t as i64).min(MAX_TAIL));
        self.pods()
            .logs(
                container_id,
                &LogParams {
                    tail_lines,
                    ..Default::default()
                },
            )
            .await
            .map_err(map_kube_err)
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, DriverError> {
        let pod = self
            .pods()
            .get_opt(container_id)
            .await
            .map_err(map_kube_err)?
            .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
        Ok(pod
            .status
            .and_then(|s| s.phase)
            .map(|phase| phase == "Running")
            .unwrap_or(false))
    }
}

async fn wait_for_pod_ip(pods: &Api<Pod>, name: &str) -> Result<String, DriverError> {
    const MAX_ATTEMPTS: u32 = 150;
    for _ in 0..MAX_ATTEMPTS {
        let pod = pods.get(name).await.map_err(map_kube_err)?;
        if let Some(ip) = pod.status.and_then(|s| s.pod_ip) {
            return Ok(ip);
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
    Err(DriverError::Timeout(format!(
        "pod {name} never received an IP"
    )))
}

fn map_kube_err(e: kube::Error) -> DriverError {
    match &e {
        kube::Error::Api(resp) if resp.code == 404 => DriverError::NotFound(resp.message.clone()),
        _ => DriverError::BackendUnreachable(e.to_string()),
    }
}
