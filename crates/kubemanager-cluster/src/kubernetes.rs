//! `kube`-backed cluster provisioner.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ResourceQuota, ResourceQuotaSpec, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams};
use kubemanager_core::naming::QUOTA_OBJECT_NAME;
use kubemanager_core::quantity;
use tracing::{debug, info};

use crate::ClusterProvisioner;
use crate::error::{ClusterError, ClusterResult};
use crate::types::{NamespaceInfo, NamespaceSpec, NamespaceUsage, QuotaSpec};

/// Talks to the API server with a `kube::Client`.
#[derive(Clone)]
pub struct KubeProvisioner {
    client: Client,
}

impl KubeProvisioner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster service account or the local kubeconfig.
    pub async fn try_default() -> ClusterResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Config(format!("failed to create kubernetes client: {e}")))?;
        Ok(Self::new(client))
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }
}

fn quota_hard(quota: &QuotaSpec) -> ClusterResult<BTreeMap<String, Quantity>> {
    quantity::cpu_millis(&quota.cpu).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    quantity::bytes(&quota.memory).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    Ok([
        ("requests.cpu", &quota.cpu),
        ("requests.memory", &quota.memory),
        ("limits.cpu", &quota.cpu),
        ("limits.memory", &quota.memory),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), Quantity(value.clone())))
    .collect())
}

#[async_trait]
impl ClusterProvisioner for KubeProvisioner {
    async fn create_namespace(&self, spec: &NamespaceSpec) -> ClusterResult<()> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                labels: Some(spec.labels.clone()),
                annotations: Some(spec.annotations.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        match self.namespaces().create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %spec.name, "namespace created");
                Ok(())
            }
            Err(e) => match ClusterError::from(e) {
                ClusterError::AlreadyExists(_) => {
                    debug!(namespace = %spec.name, "namespace already exists");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<NamespaceInfo>> {
        let ns = self.namespaces().get_opt(name).await?;
        Ok(ns.map(|ns| NamespaceInfo {
            name: ns.metadata.name.unwrap_or_else(|| name.to_string()),
            phase: ns.status.and_then(|s| s.phase),
            labels: ns.metadata.labels.unwrap_or_default(),
        }))
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        match self.namespaces().delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = %name, "namespace deletion requested");
                Ok(())
            }
            Err(e) => match ClusterError::from(e) {
                ClusterError::NotFound(_) => {
                    debug!(namespace = %name, "namespace already gone");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn reconcile_quota(&self, namespace: &str, quota: &QuotaSpec) -> ClusterResult<()> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        let mut desired = ResourceQuota {
            metadata: ObjectMeta {
                name: Some(QUOTA_OBJECT_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(ResourceQuotaSpec {
                hard: Some(quota_hard(quota)?),
                ..Default::default()
            }),
            ..Default::default()
        };

        match api.get_opt(QUOTA_OBJECT_NAME).await? {
            Some(existing) => {
                desired.metadata.resource_version = existing.metadata.resource_version;
                api.replace(QUOTA_OBJECT_NAME, &PostParams::default(), &desired)
                    .await
                    .map_err(ClusterError::upsert)?;
                debug!(%namespace, cpu = %quota.cpu, memory = %quota.memory, "quota updated");
            }
            None => {
                api.create(&PostParams::default(), &desired)
                    .await
                    .map_err(ClusterError::upsert)?;
                debug!(%namespace, cpu = %quota.cpu, memory = %quota.memory, "quota created");
            }
        }
        Ok(())
    }

    async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let mut desired = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(data.clone()),
            ..Default::default()
        };

        match api.get_opt(name).await? {
            Some(existing) => {
                desired.metadata.resource_version = existing.metadata.resource_version;
                api.replace(name, &PostParams::default(), &desired)
                    .await
                    .map_err(ClusterError::upsert)?;
            }
            None => {
                api.create(&PostParams::default(), &desired)
                    .await
                    .map_err(ClusterError::upsert)?;
            }
        }
        debug!(%namespace, secret = %name, keys = data.len(), "secret applied");
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match ClusterError::from(e) {
                ClusterError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn namespace_usage(&self, namespace: &str) -> ClusterResult<NamespaceUsage> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &resource);
        let pods = api.list(&ListParams::default()).await?;

        let mut usage = NamespaceUsage::default();
        for pod in &pods.items {
            let containers = pod
                .data
                .get("containers")
                .and_then(serde_json::Value::as_array)
                .into_iter()
                .flatten();
            for container in containers {
                if let Some(cpu) = container.pointer("/usage/cpu").and_then(|v| v.as_str()) {
                    usage.cpu_milli += quantity::cpu_millis(cpu)
                        .map_err(|e| ClusterError::Invalid(e.to_string()))?;
                }
                if let Some(memory) = container.pointer("/usage/memory").and_then(|v| v.as_str()) {
                    usage.memory_bytes +=
                        quantity::bytes(memory).map_err(|e| ClusterError::Invalid(e.to_string()))?;
                }
            }
        }
        debug!(%namespace, pods = pods.items.len(), cpu_milli = usage.cpu_milli, "namespace usage collected");
        Ok(usage)
    }
}
