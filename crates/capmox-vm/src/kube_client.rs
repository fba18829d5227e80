//! Kubernetes object store used by the pipeline
//!
//! The pipeline mutates its scope in memory; the only writes it performs
//! itself are cluster status patches after a node location changed.
//! Persisting the ProxmoxMachine is left to the owning controller.

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use capmox_common::crd::{ProxmoxCluster, ProxmoxMachine, CLUSTER_NAME_LABEL};
use capmox_common::{Error, FIELD_MANAGER};

/// Trait abstracting Kubernetes client operations
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// List the ProxmoxMachines belonging to a cluster
    ///
    /// Always reads from the API server; callers rely on a fresh view.
    async fn list_proxmox_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<ProxmoxMachine>, Error>;

    /// Persist the status of a ProxmoxCluster
    async fn patch_cluster_status(&self, cluster: &ProxmoxCluster) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn list_proxmox_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<ProxmoxMachine>, Error> {
        let api: Api<ProxmoxMachine> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{CLUSTER_NAME_LABEL}={cluster_name}"));
        let machines = api.list(&params).await?;
        debug!(
            cluster = %cluster_name,
            count = machines.items.len(),
            "listed proxmox machines"
        );
        Ok(machines.items)
    }

    async fn patch_cluster_status(&self, cluster: &ProxmoxCluster) -> Result<(), Error> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::validation(format!("ProxmoxCluster {name} has no namespace")))?;

        let api: Api<ProxmoxCluster> = Api::namespaced(self.client.clone(), &namespace);
        let status_patch = serde_json::json!({
            "status": cluster.status
        });

        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }
}
