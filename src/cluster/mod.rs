//! Kubernetes API access behind a mockable seam
//!
//! The drainer and reconciler talk to the cluster through [`ClusterApi`],
//! which narrows the client surface to the handful of operations they
//! need. Tests mock the trait; production wires in [`KubeClusterApi`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Narrow cluster API surface used by the controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch one node by name
    async fn get_node(&self, name: &str) -> Result<Node, Error>;

    /// Set or clear the node's unschedulable flag
    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<(), Error>;

    /// List every pod bound to the named node
    async fn pods_on_node(&self, name: &str) -> Result<Vec<Pod>, Error>;

    /// Submit an eviction for one pod with the given grace period
    ///
    /// The cluster answers 429 when a disruption budget refuses the
    /// eviction; that surfaces here as an API error carrying the code.
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<(), Error>;
}

/// Production [`ClusterApi`] backed by a kube client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_node(&self, name: &str) -> Result<Node, Error> {
        Ok(self.nodes().get(name).await?)
    }

    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<(), Error> {
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn pods_on_node(&self, name: &str) -> Result<Vec<Pod>, Error> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={name}")))
            .await?;
        Ok(list.items)
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<(), Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_period_seconds),
                ..Default::default()
            }),
            ..Default::default()
        };
        pods.evict(name, &params).await?;
        Ok(())
    }
}
