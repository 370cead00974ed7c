//! # Cluster Lifecycle Driver
//!
//! Submits provisioning clusters, resolves their join command and waits for
//! them to converge. Everything created here is deferred on the caller's
//! session.

use crate::config::HarnessConfig;
use crate::crds::cluster::CONDITION_UPDATED;
use crate::crds::machine::CLUSTER_NAME_LABEL;
use crate::crds::{
    delete_if_present, Cluster, ClusterRegistrationToken, ClusterSpec, Machine, MachineConfigRef,
    MachinePool, RkeConfig,
};
use crate::error::{HarnessError, Result};
use crate::matrix::NodeRoles;
use crate::session::Session;
use crate::wait::{wait_until, watch, WatchSelector};
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::Client;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Prefix of generated custom cluster names
pub const CUSTOM_CLUSTER_PREFIX: &str = "test-cluster-";

/// A cluster submitted by this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHandle {
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `status.ready`
#[must_use]
pub fn is_cluster_ready(cluster: &Cluster) -> bool {
    cluster.is_ready()
}

/// Ready, and the control plane has rolled out the desired spec
#[must_use]
pub fn is_provisioning_complete(cluster: &Cluster) -> bool {
    cluster.is_ready() && cluster.condition_is_true(CONDITION_UPDATED)
}

/// The management namespace has been assigned
#[must_use]
pub fn has_cluster_namespace(cluster: &Cluster) -> bool {
    cluster.management_namespace().is_some()
}

fn token_command(token: &ClusterRegistrationToken, insecure: bool) -> Option<&str> {
    token.status.as_ref()?.join_command(insecure)
}

/// Custom (bring-your-own-node) cluster: an RKE config without machine pools
#[must_use]
pub fn custom_cluster(name: &str, namespace: &str, kubernetes_version: Option<&str>) -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: ClusterSpec {
            kubernetes_version: kubernetes_version.map(str::to_string),
            cloud_credential_secret_name: None,
            rke_config: Some(RkeConfig::default()),
        },
        status: None,
    }
}

/// Node-driver cluster with the given pools and CNI
#[must_use]
pub fn node_driver_cluster(
    name: &str,
    namespace: &str,
    cni: &str,
    credential_secret_name: &str,
    kubernetes_version: &str,
    machine_pools: Vec<MachinePool>,
) -> Cluster {
    let machine_global_config =
        BTreeMap::from([("cni".to_string(), JsonValue::String(cni.to_string()))]);
    Cluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: ClusterSpec {
            kubernetes_version: Some(kubernetes_version.to_string()),
            cloud_credential_secret_name: Some(credential_secret_name.to_string()),
            rke_config: Some(RkeConfig {
                machine_global_config,
                machine_pools,
            }),
        },
        status: None,
    }
}

/// One pool per node entry, named `pool<i>`, each of quantity 1
#[must_use]
pub fn machine_pools(roles: &[NodeRoles], machine_config: &MachineConfigRef) -> Vec<MachinePool> {
    roles
        .iter()
        .enumerate()
        .map(|(i, roles)| MachinePool {
            name: format!("pool{i}"),
            control_plane_role: roles.controlplane,
            etcd_role: roles.etcd,
            worker_role: roles.worker,
            quantity: Some(1),
            machine_config_ref: machine_config.clone(),
        })
        .collect()
}

/// Drives provisioning clusters through the API as one identity
#[derive(Clone)]
pub struct ClusterDriver {
    client: Client,
    config: Arc<HarnessConfig>,
}

impl ClusterDriver {
    #[must_use]
    pub fn new(client: Client, config: Arc<HarnessConfig>) -> Self {
        Self { client, config }
    }

    fn clusters(&self, namespace: &str) -> Api<Cluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Submit `cluster` and defer its deletion.
    ///
    /// A rejection by the API server is returned immediately; nothing is
    /// deferred in that case.
    #[instrument(skip(self, session, cluster), fields(cluster = cluster.metadata.name.as_deref().unwrap_or_default()))]
    pub async fn create_cluster(&self, session: &Session, cluster: &Cluster) -> Result<ClusterHandle> {
        let namespace = cluster
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| self.config.namespace.clone());
        let requested = cluster.metadata.name.clone().unwrap_or_default();
        let api = self.clusters(&namespace);

        let created = api
            .create(&PostParams::default(), cluster)
            .await
            .map_err(|source| HarnessError::ClusterRejected {
                name: requested.clone(),
                source,
            })?;
        let name = created.metadata.name.unwrap_or(requested);
        info!(namespace = %namespace, name = %name, "Created provisioning cluster");

        let cleanup_name = name.clone();
        session.defer(format!("delete cluster {namespace}/{name}"), move || async move {
            delete_if_present(&api, &cleanup_name).await
        });

        Ok(ClusterHandle { name, namespace })
    }

    async fn wait_for(
        &self,
        handle: &ClusterHandle,
        timeout: Duration,
        predicate: fn(&Cluster) -> bool,
    ) -> Result<Cluster> {
        let stream = watch(
            self.clusters(&handle.namespace),
            &WatchSelector::name(&handle.name),
            timeout,
        );
        Ok(wait_until(stream, predicate).await?)
    }

    /// Block until the control plane assigns the management namespace
    #[instrument(skip(self), fields(cluster = %handle))]
    pub async fn wait_for_namespace(&self, handle: &ClusterHandle) -> Result<Cluster> {
        self.wait_for(handle, self.config.timeouts.namespace(), has_cluster_namespace)
            .await
    }

    /// Block until the cluster reports ready
    #[instrument(skip(self), fields(cluster = %handle))]
    pub async fn wait_for_create(&self, handle: &ClusterHandle) -> Result<Cluster> {
        self.wait_for(handle, self.config.timeouts.cluster_ready(), is_cluster_ready)
            .await
    }

    /// Block until the cluster is ready and fully rolled out
    #[instrument(skip(self), fields(cluster = %handle))]
    pub async fn wait_for_provisioning(&self, handle: &ClusterHandle) -> Result<Cluster> {
        self.wait_for(
            handle,
            self.config.timeouts.cluster_ready(),
            is_provisioning_complete,
        )
        .await
    }

    /// Node join command for a custom cluster.
    ///
    /// Reads the current state once; use `wait_for_join_command` while the
    /// control plane may still be rendering the registration token.
    #[instrument(skip(self), fields(cluster = %handle))]
    pub async fn join_command(&self, handle: &ClusterHandle) -> Result<String> {
        let cluster = self.clusters(&handle.namespace).get(&handle.name).await?;
        let management_ns =
            cluster
                .management_namespace()
                .ok_or_else(|| HarnessError::JoinCommandUnavailable {
                    cluster: handle.name.clone(),
                    reason: "status.clusterName is not assigned yet".to_string(),
                })?;

        let tokens: Api<ClusterRegistrationToken> =
            Api::namespaced(self.client.clone(), management_ns);
        let list = tokens.list(&ListParams::default()).await?;
        debug!(namespace = %management_ns, tokens = list.items.len(), "Listed registration tokens");

        list.items
            .iter()
            .find_map(|token| token_command(token, self.config.insecure_join))
            .map(str::to_string)
            .ok_or_else(|| HarnessError::JoinCommandUnavailable {
                cluster: handle.name.clone(),
                reason: format!("no registration token in {management_ns} carries a node command"),
            })
    }

    /// Block until the management namespace exists and one of its
    /// registration tokens carries a node command, then return that command
    #[instrument(skip(self), fields(cluster = %handle))]
    pub async fn wait_for_join_command(&self, handle: &ClusterHandle) -> Result<String> {
        let cluster = self.wait_for_namespace(handle).await?;
        let management_ns = cluster
            .management_namespace()
            .map(str::to_string)
            .ok_or_else(|| HarnessError::JoinCommandUnavailable {
                cluster: handle.name.clone(),
                reason: "status.clusterName is not assigned yet".to_string(),
            })?;

        let insecure = self.config.insecure_join;
        let tokens: Api<ClusterRegistrationToken> =
            Api::namespaced(self.client.clone(), &management_ns);
        let stream = watch(
            tokens,
            &WatchSelector::fields(format!("metadata.namespace={management_ns}")),
            self.config.timeouts.namespace(),
        );
        let token = wait_until(stream, |token: &ClusterRegistrationToken| {
            token_command(token, insecure).is_some()
        })
        .await?;

        token_command(&token, insecure)
            .map(str::to_string)
            .ok_or_else(|| HarnessError::JoinCommandUnavailable {
                cluster: handle.name.clone(),
                reason: format!("registration token in {management_ns} lost its node command"),
            })
    }

    /// Machine records belonging to the cluster
    pub async fn machines(&self, handle: &ClusterHandle) -> Result<Vec<Machine>> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), &handle.namespace);
        let params = ListParams::default().labels(&format!("{CLUSTER_NAME_LABEL}={}", handle.name));
        let machines = api.list(&params).await?.items;
        debug!(cluster = %handle, machines = machines.len(), "Listed machines");
        Ok(machines)
    }
}
