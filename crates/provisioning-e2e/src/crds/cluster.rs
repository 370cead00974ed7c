//! `provisioning.cattle.io/v1 Cluster`, trimmed to the fields the harness uses

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Condition type set once the control plane has rolled out the desired spec
pub const CONDITION_UPDATED: &str = "Updated";
pub const CONDITION_READY: &str = "Ready";

/// Reference from a machine pool to its driver-specific machine config
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct MachineConfigRef {
    pub kind: String,
    pub name: String,
}

/// One machine pool of a node-driver cluster
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachinePool {
    pub name: String,
    #[serde(default)]
    pub control_plane_role: bool,
    #[serde(default)]
    pub etcd_role: bool,
    #[serde(default)]
    pub worker_role: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i32>,
    pub machine_config_ref: MachineConfigRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RkeConfig {
    /// Free-form settings shared by every machine (`cni`, `profile`, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machine_global_config: BTreeMap<String, Value>,

    /// Empty for custom clusters, where nodes register themselves
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_pools: Vec<MachinePool>,
}

/// Provisioning cluster desired state
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "provisioning.cattle.io", version = "v1", kind = "Cluster")]
#[kube(namespaced)]
#[kube(status = "ClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// `<namespace>:<secret>` of the cloud credential, node-driver clusters only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_credential_secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rke_config: Option<RkeConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub ready: bool,

    /// Name of the management cluster, which is also the namespace holding
    /// its registration tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Cluster {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|status| status.ready)
    }

    #[must_use]
    pub fn condition(&self, type_: &str) -> Option<&ClusterCondition> {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.iter().find(|c| c.type_ == type_))
    }

    #[must_use]
    pub fn condition_is_true(&self, type_: &str) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status.eq_ignore_ascii_case("true"))
    }

    /// Management cluster namespace, once the control plane has assigned one
    #[must_use]
    pub fn management_namespace(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.cluster_name.as_deref())
            .filter(|name| !name.is_empty())
    }
}
