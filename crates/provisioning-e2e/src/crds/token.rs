//! `management.cattle.io/v3 ClusterRegistrationToken`

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "ClusterRegistrationToken"
)]
#[kube(namespaced)]
#[kube(status = "ClusterRegistrationTokenStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenSpec {
    #[serde(default)]
    pub cluster_name: String,
}

/// Join commands rendered by the control plane for this token
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenStatus {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub node_command: String,
    /// Same as `node_command` but skips CA verification
    #[serde(default)]
    pub insecure_node_command: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub insecure_command: String,
    #[serde(default)]
    pub manifest_url: String,
}

impl ClusterRegistrationTokenStatus {
    /// The node join command, or `None` while it has not been rendered yet
    #[must_use]
    pub fn join_command(&self, insecure: bool) -> Option<&str> {
        let command = if insecure {
            &self.insecure_node_command
        } else {
            &self.node_command
        };
        Some(command.trim()).filter(|c| !c.is_empty())
    }
}
