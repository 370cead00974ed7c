//! `cluster.x-k8s.io/v1beta1 Machine`: the control plane's record of a joined node

use crate::bootstrap::NodeTaint;
use crate::matrix::Role;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label tying a machine to its provisioning cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
/// JSON map of the custom labels the node registered with
pub const LABELS_ANNOTATION: &str = "rke.cattle.io/labels";
/// JSON list of the taints the node registered with
pub const TAINTS_ANNOTATION: &str = "rke.cattle.io/taints";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "cluster.x-k8s.io", version = "v1beta1", kind = "Machine")]
#[kube(namespaced)]
#[kube(status = "MachineStatus")]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub type_: String,
    pub address: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default)]
    pub addresses: Vec<MachineAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl Machine {
    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(role.label_key()))
            .is_some_and(|value| value == "true")
    }

    #[must_use]
    pub fn addresses(&self) -> &[MachineAddress] {
        self.status
            .as_ref()
            .map(|status| status.addresses.as_slice())
            .unwrap_or_default()
    }

    /// Decoded labels annotation; `None` when the annotation is absent or empty
    pub fn custom_labels(&self) -> Result<Option<BTreeMap<String, String>>, serde_json::Error> {
        self.annotation(LABELS_ANNOTATION)
            .map(serde_json::from_str)
            .transpose()
    }

    /// Decoded taints annotation; empty when the annotation is absent or empty
    pub fn node_taints(&self) -> Result<Vec<NodeTaint>, serde_json::Error> {
        self.annotation(TAINTS_ANNOTATION)
            .map_or_else(|| Ok(Vec::new()), serde_json::from_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::TaintEffect;
    use serde_json::json;

    fn machine(labels: serde_json::Value, annotations: serde_json::Value) -> Machine {
        serde_json::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": {
                "name": "custom-abc",
                "namespace": "fleet-default",
                "labels": labels,
                "annotations": annotations
            },
            "spec": {"clusterName": "test-cluster-abcde"},
            "status": {"addresses": [
                {"type": "InternalIP", "address": "10.42.0.12"},
                {"type": "Hostname", "address": "systemd-node-x7k2p"}
            ]}
        }))
        .unwrap()
    }

    #[test]
    fn test_role_labels() {
        let m = machine(
            json!({"rke.cattle.io/worker-role": "true", "rke.cattle.io/etcd-role": "false"}),
            json!({}),
        );
        assert!(m.has_role(Role::Worker));
        assert!(!m.has_role(Role::Etcd));
        assert!(!m.has_role(Role::ControlPlane));
        assert_eq!(m.addresses().len(), 2);
    }

    #[test]
    fn test_annotation_decoding() {
        let m = machine(
            json!({}),
            json!({
                LABELS_ANNOTATION: r#"{"cattle.io/os":"linux","foo":"bar"}"#,
                TAINTS_ANNOTATION: r#"[{"key":"key","value":"value","effect":"NoExecute"}]"#
            }),
        );
        let labels = m.custom_labels().unwrap().unwrap();
        assert_eq!(labels.get("foo").map(String::as_str), Some("bar"));
        assert_eq!(
            m.node_taints().unwrap(),
            vec![NodeTaint::new("key", "value", TaintEffect::NoExecute)]
        );
    }

    #[test]
    fn test_missing_or_empty_annotations() {
        let m = machine(json!({}), json!({TAINTS_ANNOTATION: ""}));
        assert!(m.custom_labels().unwrap().is_none());
        assert!(m.node_taints().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_labels_annotation_is_an_error() {
        let m = machine(json!({}), json!({LABELS_ANNOTATION: "not json"}));
        assert!(m.custom_labels().is_err());
    }
}
