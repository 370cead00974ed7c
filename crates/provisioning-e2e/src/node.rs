//! # Simulated Node Agent Launcher
//!
//! A simulated node is a privileged systemd container that boots with
//! cloud-init, runs the bootstrap script from its `user-data` and so joins
//! the cluster exactly like a real host would. The launcher never looks at
//! the script's flags.

use crate::crds::delete_if_present;
use crate::error::{HarnessError, Result};
use crate::session::Session;
use futures::future::join_all;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

pub const USER_DATA_KEY: &str = "user-data";
pub const META_DATA_KEY: &str = "meta-data";
pub const SECRET_GENERATE_NAME: &str = "systemd-node-data-";
pub const POD_GENERATE_NAME: &str = "systemd-node-";
/// cloud-init NoCloud seed directory inside the node
pub const SEED_DIR: &str = "/var/lib/cloud/seed/nocloud";
pub const NODE_LABEL: &str = "provisioning-e2e/systemd-node";

/// A launched node: its seed Secret and Pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHandle {
    pub pod_name: String,
    pub secret_name: String,
    pub namespace: String,
}

/// Secret carrying the bootstrap script as cloud-init user-data
#[must_use]
pub fn user_data_secret(namespace: &str, script: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            generate_name: Some(SECRET_GENERATE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([
            (USER_DATA_KEY.to_string(), script.to_string()),
            (META_DATA_KEY.to_string(), String::new()),
        ])),
        ..Default::default()
    }
}

/// Privileged systemd Pod booting from the seed Secret
pub fn node_pod(namespace: &str, image: &str, secret_name: &str) -> Result<Pod> {
    let volumes = json!([
        {"name": "seed", "secret": {"secretName": secret_name}},
        {"name": "rancher", "emptyDir": {}},
        {"name": "kubelet", "emptyDir": {}},
        {"name": "etc-rancher", "emptyDir": {}},
        {"name": "modules", "hostPath": {"path": "/lib/modules"}}
    ]);
    let volume_mounts = json!([
        {"name": "seed", "mountPath": SEED_DIR},
        {"name": "rancher", "mountPath": "/var/lib/rancher"},
        {"name": "kubelet", "mountPath": "/var/lib/kubelet"},
        {"name": "etc-rancher", "mountPath": "/etc/rancher"},
        {"name": "modules", "mountPath": "/lib/modules", "readOnly": true}
    ]);

    let pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "generateName": POD_GENERATE_NAME,
            "namespace": namespace,
            "labels": {NODE_LABEL: "true"}
        },
        "spec": {
            "automountServiceAccountToken": false,
            "restartPolicy": "Never",
            "containers": [{
                "name": "node",
                "image": image,
                "securityContext": {"privileged": true},
                "volumeMounts": volume_mounts
            }],
            "volumes": volumes
        }
    });

    Ok(serde_json::from_value(pod)?)
}

/// Starts simulated nodes in a cluster's namespace
#[derive(Clone)]
pub struct NodeLauncher {
    client: Client,
    image: String,
}

impl NodeLauncher {
    #[must_use]
    pub fn new(client: Client, image: impl Into<String>) -> Self {
        Self {
            client,
            image: image.into(),
        }
    }

    /// Create the seed Secret and node Pod, deferring deletion of both.
    ///
    /// The Secret's deletion is registered first so the Pod goes away before it.
    #[instrument(skip(self, session, script))]
    pub async fn launch(&self, session: &Session, namespace: &str, script: &str) -> Result<AgentHandle> {
        let launch_error = |reason: String| HarnessError::Launch {
            namespace: namespace.to_string(),
            reason,
        };

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets
            .create(&PostParams::default(), &user_data_secret(namespace, script))
            .await
            .map_err(|e| launch_error(format!("user-data secret: {e}")))?;
        let secret_name = secret
            .metadata
            .name
            .ok_or_else(|| launch_error("user-data secret has no name".to_string()))?;

        let cleanup_name = secret_name.clone();
        session.defer(format!("delete secret {namespace}/{secret_name}"), move || async move {
            delete_if_present(&secrets, &cleanup_name).await
        });

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods
            .create(&PostParams::default(), &node_pod(namespace, &self.image, &secret_name)?)
            .await
            .map_err(|e| launch_error(format!("node pod: {e}")))?;
        let pod_name = pod
            .metadata
            .name
            .ok_or_else(|| launch_error("node pod has no name".to_string()))?;

        let cleanup_name = pod_name.clone();
        session.defer(format!("delete pod {namespace}/{pod_name}"), move || async move {
            delete_if_present(&pods, &cleanup_name).await
        });

        info!(pod = %pod_name, secret = %secret_name, "Launched simulated node");
        Ok(AgentHandle {
            pod_name,
            secret_name,
            namespace: namespace.to_string(),
        })
    }

    /// Launch one node per script concurrently; results are independent and
    /// keep the order of `scripts`
    pub async fn launch_all(
        &self,
        session: &Session,
        namespace: &str,
        scripts: &[String],
    ) -> Vec<Result<AgentHandle>> {
        let results = join_all(
            scripts
                .iter()
                .map(|script| self.launch(session, namespace, script)),
        )
        .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(namespace = %namespace, failed, total = results.len(), "Some node launches failed");
        }
        results
    }
}
