//! Resource types the harness reads and writes on the control plane.
//!
//! Types with a spec/status layout are typed with `CustomResource`; the flat
//! management objects (users, role bindings, settings) go through
//! `DynamicObject` with the `ApiResource`s below.

pub mod cluster;
pub mod machine;
pub mod token;

pub use cluster::{
    Cluster, ClusterCondition, ClusterSpec, ClusterStatus, MachineConfigRef, MachinePool, RkeConfig,
};
pub use machine::{Machine, MachineAddress, MachineSpec, MachineStatus};
pub use token::{ClusterRegistrationToken, ClusterRegistrationTokenSpec, ClusterRegistrationTokenStatus};

use kube::api::{Api, DeleteParams};
use kube::core::{ApiResource, GroupVersionKind};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

pub const MANAGEMENT_GROUP: &str = "management.cattle.io";
pub const MANAGEMENT_VERSION: &str = "v3";

/// `management.cattle.io/v3 User` (cluster scoped)
#[must_use]
pub fn user_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(MANAGEMENT_GROUP, MANAGEMENT_VERSION, "User"),
        "users",
    )
}

/// `management.cattle.io/v3 GlobalRoleBinding` (cluster scoped)
#[must_use]
pub fn global_role_binding_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(MANAGEMENT_GROUP, MANAGEMENT_VERSION, "GlobalRoleBinding"),
        "globalrolebindings",
    )
}

/// `management.cattle.io/v3 Setting` (cluster scoped)
#[must_use]
pub fn setting_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(MANAGEMENT_GROUP, MANAGEMENT_VERSION, "Setting"),
        "settings",
    )
}

/// Delete `name`, treating an already missing object as success.
pub(crate) async fn delete_if_present<K>(api: &Api<K>, name: &str) -> anyhow::Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => {
            debug!(name = %name, "Object already gone");
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("failed to delete {name}"))),
    }
}
