//! Standard (non-admin) user fixture.
//!
//! The user is a local management user bound to a global role. Cases run as
//! that user through Kubernetes impersonation of the admin connection, so no
//! password or token is ever issued.

use crate::crds::{delete_if_present, global_role_binding_resource, user_resource};
use crate::error::{HarnessError, Result};
use crate::naming::append_random_string;
use crate::session::Session;
use kube::api::{Api, DynamicObject, PostParams};
use kube::Client;
use serde_json::json;
use tracing::info;

pub const USER_GENERATE_NAME: &str = "u-";
pub const BINDING_GENERATE_NAME: &str = "grb-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardUser {
    /// Object name assigned by the server; the identity impersonated
    pub name: String,
    pub username: String,
}

#[must_use]
pub fn user_object(username: &str) -> DynamicObject {
    let mut user = DynamicObject::new("", &user_resource()).data(json!({
        "username": username,
        "displayName": username,
        "enabled": true
    }));
    user.metadata.name = None;
    user.metadata.generate_name = Some(USER_GENERATE_NAME.to_string());
    user
}

#[must_use]
pub fn global_role_binding(user_name: &str, global_role: &str) -> DynamicObject {
    let mut binding = DynamicObject::new("", &global_role_binding_resource()).data(json!({
        "globalRoleName": global_role,
        "userName": user_name
    }));
    binding.metadata.name = None;
    binding.metadata.generate_name = Some(BINDING_GENERATE_NAME.to_string());
    binding
}

async fn create_deferred(
    api: Api<DynamicObject>,
    session: &Session,
    object: &DynamicObject,
    what: &str,
) -> Result<String> {
    let created = api.create(&PostParams::default(), object).await?;
    let name = created.metadata.name.ok_or_else(|| HarnessError::Setup(format!("{what} was created without a name")))?;

    let cleanup_name = name.clone();
    session.defer(format!("delete {what} {name}"), move || async move {
        delete_if_present(&api, &cleanup_name).await
    });
    Ok(name)
}

/// Create a user bound to `global_role`; both objects are deferred on `session`
pub async fn create_standard_user(client: &Client, session: &Session, global_role: &str) -> Result<StandardUser> {
    let username = append_random_string("testuser");

    let users: Api<DynamicObject> = Api::all_with(client.clone(), &user_resource());
    let name = create_deferred(users, session, &user_object(&username), "user").await?;

    let bindings: Api<DynamicObject> = Api::all_with(client.clone(), &global_role_binding_resource());
    let binding = create_deferred(
        bindings,
        session,
        &global_role_binding(&name, global_role),
        "global role binding",
    )
    .await?;

    info!(user = %name, username = %username, binding = %binding, role = %global_role, "Created standard user");
    Ok(StandardUser { name, username })
}

/// Client acting as `user` over the connection described by `base`
pub fn impersonating_client(base: &kube::Config, user: &StandardUser) -> Result<Client> {
    let mut config = base.clone();
    config.auth_info.impersonate = Some(user.name.clone());
    config.auth_info.impersonate_groups = None;
    Ok(Client::try_from(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_object() {
        let user = user_object("testuserabcde");
        assert_eq!(user.metadata.name, None);
        assert_eq!(user.metadata.generate_name.as_deref(), Some("u-"));
        assert_eq!(user.types.as_ref().unwrap().kind, "User");
        assert_eq!(user.data["username"], "testuserabcde");
        assert_eq!(user.data["enabled"], true);
    }

    #[test]
    fn test_global_role_binding_object() {
        let binding = global_role_binding("u-x7k2p", "user");
        assert_eq!(binding.types.as_ref().unwrap().api_version, "management.cattle.io/v3");
        assert_eq!(binding.data["globalRoleName"], "user");
        assert_eq!(binding.data["userName"], "u-x7k2p");
    }
}
