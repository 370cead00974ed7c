//! Node-driver providers.
//!
//! A provider contributes two things to a node-driver cluster: a cloud
//! credential, created once per suite run, and a machine config per cluster
//! describing the machines its pools create. Both are plain control-plane
//! objects; the harness never talks to the cloud itself.

use crate::config::{ConfigError, ProviderConfig};
use crate::crds::{delete_if_present, MachineConfigRef};
use crate::error::{HarnessError, Result};
use crate::session::Session;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DynamicObject, ObjectMeta, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, instrument};

/// Namespace cloud credentials live in
pub const CREDENTIAL_NAMESPACE: &str = "cattle-global-data";
pub const CREDENTIAL_SECRET_TYPE: &str = "provisioning.cattle.io/cloud-credential";
pub const CREDENTIAL_DRIVER_ANNOTATION: &str = "provisioning.cattle.io/driver";
pub const CREDENTIAL_GENERATE_NAME: &str = "cc-";

pub const MACHINE_CONFIG_GROUP: &str = "rke-machine-config.cattle.io";
pub const MACHINE_CONFIG_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    DigitalOcean,
    Aws,
    Harvester,
}

impl ProviderKind {
    /// Docker-machine driver name
    #[must_use]
    pub fn driver(self) -> &'static str {
        match self {
            Self::DigitalOcean => "digitalocean",
            Self::Aws => "amazonec2",
            Self::Harvester => "harvester",
        }
    }

    #[must_use]
    pub fn machine_config_kind(self) -> &'static str {
        match self {
            Self::DigitalOcean => "DigitaloceanConfig",
            Self::Aws => "Amazonec2Config",
            Self::Harvester => "HarvesterConfig",
        }
    }

    /// Prefix of generated cluster names
    #[must_use]
    pub fn cluster_prefix(self) -> &'static str {
        match self {
            Self::DigitalOcean => "automationdo-",
            Self::Aws => "automationaws-",
            Self::Harvester => "automationharvester-",
        }
    }

    /// Credential fields that must be configured
    #[must_use]
    pub fn required_credential_fields(self) -> &'static [&'static str] {
        match self {
            Self::DigitalOcean => &["accessToken"],
            Self::Aws => &["accessKey", "secretKey"],
            Self::Harvester => &["clusterId", "kubeconfigContent"],
        }
    }

    #[must_use]
    pub fn machine_config_resource(self) -> ApiResource {
        let kind = self.machine_config_kind();
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(MACHINE_CONFIG_GROUP, MACHINE_CONFIG_VERSION, kind),
            &format!("{}s", kind.to_ascii_lowercase()),
        )
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DigitalOcean => write!(f, "digitalocean"),
            Self::Aws => write!(f, "aws"),
            Self::Harvester => write!(f, "harvester"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "digitalocean" | "do" => Ok(Self::DigitalOcean),
            "aws" | "amazonec2" => Ok(Self::Aws),
            "harvester" => Ok(Self::Harvester),
            other => Err(ConfigError::Invalid(format!("unknown provider '{other}'"))),
        }
    }
}

/// Reference to a created cloud credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRef {
    pub namespace: String,
    pub name: String,
}

impl CredentialRef {
    /// `<namespace>:<name>`, the form `cloudCredentialSecretName` expects
    #[must_use]
    pub fn secret_name(&self) -> String {
        format!("{}:{}", self.namespace, self.name)
    }
}

/// Capability a node-driver provider offers the harness
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Create the cloud credential and defer its deletion on `session`
    async fn create_credential(&self, client: &Client, session: &Session) -> Result<CredentialRef>;

    /// Machine config object for one pool, not yet submitted
    fn new_machine_config(&self, pool_prefix: &str, namespace: &str) -> DynamicObject;
}

/// Provider driven entirely by configured credential and machine fields
#[derive(Debug, Clone)]
pub struct DriverProvider {
    kind: ProviderKind,
    credential: BTreeMap<String, String>,
    machine_config: BTreeMap<String, JsonValue>,
}

impl DriverProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let missing: Vec<&str> = config
            .kind
            .required_credential_fields()
            .iter()
            .copied()
            .filter(|field| {
                config
                    .credential
                    .get(*field)
                    .is_none_or(|value| value.trim().is_empty())
            })
            .collect();
        if !missing.is_empty() {
            return Err(HarnessError::Credential {
                provider: config.kind.to_string(),
                reason: format!("missing credential field(s): {}", missing.join(", ")),
            });
        }

        Ok(Self {
            kind: config.kind,
            credential: config.credential.clone(),
            machine_config: config.machine_config.clone(),
        })
    }

    /// Credential Secret as submitted, before the server assigns a name
    #[must_use]
    pub fn credential_secret(&self) -> Secret {
        let driver = self.kind.driver();
        let string_data = self
            .credential
            .iter()
            .map(|(field, value)| (format!("{driver}credentialConfig-{field}"), value.clone()))
            .collect();

        Secret {
            metadata: ObjectMeta {
                generate_name: Some(CREDENTIAL_GENERATE_NAME.to_string()),
                namespace: Some(CREDENTIAL_NAMESPACE.to_string()),
                annotations: Some(BTreeMap::from([(
                    CREDENTIAL_DRIVER_ANNOTATION.to_string(),
                    driver.to_string(),
                )])),
                ..Default::default()
            },
            type_: Some(CREDENTIAL_SECRET_TYPE.to_string()),
            string_data: Some(string_data),
            ..Default::default()
        }
    }
}

#[async_trait]
impl NodeProvider for DriverProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    #[instrument(skip(self, client, session), fields(provider = %self.kind))]
    async fn create_credential(&self, client: &Client, session: &Session) -> Result<CredentialRef> {
        let api: Api<Secret> = Api::namespaced(client.clone(), CREDENTIAL_NAMESPACE);
        let created = api
            .create(&PostParams::default(), &self.credential_secret())
            .await
            .map_err(|e| HarnessError::Credential {
                provider: self.kind.to_string(),
                reason: e.to_string(),
            })?;

        let name = created.metadata.name.ok_or(HarnessError::MissingField {
            kind: "Secret",
            name: CREDENTIAL_GENERATE_NAME.to_string(),
            field: "metadata.name",
        })?;
        info!(credential = %name, "Created cloud credential");

        let cleanup_name = name.clone();
        session.defer(format!("delete cloud credential {name}"), move || async move {
            delete_if_present(&api, &cleanup_name).await
        });

        Ok(CredentialRef {
            namespace: CREDENTIAL_NAMESPACE.to_string(),
            name,
        })
    }

    fn new_machine_config(&self, pool_prefix: &str, namespace: &str) -> DynamicObject {
        let resource = self.kind.machine_config_resource();
        let mut object = DynamicObject::new("", &resource)
            .within(namespace)
            .data(JsonValue::Object(
                self.machine_config
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Map<String, JsonValue>>(),
            ));
        object.metadata.name = None;
        object.metadata.generate_name = Some(pool_prefix.to_string());
        object
    }
}

/// Submit a machine config for `provider` and defer its deletion
pub async fn create_machine_config(
    client: &Client,
    session: &Session,
    provider: &dyn NodeProvider,
    pool_prefix: &str,
    namespace: &str,
) -> Result<MachineConfigRef> {
    let kind = provider.kind();
    let resource = kind.machine_config_resource();
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &resource);

    let created = api
        .create(&PostParams::default(), &provider.new_machine_config(pool_prefix, namespace))
        .await?;
    let name = created.metadata.name.ok_or(HarnessError::MissingField {
        kind: kind.machine_config_kind(),
        name: pool_prefix.to_string(),
        field: "metadata.name",
    })?;
    info!(provider = %kind, machine_config = %name, "Created machine config");

    let cleanup_name = name.clone();
    session.defer(format!("delete machine config {name}"), move || async move {
        delete_if_present(&api, &cleanup_name).await
    });

    Ok(MachineConfigRef {
        kind: kind.machine_config_kind().to_string(),
        name,
    })
}
