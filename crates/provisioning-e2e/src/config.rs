//! Harness Configuration
//!
//! Loaded from a YAML file, then overlaid with a small set of environment
//! variables and validated before any resource is created.

use crate::matrix::NodeRoles;
use crate::provider::ProviderKind;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "PROVISIONING_E2E_CONFIG";
/// Distribution discriminator; `rke2` gates out some topologies
pub const DIST_ENV: &str = "DIST";
/// Expected value of the `system-agent-version` setting
pub const AGENT_VERSION_ENV: &str = "CATTLE_SYSTEM_AGENT_VERSION";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Kubernetes distribution under test
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Rke2,
    K3s,
    #[default]
    Unspecified,
}

impl FromStr for Distribution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rke2" => Ok(Self::Rke2),
            "k3s" => Ok(Self::K3s),
            "" => Ok(Self::Unspecified),
            other => Err(ConfigError::Invalid(format!(
                "unknown distribution '{other}', expected rke2 or k3s"
            ))),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rke2 => write!(f, "rke2"),
            Self::K3s => write!(f, "k3s"),
            Self::Unspecified => write!(f, "unspecified"),
        }
    }
}

/// Wait deadlines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Deadline for a cluster to report ready / provisioned
    #[serde(default = "default_cluster_ready_seconds")]
    pub cluster_ready_seconds: u64,

    /// Deadline for the management namespace to be assigned
    #[serde(default = "default_namespace_seconds")]
    pub namespace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            cluster_ready_seconds: default_cluster_ready_seconds(),
            namespace_seconds: default_namespace_seconds(),
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn cluster_ready(&self) -> Duration {
        Duration::from_secs(self.cluster_ready_seconds)
    }

    #[must_use]
    pub fn namespace(&self) -> Duration {
        Duration::from_secs(self.namespace_seconds)
    }
}

fn default_cluster_ready_seconds() -> u64 {
    1800 // 30 minutes
}

fn default_namespace_seconds() -> u64 {
    300
}

/// Standard (non-admin) user created at suite setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardUserConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Global role bound to the user
    #[serde(default = "default_global_role")]
    pub global_role: String,
}

impl Default for StandardUserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_role: default_global_role(),
        }
    }
}

fn default_global_role() -> String {
    "user".to_string()
}

/// One node-driver provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    /// Driver credential fields, e.g. `accessToken` for DigitalOcean
    #[serde(default)]
    pub credential: BTreeMap<String, String>,

    /// Driver machine config fields, e.g. `region`, `size`, `image`
    #[serde(default)]
    pub machine_config: BTreeMap<String, JsonValue>,
}

/// Top-level harness configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarnessConfig {
    /// Namespace provisioning clusters are created in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub kubernetes_versions: Vec<String>,

    #[serde(default)]
    pub cnis: Vec<String>,

    /// Externally supplied topology; empty means the dynamic suite is skipped
    #[serde(default)]
    pub nodes_and_roles: Vec<NodeRoles>,

    /// Version used by the custom-cluster topologies
    #[serde(default)]
    pub default_kubernetes_version: Option<String>,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Image of the simulated systemd node
    #[serde(default = "default_node_image")]
    pub node_image: String,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Maximum number of cases running at once
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Use the join command that skips CA verification
    #[serde(default = "default_true")]
    pub insecure_join: bool,

    #[serde(default)]
    pub standard_user: StandardUserConfig,

    #[serde(default)]
    pub distribution: Distribution,

    #[serde(default)]
    pub expected_agent_version: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            kubernetes_versions: Vec::new(),
            cnis: Vec::new(),
            nodes_and_roles: Vec::new(),
            default_kubernetes_version: None,
            providers: Vec::new(),
            node_image: default_node_image(),
            timeouts: TimeoutConfig::default(),
            parallelism: default_parallelism(),
            insecure_join: true,
            standard_user: StandardUserConfig::default(),
            distribution: Distribution::default(),
            expected_agent_version: None,
        }
    }
}

fn default_namespace() -> String {
    "fleet-default".to_string()
}

fn default_node_image() -> String {
    "rancher/systemd-node:latest".to_string()
}

fn default_parallelism() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl HarnessConfig {
    /// Parse configuration from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a file on disk
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Read harness config");
        Self::from_yaml(&text)
    }

    /// Overlay values from the environment. `lookup` returns `None` for unset keys.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dist) = lookup(DIST_ENV) {
            self.distribution = dist.parse()?;
        }
        if let Some(version) = lookup(AGENT_VERSION_ENV).filter(|v| !v.trim().is_empty()) {
            self.expected_agent_version = Some(version.trim().to_string());
        }
        Ok(())
    }

    /// Resolve, parse, overlay and validate.
    ///
    /// The path comes from `path`, then `PROVISIONING_E2E_CONFIG`; with neither
    /// set the defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => {
                info!("No config file given, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".to_string()));
        }
        if self.node_image.trim().is_empty() {
            return Err(ConfigError::Invalid("nodeImage must not be empty".to_string()));
        }
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid("parallelism must be at least 1".to_string()));
        }
        if self.timeouts.cluster_ready_seconds == 0 || self.timeouts.namespace_seconds == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        if self.kubernetes_versions.iter().any(|v| v.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "kubernetesVersions must not contain empty entries".to_string(),
            ));
        }
        if self.cnis.iter().any(|c| c.trim().is_empty()) {
            return Err(ConfigError::Invalid("cnis must not contain empty entries".to_string()));
        }
        let mut seen = Vec::new();
        for provider in &self.providers {
            if seen.contains(&provider.kind) {
                return Err(ConfigError::Invalid(format!(
                    "provider {} is configured more than once",
                    provider.kind
                )));
            }
            seen.push(provider.kind);
        }
        Ok(())
    }

    /// Settings for `kind`, if configured
    #[must_use]
    pub fn provider(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.kind == kind)
    }

    /// Kubernetes version for custom clusters: the explicit default, else the
    /// first matrix version
    #[must_use]
    pub fn custom_kubernetes_version(&self) -> Option<&str> {
        self.default_kubernetes_version
            .as_deref()
            .or_else(|| self.kubernetes_versions.first().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    const SAMPLE: &str = r"
kubernetesVersions: [v1.30.4+rke2r1, v1.29.8+rke2r1]
cnis: [calico]
nodesAndRoles:
  - {controlplane: true, etcd: true}
  - {worker: true}
providers:
  - kind: digitalocean
    credential: {accessToken: tok}
    machineConfig: {region: nyc3, size: s-2vcpu-4gb}
timeouts:
  clusterReadySeconds: 900
parallelism: 2
";

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = HarnessConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.namespace, "fleet-default");
        assert_eq!(config.kubernetes_versions.len(), 2);
        assert_eq!(config.nodes_and_roles[1], NodeRoles::WORKER);
        assert_eq!(config.timeouts.cluster_ready_seconds, 900);
        assert_eq!(config.timeouts.namespace_seconds, 300);
        assert!(config.insecure_join);
        assert!(config.standard_user.enabled);
        assert_eq!(config.standard_user.global_role, "user");
        let provider = config.provider(ProviderKind::DigitalOcean).unwrap();
        assert_eq!(provider.credential.get("accessToken").map(String::as_str), Some("tok"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> =
            HashMap::from([(DIST_ENV, "RKE2"), (AGENT_VERSION_ENV, " v0.3.9 ")]);
        let mut config = HarnessConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.distribution, Distribution::Rke2);
        assert_eq!(config.expected_agent_version.as_deref(), Some("v0.3.9"));
    }

    #[test]
    fn test_unknown_distribution_rejected() {
        let mut config = HarnessConfig::default();
        let result = config.apply_env_overrides(|key| (key == DIST_ENV).then(|| "rke3".to_string()));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HarnessConfig {
            parallelism: 0,
            ..HarnessConfig::default()
        };
        assert!(config.validate().is_err());

        config.parallelism = 1;
        config.cnis = vec![" ".to_string()];
        assert!(config.validate().is_err());

        config.cnis.clear();
        let provider = ProviderConfig {
            kind: ProviderKind::Aws,
            credential: BTreeMap::new(),
            machine_config: BTreeMap::new(),
        };
        config.providers = vec![provider.clone(), provider];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_custom_kubernetes_version_falls_back_to_matrix() {
        let mut config = HarnessConfig {
            kubernetes_versions: vec!["v1.30.4+k3s1".to_string()],
            ..HarnessConfig::default()
        };
        assert_eq!(config.custom_kubernetes_version(), Some("v1.30.4+k3s1"));
        config.default_kubernetes_version = Some("v1.31.1+k3s1".to_string());
        assert_eq!(config.custom_kubernetes_version(), Some("v1.31.1+k3s1"));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = HarnessConfig::from_file(Path::new("/nonexistent/harness.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    #[serial]
    fn test_load_reads_path_from_env() {
        let path = std::env::temp_dir().join(format!("harness-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "parallelism: 3\ndistribution: k3s\n").unwrap();
        unsafe {
            std::env::set_var(CONFIG_ENV, &path);
            std::env::remove_var(DIST_ENV);
            std::env::remove_var(AGENT_VERSION_ENV);
        }

        let config = HarnessConfig::load(None).unwrap();
        assert_eq!(config.parallelism, 3);
        assert_eq!(config.distribution, Distribution::K3s);

        unsafe {
            std::env::remove_var(CONFIG_ENV);
        }
        std::fs::remove_file(&path).unwrap();
    }
}
