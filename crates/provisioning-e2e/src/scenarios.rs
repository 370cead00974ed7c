//! End-to-end flows built from the lower layers.
//!
//! - custom clusters: simulated nodes join a cluster without machine pools
//! - node-driver clusters: the control plane creates machines from a provider
//! - the system agent version setting

use crate::bootstrap::{BootstrapScript, NodeTaint, TaintEffect};
use crate::cluster::{
    custom_cluster, machine_pools, node_driver_cluster, ClusterDriver, CUSTOM_CLUSTER_PREFIX,
};
use crate::config::{Distribution, HarnessConfig};
use crate::crds::setting_resource;
use crate::error::Result;
use crate::matrix::{default_templates, expand, expand_dynamic, NodeRoles};
use crate::naming::{append_random_string, machine_pool_prefix};
use crate::node::NodeLauncher;
use crate::provider::{create_machine_config, CredentialRef, NodeProvider};
use crate::session::Session;
use crate::suite::{run_isolated, CaseContext, CaseReport, SuiteContext};
use crate::verify::{VerificationError, Verifier};
use kube::api::{Api, DynamicObject};
use kube::Client;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const AGENT_VERSION_SETTING: &str = "system-agent-version";

/// One simulated node of a custom topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub roles: NodeRoles,
    pub labels: Vec<(String, String)>,
    pub taints: Vec<NodeTaint>,
}

impl NodeSpec {
    #[must_use]
    pub fn new(roles: NodeRoles) -> Self {
        Self {
            roles,
            labels: Vec::new(),
            taints: Vec::new(),
        }
    }

    #[must_use]
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn taint(mut self, taint: NodeTaint) -> Self {
        self.taints.push(taint);
        self
    }

    /// Bootstrap script joining this node with `join_command`
    #[must_use]
    pub fn script(&self, join_command: &str) -> BootstrapScript {
        let script = self
            .labels
            .iter()
            .fold(BootstrapScript::new(join_command).with_roles(self.roles), |s, (k, v)| {
                s.label(k.clone(), v.clone())
            });
        self.taints.iter().cloned().fold(script, BootstrapScript::taint)
    }
}

/// A bring-your-own-node cluster layout and what to expect from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomTopology {
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    /// Addresses every machine must report, when checked
    pub expected_addresses: Option<usize>,
    /// Distribution this topology does not run on
    pub skip_on: Option<Distribution>,
}

impl CustomTopology {
    #[must_use]
    pub fn one_node_all_roles() -> Self {
        Self {
            name: "custom one node all roles".to_string(),
            nodes: vec![NodeSpec::new(NodeRoles::ALL).label("foo", "bar").label("ball", "life")],
            expected_addresses: Some(2),
            skip_on: Some(Distribution::Rke2),
        }
    }

    #[must_use]
    pub fn three_node_all_roles() -> Self {
        Self {
            name: "custom three nodes all roles".to_string(),
            nodes: vec![NodeSpec::new(NodeRoles::ALL).label("rancher", "awesome"); 3],
            expected_addresses: None,
            skip_on: None,
        }
    }

    #[must_use]
    pub fn unique_roles() -> Self {
        let mut nodes = vec![NodeSpec::new(NodeRoles::ETCD); 3];
        nodes.push(NodeSpec::new(NodeRoles::CONTROLPLANE));
        nodes.push(NodeSpec::new(NodeRoles::WORKER));
        Self {
            name: "custom unique roles".to_string(),
            nodes,
            expected_addresses: None,
            skip_on: None,
        }
    }

    /// Three all-role nodes, the second one tainted
    #[must_use]
    pub fn three_node_with_taint() -> Self {
        let node = NodeSpec::new(NodeRoles::ALL).label("rancher", "awesome");
        Self {
            name: "custom three nodes with taint".to_string(),
            nodes: vec![
                node.clone(),
                node.clone()
                    .taint(NodeTaint::new("key", "value", TaintEffect::NoExecute)),
                node,
            ],
            expected_addresses: None,
            skip_on: Some(Distribution::Rke2),
        }
    }

    #[must_use]
    pub fn all() -> Vec<Self> {
        vec![
            Self::one_node_all_roles(),
            Self::three_node_all_roles(),
            Self::unique_roles(),
            Self::three_node_with_taint(),
        ]
    }

    /// Why this topology does not run on `distribution`, if it doesn't
    #[must_use]
    pub fn skip_reason(&self, distribution: Distribution) -> Option<String> {
        (self.skip_on == Some(distribution)).then(|| format!("not supported on {distribution}"))
    }

    #[must_use]
    pub fn scripts(&self, join_command: &str) -> Vec<BootstrapScript> {
        self.nodes.iter().map(|node| node.script(join_command)).collect()
    }
}

/// Create a custom cluster, join the topology's nodes and verify the result
#[instrument(skip_all, fields(topology = %topology.name))]
pub async fn run_custom_topology(
    client: &Client,
    config: &Arc<HarnessConfig>,
    session: &Session,
    topology: &CustomTopology,
) -> Result<()> {
    let driver = ClusterDriver::new(client.clone(), config.clone());
    let name = append_random_string(CUSTOM_CLUSTER_PREFIX);
    let handle = driver
        .create_cluster(
            session,
            &custom_cluster(&name, &config.namespace, config.custom_kubernetes_version()),
        )
        .await?;

    let command = driver.wait_for_join_command(&handle).await?;

    let scripts = topology.scripts(&command);
    let rendered: Vec<String> = scripts.iter().map(BootstrapScript::render).collect();
    let launcher = NodeLauncher::new(client.clone(), config.node_image.clone());
    let agents = launcher
        .launch_all(session, &handle.namespace, &rendered)
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
    info!(cluster = %handle, nodes = agents.len(), "All simulated nodes launched");

    driver.wait_for_create(&handle).await?;
    let machines = driver.machines(&handle).await?;

    let mut verifier = Verifier::new();
    verifier.verify_topology(&machines, &scripts, topology.expected_addresses);
    verifier.finish()?;
    Ok(())
}

/// Every custom topology, as the admin identity
pub async fn run_custom_suite(suite: &SuiteContext) -> Vec<CaseReport> {
    let config = suite.config();
    let mut reports = Vec::new();
    let mut runnable = Vec::new();
    for topology in CustomTopology::all() {
        match topology.skip_reason(config.distribution) {
            Some(reason) => reports.push(CaseReport::skipped(topology.name.clone(), reason)),
            None => runnable.push((topology.name.clone(), topology)),
        }
    }

    let client = suite.admin();
    reports.extend(
        run_isolated(runnable, config.parallelism, |topology, session| async move {
            run_custom_topology(client, config, &session, &topology).await
        })
        .await,
    );
    reports
}

/// Provision one node-driver cluster for `ctx.case` and wait for it to converge
#[instrument(skip_all, fields(case = %ctx.case.name, provider = %provider.kind()))]
pub async fn provision_node_driver_cluster(
    ctx: CaseContext,
    provider: &dyn NodeProvider,
    credential: &CredentialRef,
) -> Result<()> {
    let CaseContext {
        case,
        client,
        session,
        config,
    } = ctx;
    let name = append_random_string(provider.kind().cluster_prefix());

    let machine_config = create_machine_config(
        &client,
        &session,
        provider,
        &machine_pool_prefix(&name),
        &config.namespace,
    )
    .await?;
    let cluster = node_driver_cluster(
        &name,
        &config.namespace,
        &case.cni,
        &credential.secret_name(),
        &case.kubernetes_version,
        machine_pools(&case.nodes, &machine_config),
    );

    let driver = ClusterDriver::new(client, config);
    let handle = driver.create_cluster(&session, &cluster).await?;
    driver.wait_for_provisioning(&handle).await?;

    let mut verifier = Verifier::new();
    if handle.name != name {
        verifier.record("cluster", "name", &name, &handle.name);
    }
    verifier.finish()?;
    Ok(())
}

/// Template and dynamic-input cases for one provider.
///
/// The credential is shared by all of the provider's cases and lives on a
/// child of the suite session, released once the cases are done.
pub async fn run_node_driver_suite(suite: &SuiteContext, provider: &dyn NodeProvider) -> Vec<CaseReport> {
    let kind = provider.kind();
    let config = suite.config();
    let session = suite.session().child(format!("{kind} credential"));

    let credential = match provider.create_credential(suite.admin(), &session).await {
        Ok(credential) => credential,
        Err(e) => {
            warn!(provider = %kind, error = %e, "Could not create cloud credential");
            return vec![CaseReport::failed(format!("{kind} cloud credential"), e.to_string())];
        }
    };

    let prefixed = |mut case: crate::matrix::TestCase| {
        case.name = format!("{kind}/{}", case.name);
        case
    };
    let cases = expand(&default_templates(), &config.kubernetes_versions, &config.cnis)
        .into_iter()
        .map(prefixed)
        .collect();
    let mut reports = suite
        .run_cases(cases, |ctx| provision_node_driver_cluster(ctx, provider, &credential))
        .await;

    let dynamic = match expand_dynamic(&config.nodes_and_roles, &config.kubernetes_versions, &config.cnis) {
        crate::matrix::Expansion::Cases(cases) => {
            crate::matrix::Expansion::Cases(cases.into_iter().map(prefixed).collect())
        }
        skip => skip,
    };
    reports.extend(
        suite
            .run_expansion(&format!("{kind}/dynamic input"), dynamic, |ctx| {
                provision_node_driver_cluster(ctx, provider, &credential)
            })
            .await,
    );

    if let Err(e) = session.cleanup().await {
        reports.push(CaseReport::failed(format!("{kind} cloud credential cleanup"), e.to_string()));
    }
    reports
}

/// The setting must be non-empty and equal the expected version
pub fn check_agent_version(value: &str, expected: Option<&str>) -> std::result::Result<(), VerificationError> {
    let subject = format!("setting/{AGENT_VERSION_SETTING}");
    let mut verifier = Verifier::new();
    if value.is_empty() {
        verifier.record(&subject, "value", "a non-empty version", "<empty>");
    }
    match expected {
        Some(expected) if expected == value => {}
        Some(expected) => verifier.record(&subject, "value", expected, value),
        None => verifier.record(&subject, "value", "<unset expected version>", value),
    }
    verifier.finish()
}

pub async fn verify_system_agent_version(client: &Client, expected: Option<&str>) -> Result<()> {
    let settings: Api<DynamicObject> = Api::all_with(client.clone(), &setting_resource());
    let setting = settings.get(AGENT_VERSION_SETTING).await?;
    let value = setting
        .data
        .get("value")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    info!(value = %value, expected = ?expected, "Read system agent version");
    Ok(check_agent_version(value, expected)?)
}
