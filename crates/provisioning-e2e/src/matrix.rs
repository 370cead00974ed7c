//! # Topology Matrix Generator
//!
//! Expands role-assignment templates, Kubernetes versions and CNI plugins into
//! the concrete list of test cases. Generation is pure; execution maps over
//! the returned list elsewhere.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A node role understood by the join agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    ControlPlane,
    Etcd,
    Worker,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::ControlPlane, Role::Etcd, Role::Worker];

    /// Machine label the control plane sets to `"true"` for this role
    #[must_use]
    pub fn label_key(self) -> &'static str {
        match self {
            Self::ControlPlane => "rke.cattle.io/control-plane-role",
            Self::Etcd => "rke.cattle.io/etcd-role",
            Self::Worker => "rke.cattle.io/worker-role",
        }
    }

    /// Join command flag requesting this role
    #[must_use]
    pub fn flag(self) -> &'static str {
        match self {
            Self::ControlPlane => "--controlplane",
            Self::Etcd => "--etcd",
            Self::Worker => "--worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlPlane => write!(f, "controlplane"),
            Self::Etcd => write!(f, "etcd"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Roles requested by a single node. Any subset is valid input, including
/// the empty one; viability of the resulting cluster is what gets tested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRoles {
    #[serde(default)]
    pub controlplane: bool,
    #[serde(default)]
    pub etcd: bool,
    #[serde(default)]
    pub worker: bool,
}

impl NodeRoles {
    pub const ALL: NodeRoles = NodeRoles {
        controlplane: true,
        etcd: true,
        worker: true,
    };
    pub const CONTROLPLANE: NodeRoles = NodeRoles {
        controlplane: true,
        etcd: false,
        worker: false,
    };
    pub const ETCD: NodeRoles = NodeRoles {
        controlplane: false,
        etcd: true,
        worker: false,
    };
    pub const WORKER: NodeRoles = NodeRoles {
        controlplane: false,
        etcd: false,
        worker: true,
    };

    #[must_use]
    pub fn has(self, role: Role) -> bool {
        match role {
            Role::ControlPlane => self.controlplane,
            Role::Etcd => self.etcd,
            Role::Worker => self.worker,
        }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        !(self.controlplane || self.etcd || self.worker)
    }

    /// Join flags in the order the bootstrap script emits them
    #[must_use]
    pub fn flags(self) -> Vec<&'static str> {
        [Role::Worker, Role::Etcd, Role::ControlPlane]
            .into_iter()
            .filter(|role| self.has(*role))
            .map(Role::flag)
            .collect()
    }
}

impl fmt::Display for NodeRoles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let roles: Vec<String> = Role::ALL
            .into_iter()
            .filter(|role| self.has(*role))
            .map(|role| role.to_string())
            .collect();
        if roles.is_empty() {
            write!(f, "(no roles)")
        } else {
            write!(f, "{}", roles.join("+"))
        }
    }
}

/// Identity a case acts as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Identity {
    Admin,
    StandardUser,
}

impl Identity {
    pub const ALL: [Identity; 2] = [Identity::Admin, Identity::StandardUser];
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => write!(f, "Admin User"),
            Self::StandardUser => write!(f, "Standard User"),
        }
    }
}

/// Named role assignment for every node of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTemplate {
    pub name: String,
    pub nodes: Vec<NodeRoles>,
}

impl RoleTemplate {
    #[must_use]
    pub fn new(name: impl Into<String>, nodes: Vec<NodeRoles>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }
}

/// One independent sub-test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    /// Template the case came from; `None` for dynamic input
    pub template: Option<String>,
    pub nodes: Vec<NodeRoles>,
    pub kubernetes_version: String,
    pub cni: String,
    pub identity: Identity,
}

/// Result of expanding externally supplied input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    Cases(Vec<TestCase>),
    /// Nothing to run; reported as skipped, never as failed
    Skip { reason: String },
}

impl Expansion {
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip { .. })
    }

    /// Cases to run, empty when skipped
    #[must_use]
    pub fn into_cases(self) -> Vec<TestCase> {
        match self {
            Self::Cases(cases) => cases,
            Self::Skip { .. } => Vec::new(),
        }
    }
}

/// Sub-test name: `"[<template> ]<identity> Kubernetes version: <v> cni: <c>"`
#[must_use]
pub fn case_name(template: Option<&str>, identity: Identity, version: &str, cni: &str) -> String {
    match template {
        Some(template) => format!("{template} {identity} Kubernetes version: {version} cni: {cni}"),
        None => format!("{identity} Kubernetes version: {version} cni: {cni}"),
    }
}

/// Templates × identities × versions × CNIs, in that nesting order
#[must_use]
pub fn expand(templates: &[RoleTemplate], versions: &[String], cnis: &[String]) -> Vec<TestCase> {
    let mut cases =
        Vec::with_capacity(templates.len() * Identity::ALL.len() * versions.len() * cnis.len());
    for template in templates {
        cases.extend(expand_one(Some(&template.name), &template.nodes, versions, cnis));
    }
    cases
}

/// Expansion for the dynamic-input path; an empty role list means skip
#[must_use]
pub fn expand_dynamic(nodes: &[NodeRoles], versions: &[String], cnis: &[String]) -> Expansion {
    if nodes.is_empty() {
        return Expansion::Skip {
            reason: "no nodesAndRoles input supplied".to_string(),
        };
    }
    Expansion::Cases(expand_one(None, nodes, versions, cnis))
}

fn expand_one(
    template: Option<&str>,
    nodes: &[NodeRoles],
    versions: &[String],
    cnis: &[String],
) -> Vec<TestCase> {
    let mut cases = Vec::new();
    for identity in Identity::ALL {
        for version in versions {
            for cni in cnis {
                cases.push(TestCase {
                    name: case_name(template, identity, version, cni),
                    template: template.map(str::to_string),
                    nodes: nodes.to_vec(),
                    kubernetes_version: version.clone(),
                    cni: cni.clone(),
                    identity,
                });
            }
        }
    }
    cases
}

/// The two standard topologies: one node with every role, and one role per node
#[must_use]
pub fn default_templates() -> Vec<RoleTemplate> {
    vec![
        RoleTemplate::new("1 Node all roles", vec![NodeRoles::ALL]),
        RoleTemplate::new(
            "3 nodes - 1 role per node",
            vec![NodeRoles::CONTROLPLANE, NodeRoles::ETCD, NodeRoles::WORKER],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn test_flags_follow_worker_etcd_controlplane_order() {
        assert_eq!(
            NodeRoles::ALL.flags(),
            vec!["--worker", "--etcd", "--controlplane"]
        );
        assert_eq!(NodeRoles::ETCD.flags(), vec!["--etcd"]);
        assert!(NodeRoles::default().flags().is_empty());
    }

    #[test]
    fn test_node_roles_deserialize_from_role_map() {
        let roles: Vec<NodeRoles> =
            serde_json::from_str(r#"[{"controlplane":true,"etcd":false,"worker":false},{"worker":true}]"#)
                .unwrap();
        assert_eq!(roles, vec![NodeRoles::CONTROLPLANE, NodeRoles::WORKER]);
    }

    #[test]
    fn test_case_names_do_not_accumulate_across_cnis() {
        let cases = expand(
            &default_templates()[..1],
            &strings(&["v1.30.4+rke2r1"]),
            &strings(&["calico", "cilium"]),
        );
        let names: Vec<&str> = cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "1 Node all roles Admin User Kubernetes version: v1.30.4+rke2r1 cni: calico",
                "1 Node all roles Admin User Kubernetes version: v1.30.4+rke2r1 cni: cilium",
                "1 Node all roles Standard User Kubernetes version: v1.30.4+rke2r1 cni: calico",
                "1 Node all roles Standard User Kubernetes version: v1.30.4+rke2r1 cni: cilium",
            ]
        );
    }

    #[test]
    fn test_dynamic_names_have_no_template_prefix() {
        let expansion = expand_dynamic(&[NodeRoles::ALL], &strings(&["v1"]), &strings(&["canal"]));
        let cases = expansion.into_cases();
        assert_eq!(cases[0].name, "Admin User Kubernetes version: v1 cni: canal");
        assert_eq!(cases[0].template, None);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(NodeRoles::ALL.to_string(), "controlplane+etcd+worker");
        assert_eq!(NodeRoles::default().to_string(), "(no roles)");
    }
}
